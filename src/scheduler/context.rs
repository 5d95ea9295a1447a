//! Initial stack frame construction for new processes.
//!
//! The timer interrupt handler pushes the 15 general-purpose registers on
//! top of the CPU-pushed interrupt frame, hands the resulting stack pointer
//! to `schedule`, and pops whatever frame comes back before `iretq`. A new
//! process therefore starts life as a fabricated frame of the same shape:
//! popping it "returns" into the launch trampoline with the pid in `rdi`.

use crate::process;

/// Register layout on the stack after the interrupt entry pushes, lowest
/// address first, followed by the CPU interrupt frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const KERNEL_CODE_SELECTOR: u64 = 0x8;
const INITIAL_RFLAGS: u64 = 0x202; // IF set

/// Write the initial frame at the top of `stack` and return the rsp the
/// scheduler should load to start the process.
pub fn build_initial_frame(stack: &mut [u8], pid: u64) -> u64 {
    let stack_top = (stack.as_ptr() as u64 + stack.len() as u64) & !0xF;
    let frame_addr = stack_top - core::mem::size_of::<InterruptFrame>() as u64;

    let frame = InterruptFrame {
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rsi: 0,
        rdi: pid,
        rbp: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: 0,
        rip: task_launcher as usize as u64,
        cs: KERNEL_CODE_SELECTOR,
        rflags: INITIAL_RFLAGS,
        rsp: stack_top,
        ss: 0,
    };

    unsafe {
        core::ptr::write(frame_addr as *mut InterruptFrame, frame);
    }
    frame_addr
}

/// First code a new process executes. Resolves the typed entry point and
/// argv from the PCB, runs it, and terminates the process when it returns.
pub extern "C" fn task_launcher(pid: u64) -> ! {
    let pid = pid as process::Pid;
    let status = match process::launch_parameters(pid) {
        Some((entry, argc, argv)) => match entry {
            process::TaskEntry::Function(function) => function(argc, argv),
            process::TaskEntry::Module(address) => {
                let function: extern "C" fn(u64, *const *const u8) -> i64 =
                    unsafe { core::mem::transmute(address as usize) };
                function(argc, argv)
            }
        },
        None => -1,
    };
    process::exit_current(status);
}
