//! Fatal-exception screen: register dump, keyboard acknowledgement,
//! recovery.
//!
//! Divide-error and invalid-opcode land in naked stubs that capture the
//! full register set. The dump is recorded for `get_register_snapshot`,
//! printed, and the system waits for `r` with every IRQ except the
//! keyboard masked. Afterwards the faulting process is killed, or, if it
//! is protected, restarted from its entry point.

use spin::Mutex;

use super::idt;
use crate::drivers::keyboard::{self, scancodes::KeyCode};
use crate::process;
use crate::scheduler::context::{self, InterruptFrame};
use crate::{print, println};

pub const SNAPSHOT_REGISTERS: usize = 18;

const DIVIDE_ERROR_VECTOR: u64 = 0;
const INVALID_OPCODE_VECTOR: u64 = 6;

const REGISTER_NAMES: [&str; SNAPSHOT_REGISTERS] = [
    "rax", "rbx", "rcx", "rdx", "rbp", "rdi", "rsi", "r8 ", "r9 ", "r10", "r11", "r12", "r13",
    "r14", "r15", "rsp", "rip", "rflags",
];

static SNAPSHOT: Mutex<Option<[u64; SNAPSHOT_REGISTERS]>> = Mutex::new(None);

/// Latest exception register dump, if any was taken.
pub fn register_snapshot() -> Option<[u64; SNAPSHOT_REGISTERS]> {
    *SNAPSHOT.lock()
}

fn capture_snapshot(frame: &InterruptFrame) -> [u64; SNAPSHOT_REGISTERS] {
    let snapshot = [
        frame.rax, frame.rbx, frame.rcx, frame.rdx, frame.rbp, frame.rdi, frame.rsi, frame.r8,
        frame.r9, frame.r10, frame.r11, frame.r12, frame.r13, frame.r14, frame.r15, frame.rsp,
        frame.rip, frame.rflags,
    ];
    *SNAPSHOT.lock() = Some(snapshot);
    snapshot
}

extern "C" fn exception_dispatcher(frame: &mut InterruptFrame, vector: u64) {
    let snapshot = capture_snapshot(frame);

    crate::video::clear_screen();
    match vector {
        DIVIDE_ERROR_VECTOR => {
            crate::video::set_text_color(0x00FF_0000);
            crate::video::set_font_size(3);
            println!("Division exception");
        }
        INVALID_OPCODE_VECTOR => {
            crate::video::set_text_color(0x00FF_6600);
            crate::video::set_font_size(3);
            println!("Invalid opcode exception");
        }
        _ => {
            crate::video::set_text_color(0x00FF_0000);
            crate::video::set_font_size(3);
            println!("Exception");
        }
    }
    crate::video::set_font_size(2);
    println!("Exception (# {}) triggered", vector);
    println!("Current register values are:");

    for (name, value) in REGISTER_NAMES.iter().zip(snapshot.iter()) {
        println!("{}: {:#018x}", name, value);
    }

    crate::video::set_text_color(crate::video::DEFAULT_TEXT_COLOR);
    print!("Press r to go back to the shell");

    wait_for_acknowledgement();
    recover(frame);
}

/// Hold the machine with only keyboard interrupts live until the user
/// presses `r`.
fn wait_for_acknowledgement() {
    idt::mask_all_but_keyboard();
    loop {
        crate::arch::enable_and_halt();
        crate::arch::disable_interrupts();
        if let Some(KeyCode::Char('r')) = keyboard::try_read_key() {
            break;
        }
    }
    idt::restore_running_mask();
    println!();
}

/// Kill the faulting process, or relaunch it from a fresh stack frame when
/// it is one of the protected pids.
fn recover(frame: &mut InterruptFrame) {
    let Some(pid) = process::get_current_pid() else {
        return;
    };

    // Killing the running process yields away; this returns only for the
    // protected pids.
    if process::kill(pid) == 0 {
        return;
    }

    let stack_top = process::with_process(pid, |p| {
        (p.stack_base() + crate::process::PROCESS_STACK_SIZE as u64) & !0xF
    });
    if let Some(stack_top) = stack_top {
        frame.rip = context::task_launcher as usize as u64;
        frame.rdi = pid as u64;
        frame.rsp = stack_top;
    }
}

#[unsafe(naked)]
pub extern "C" fn divide_error_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "mov rsi, 0",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym exception_dispatcher,
    );
}

#[unsafe(naked)]
pub extern "C" fn invalid_opcode_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "mov rsi, 6",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym exception_dispatcher,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_recorded_in_display_order() {
        let mut frame = InterruptFrame {
            r15: 15,
            r14: 14,
            r13: 13,
            r12: 12,
            r11: 11,
            r10: 10,
            r9: 9,
            r8: 8,
            rsi: 7,
            rdi: 6,
            rbp: 5,
            rdx: 4,
            rcx: 3,
            rbx: 2,
            rax: 1,
            rip: 0x1000,
            cs: 0x8,
            rflags: 0x202,
            rsp: 0x2000,
            ss: 0,
        };
        let snapshot = capture_snapshot(&mut frame);

        assert_eq!(snapshot[0], 1); // rax
        assert_eq!(snapshot[4], 5); // rbp
        assert_eq!(snapshot[7], 8); // r8
        assert_eq!(snapshot[15], 0x2000); // rsp
        assert_eq!(snapshot[16], 0x1000); // rip
        assert_eq!(snapshot[17], 0x202); // rflags
        assert_eq!(register_snapshot(), Some(snapshot));
    }
}
