//! Syscall dispatch.
//!
//! Userland raises `int 0x80` with the syscall code in rax and arguments in
//! rdi/rsi/rdx/rcx. The gate stub hands the saved register frame here; the
//! result is patched into the frame's rax slot before `iretq`.

use crate::drivers::{keyboard, speaker, time};
use crate::ipc::endpoint::{self, PipeEndpointType, READ_FD, WRITE_FD};
use crate::ipc::pipe;
use crate::memory;
use crate::process::{self, Pid, Priority, ProcessInformation, TaskEntry};
use crate::scheduler;
use crate::sync::semaphore;
use crate::video;

pub type Registers = crate::scheduler::context::InterruptFrame;

const MAX_IO_LENGTH: u64 = 1024 * 1024;
const MAX_ARGS_ALLOWED: u64 = 64;

pub fn dispatch(frame: &mut Registers) {
    frame.rax = route(frame) as u64;
}

fn route(frame: &Registers) -> i64 {
    let (arg0, arg1, arg2, arg3) = (frame.rdi, frame.rsi, frame.rdx, frame.rcx);

    match frame.rax {
        3 => sys_read(arg0, arg1 as *mut u8, arg2),
        4 => sys_write(arg0, arg1 as *const u8, arg2),

        0x80000000 => speaker::start_beep(arg0 as u32),
        0x80000001 => speaker::stop_beep(),
        0x80000002 => video::set_text_color(arg0 as u32),
        0x80000003 => video::set_background_color(arg0 as u32),
        0x80000004..=0x80000006 => -1, // reserved for italics/bold/underline
        0x80000007 => video::decrease_font_size(),
        0x80000008 => video::increase_font_size(),
        0x80000009 => video::set_font_size(arg0 as u8),
        0x8000000A => video::clear_screen(),
        0x8000000B => keyboard::clear_input_buffer(),

        0x80000010 => sys_time_component(arg0 as *mut i32, time::rtc_hour()),
        0x80000011 => sys_time_component(arg0 as *mut i32, time::rtc_minute()),
        0x80000012 => sys_time_component(arg0 as *mut i32, time::rtc_second()),

        0x80000019 => video::draw_circle(
            arg0 as u32,
            arg1 as usize,
            arg2 as usize,
            arg3 as usize,
        ),
        0x80000020 => video::draw_rectangle(
            arg0 as u32,
            arg1 as usize,
            arg2 as usize,
            arg3 as usize,
            frame.r8 as usize,
        ),
        0x80000021 => video::fill_screen(arg0 as u32),

        0x800000A0 => sys_exec(arg0),

        0x800000B0 => keyboard::register_key(arg0 as u8, arg1),

        0x800000C0 => video::window_width(),
        0x800000C1 => video::window_height(),

        0x800000D0 => time::sleep_millis(arg0),

        0x800000E0 => sys_get_register_snapshot(arg0 as *mut i64),

        0x800000F0 => keyboard::get_char_no_display(),

        0x80000100 => memory::kmalloc(arg0 as usize) as i64,
        0x80000101 => sys_free(arg0 as *mut u8),
        0x80000102 => sys_memstats(arg0 as *mut i32, arg1 as *mut i32, arg2 as *mut i32),

        0x80000200 => sys_getpid(),
        0x80000201 => sys_create_process(arg0, arg1, arg2 as *const *const u8, arg3),
        0x80000202 => sys_unblock(arg0 as i64),
        0x80000203 => sys_block(arg0 as i64),
        0x80000204 => sys_kill(arg0 as i64),
        0x80000205 => sys_ps(arg0 as *mut ProcessInformation),
        0x80000206 => sys_nice(arg0 as i64, arg1 as i64),
        0x80000207 => sys_wait_pid(arg0 as i64),
        0x80000208 => {
            scheduler::yield_now();
            0
        }
        0x80000209 => process::wait_children(),
        0x8000020A => sys_get_process_info(arg0 as i64, arg1 as *mut ProcessInformation),

        0x80000300 => sys_sem_init(arg0 as *const u8, arg1 as u32),
        0x80000301 => sys_sem_post(arg0),
        0x80000302 => sys_sem_wait(arg0),
        0x80000303 => sys_sem_destroy(arg0),

        0x80000400 => sys_pipe(arg0 as *mut i32),
        0x80000401 => sys_close_pipe(arg0 as i64),
        0x80000402 => sys_set_fd_target(arg0 as i64, arg1 as i64, arg2 as i64),

        _ => 0,
    }
}

fn valid_pid_arg(pid: i64) -> Option<Pid> {
    if pid < 0 || pid as usize >= process::MAX_PROCESSES {
        return None;
    }
    Some(pid as Pid)
}

/// Pids userland may never kill or block: idle, init and the shell.
fn user_protected_pid(pid: Pid) -> bool {
    pid == process::IDLE_PROCESS_PID
        || pid == process::INIT_PROCESS_PID
        || pid == process::SHELL_PROCESS_PID
}

fn sys_read(fd: u64, buf: *mut u8, count: u64) -> i64 {
    if fd != READ_FD as u64 || buf.is_null() || count == 0 || count > MAX_IO_LENGTH {
        return -1;
    }
    let current = match process::get_current_pid() {
        Some(current) => current,
        None => return -1,
    };

    let endpoint = match process::with_process(current, |p| p.fds[READ_FD]) {
        Some(endpoint) => endpoint,
        None => return -1,
    };
    let slice = unsafe { core::slice::from_raw_parts_mut(buf, count as usize) };

    match endpoint.kind {
        PipeEndpointType::Console => keyboard::console_read(slice),
        PipeEndpointType::Pipe => endpoint::endpoint_read(&endpoint, slice),
        PipeEndpointType::None => -1,
    }
}

/// Writes through the caller's write endpoint. fd 0 is accepted and reaches
/// the console as well; downstream tooling relies on that echo.
fn sys_write(fd: u64, buf: *const u8, count: u64) -> i64 {
    if fd > 2 || buf.is_null() || count == 0 || count > MAX_IO_LENGTH {
        return -1;
    }
    let current = match process::get_current_pid() {
        Some(current) => current,
        None => return -1,
    };

    let endpoint = match process::with_process(current, |p| p.fds[WRITE_FD]) {
        Some(endpoint) => endpoint,
        None => return -1,
    };
    let slice = unsafe { core::slice::from_raw_parts(buf, count as usize) };

    match endpoint.kind {
        PipeEndpointType::Console => video::console_write(slice),
        PipeEndpointType::Pipe => endpoint::endpoint_write(&endpoint, slice),
        PipeEndpointType::None => -1,
    }
}

fn sys_time_component(out: *mut i32, value: i64) -> i64 {
    if out.is_null() {
        return -1;
    }
    unsafe {
        *out = value as i32;
    }
    0
}

fn sys_exec(function: u64) -> i64 {
    if function == 0 {
        return -1;
    }
    let entry: extern "C" fn() -> i64 = unsafe { core::mem::transmute(function as usize) };
    entry()
}

fn sys_get_register_snapshot(out: *mut i64) -> i64 {
    if out.is_null() {
        return 0;
    }
    match crate::interrupts::exceptions::register_snapshot() {
        Some(snapshot) => {
            for (i, value) in snapshot.iter().enumerate() {
                unsafe {
                    *out.add(i) = *value as i64;
                }
            }
            1
        }
        None => 0,
    }
}

fn sys_free(ptr: *mut u8) -> i64 {
    if memory::is_valid_heap_ptr(ptr) {
        memory::kfree(ptr);
        1
    } else {
        0
    }
}

fn sys_memstats(total: *mut i32, used: *mut i32, available: *mut i32) -> i64 {
    if total.is_null() || used.is_null() || available.is_null() {
        return -1;
    }
    let (total_bytes, used_bytes, available_bytes) = memory::memstats();
    unsafe {
        *total = total_bytes as i32;
        *used = used_bytes as i32;
        *available = available_bytes as i32;
    }
    0
}

fn sys_getpid() -> i64 {
    match process::get_current_pid() {
        Some(pid) => pid as i64,
        None => -1,
    }
}

fn sys_create_process(
    entry: u64,
    argc: u64,
    argv: *const *const u8,
    is_background: u64,
) -> i64 {
    if entry == 0 || argc > MAX_ARGS_ALLOWED || (argc > 0 && argv.is_null()) {
        return -1;
    }

    let mut args: alloc::vec::Vec<&str> = alloc::vec::Vec::with_capacity(argc as usize);
    for i in 0..argc as usize {
        let arg_ptr = unsafe { *argv.add(i) };
        if arg_ptr.is_null() {
            break;
        }
        let arg = unsafe { core::ffi::CStr::from_ptr(arg_ptr as *const i8) };
        match arg.to_str() {
            Ok(arg) => args.push(arg),
            Err(_) => return -1,
        }
    }

    match process::create_process(
        TaskEntry::Module(entry),
        &args,
        Priority::Mid,
        process::get_current_pid(),
        is_background != 0,
    ) {
        Some(pid) => pid as i64,
        None => -1,
    }
}

fn sys_unblock(pid: i64) -> i64 {
    match valid_pid_arg(pid) {
        Some(pid) => process::unblock(pid),
        None => -1,
    }
}

fn sys_block(pid: i64) -> i64 {
    match valid_pid_arg(pid) {
        Some(pid) if !user_protected_pid(pid) => process::block(pid),
        _ => -1,
    }
}

fn sys_kill(pid: i64) -> i64 {
    match valid_pid_arg(pid) {
        Some(pid) if !user_protected_pid(pid) => process::kill(pid),
        _ => -1,
    }
}

fn sys_ps(table: *mut ProcessInformation) -> i64 {
    if table.is_null() {
        return -1;
    }
    let mut count = 0usize;
    for pid in 0..process::MAX_PROCESSES {
        if let Some(info) = process::get_process_info(pid) {
            unsafe {
                *table.add(count) = info;
            }
            count += 1;
        }
    }
    count as i64
}

fn sys_nice(pid: i64, new_priority: i64) -> i64 {
    let pid = match valid_pid_arg(pid) {
        Some(pid) => pid,
        None => return -1,
    };
    if new_priority < 0 {
        return -1;
    }
    match Priority::from_index(new_priority as usize) {
        Some(priority) => process::nice(pid, priority),
        None => -1,
    }
}

fn sys_wait_pid(pid: i64) -> i64 {
    match valid_pid_arg(pid) {
        Some(pid) => process::wait_pid(pid),
        None => -1,
    }
}

fn sys_get_process_info(pid: i64, out: *mut ProcessInformation) -> i64 {
    if out.is_null() {
        return -1;
    }
    let pid = match valid_pid_arg(pid) {
        Some(pid) => pid,
        None => return -1,
    };
    match process::get_process_info(pid) {
        Some(info) => {
            unsafe {
                *out = info;
            }
            0
        }
        None => -1,
    }
}

fn sys_sem_init(name: *const u8, initial_count: u32) -> i64 {
    if name.is_null() {
        return 0;
    }
    let name = unsafe { core::ffi::CStr::from_ptr(name as *const i8) };
    let name = match name.to_str() {
        Ok(name) => name,
        Err(_) => return 0,
    };
    match semaphore::sem_init(name, initial_count) {
        Some(sem) => alloc::sync::Arc::as_ptr(&sem) as i64,
        None => 0,
    }
}

fn sys_sem_post(handle: u64) -> i64 {
    match semaphore::lookup_handle(handle) {
        Some(sem) => semaphore::post(&sem),
        None => -1,
    }
}

fn sys_sem_wait(handle: u64) -> i64 {
    match semaphore::lookup_handle(handle) {
        Some(sem) => semaphore::wait(&sem),
        None => -1,
    }
}

fn sys_sem_destroy(handle: u64) -> i64 {
    match semaphore::lookup_handle(handle) {
        Some(sem) => {
            semaphore::destroy(&sem);
            0
        }
        None => -1,
    }
}

/// One pipe id serves both slots: the shell wires the writer's stdout and
/// the reader's stdin to the same pipe.
fn sys_pipe(out: *mut i32) -> i64 {
    if out.is_null() {
        return -1;
    }
    match pipe::open_pipe() {
        Some(id) => {
            unsafe {
                *out.add(READ_FD) = id as i32;
                *out.add(WRITE_FD) = id as i32;
            }
            0
        }
        None => -1,
    }
}

fn sys_close_pipe(pipe_id: i64) -> i64 {
    if pipe_id < 0 {
        return -1;
    }
    pipe::close_pipe(pipe_id as usize)
}

fn sys_set_fd_target(fd: i64, kind: i64, pipe_id: i64) -> i64 {
    let kind = match kind {
        0 => PipeEndpointType::None,
        1 => PipeEndpointType::Console,
        2 => PipeEndpointType::Pipe,
        _ => return -1,
    };
    let pipe_id = if pipe_id < 0 {
        None
    } else {
        Some(pipe_id as usize)
    };

    let current = match process::get_current_pid() {
        Some(current) => current,
        None => return -1,
    };

    // Endpoint rebinding touches the pipe and semaphore layers, so it works
    // on a copy of the table and writes the result back.
    let mut fds = match process::with_process(current, |p| p.fds) {
        Some(fds) => fds,
        None => return -1,
    };

    let result = match fd {
        0 => endpoint::set_read_target(&mut fds, kind, pipe_id),
        1 => endpoint::set_write_target(&mut fds, kind, pipe_id),
        _ => -1,
    };

    if result == 0 {
        process::with_process(current, |p| p.fds = fds);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    extern "C" fn spin_entry(_argc: u64, _argv: *const *const u8) -> i64 {
        0
    }

    fn reset_world() {
        crate::process::reset();
        crate::scheduler::reset();
        crate::sync::semaphore::reset();
        crate::ipc::pipe::reset();
    }

    fn frame(rax: u64, rdi: u64, rsi: u64, rdx: u64, rcx: u64) -> Registers {
        Registers {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rsi,
            rdi,
            rbp: 0,
            rdx,
            rcx,
            rbx: 0,
            rax,
            rip: 0,
            cs: 0x8,
            rflags: 0x202,
            rsp: 0,
            ss: 0,
        }
    }

    fn call(rax: u64, rdi: u64, rsi: u64, rdx: u64, rcx: u64) -> i64 {
        let mut registers = frame(rax, rdi, rsi, rdx, rcx);
        dispatch(&mut registers);
        registers.rax as i64
    }

    #[test]
    #[serial]
    fn unknown_codes_return_zero() {
        reset_world();
        assert_eq!(call(0xDEAD, 0, 0, 0, 0), 0);
    }

    #[test]
    #[serial]
    fn getpid_without_scheduler_is_an_error() {
        reset_world();
        assert_eq!(call(0x80000200, 0, 0, 0, 0), -1);
    }

    #[test]
    #[serial]
    fn getpid_reports_the_running_process() {
        reset_world();
        let p = crate::process::create_process(
            TaskEntry::Function(spin_entry),
            &["p"],
            Priority::Mid,
            None,
            true,
        )
        .unwrap();
        crate::scheduler::schedule(0x100);
        assert_eq!(call(0x80000200, 0, 0, 0, 0), p as i64);
    }

    #[test]
    #[serial]
    fn malloc_free_roundtrip() {
        reset_world();
        crate::memory::init();
        let ptr = call(0x80000100, 128, 0, 0, 0);
        assert_ne!(ptr, 0);

        // Valid pointer frees once; the second attempt reports failure.
        assert_eq!(call(0x80000101, ptr as u64, 0, 0, 0), 1);
        assert_eq!(call(0x80000101, ptr as u64, 0, 0, 0), 0);
    }

    #[test]
    #[serial]
    fn memstats_reports_arena_size() {
        reset_world();
        crate::memory::init();
        let mut total: i32 = 0;
        let mut used: i32 = 0;
        let mut available: i32 = 0;
        let result = call(
            0x80000102,
            &mut total as *mut i32 as u64,
            &mut used as *mut i32 as u64,
            &mut available as *mut i32 as u64,
            0,
        );
        assert_eq!(result, 0);
        assert_eq!(total, crate::memory::bitmap::HEAP_SIZE as i32);
        assert_eq!(total, used + available);
    }

    #[test]
    #[serial]
    fn sem_syscalls_operate_through_handles() {
        reset_world();
        let name = b"gate\0";
        let handle = call(0x80000300, name.as_ptr() as u64, 2, 0, 0);
        assert_ne!(handle, 0);

        assert_eq!(call(0x80000302, handle as u64, 0, 0, 0), 0); // wait: 2 -> 1
        assert_eq!(call(0x80000301, handle as u64, 0, 0, 0), 0); // post: 1 -> 2
        assert_eq!(call(0x80000303, handle as u64, 0, 0, 0), 0); // destroy
        assert_eq!(call(0x80000301, handle as u64, 0, 0, 0), -1); // stale handle
    }

    #[test]
    #[serial]
    fn pipe_syscall_fills_both_fds_with_one_id() {
        reset_world();
        let mut fds: [i32; 2] = [-1, -1];
        assert_eq!(call(0x80000400, fds.as_mut_ptr() as u64, 0, 0, 0), 0);
        assert_eq!(fds[0], fds[1]);
        assert!(fds[0] >= 0);
        assert_eq!(call(0x80000401, fds[0] as u64, 0, 0, 0), 0);
    }

    #[test]
    #[serial]
    fn fd_rebinding_and_pipe_io_through_syscalls() {
        reset_world();
        let writer = crate::process::create_process(
            TaskEntry::Function(spin_entry),
            &["writer"],
            Priority::Mid,
            None,
            true,
        )
        .unwrap();
        crate::scheduler::schedule(0x100);
        assert_eq!(crate::scheduler::current_pid(), Some(writer));

        let mut fds: [i32; 2] = [-1, -1];
        assert_eq!(call(0x80000400, fds.as_mut_ptr() as u64, 0, 0, 0), 0);
        let id = fds[1] as u64;

        // Bind stdout to the pipe, write, then read the bytes back.
        assert_eq!(call(0x80000402, 1, 2, id, 0), 0);
        let payload = b"hola";
        assert_eq!(
            call(4, 1, payload.as_ptr() as u64, payload.len() as u64, 0),
            4
        );

        assert_eq!(call(0x80000402, 0, 2, id, 0), 0);
        let mut read_buf = [0u8; 4];
        assert_eq!(
            call(3, 0, read_buf.as_mut_ptr() as u64, 4, 0),
            4
        );
        assert_eq!(&read_buf, payload);
    }

    #[test]
    #[serial]
    fn user_cannot_kill_protected_pids() {
        reset_world();
        assert_eq!(call(0x80000204, 0, 0, 0, 0), -1);
        assert_eq!(call(0x80000204, 1, 0, 0, 0), -1);
        assert_eq!(call(0x80000204, 2, 0, 0, 0), -1);
        assert_eq!(call(0x80000203, 2, 0, 0, 0), -1);
    }

    #[test]
    #[serial]
    fn ps_counts_live_processes() {
        reset_world();
        for name in ["a", "b", "c"] {
            crate::process::create_process(
                TaskEntry::Function(spin_entry),
                &[name],
                Priority::Mid,
                None,
                true,
            )
            .unwrap();
        }
        let mut table = [crate::process::ProcessInformation {
            pid: 0,
            name: [0; crate::process::PROCESS_NAME_MAX_LENGTH],
            priority: 0,
            state: 0,
            rsp: 0,
            stack_base: 0,
            is_foreground: 0,
        }; crate::process::MAX_PROCESSES];
        assert_eq!(call(0x80000205, table.as_mut_ptr() as u64, 0, 0, 0), 3);
        assert_eq!(table[1].pid, 1);
    }

    #[test]
    #[serial]
    fn rtc_syscalls_write_through_pointers() {
        reset_world();
        let mut hour: i32 = -1;
        assert_eq!(call(0x80000010, &mut hour as *mut i32 as u64, 0, 0, 0), 0);
        assert_eq!(hour, 12); // fixed RTC value in hosted tests
    }
}
