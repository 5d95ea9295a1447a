//! Process table and lifecycle.
//!
//! A fixed array of 64 PCB slots plus the operations that move processes
//! through Ready / Running / Blocked / Terminated: creation with argv
//! copying and initial stack frame construction, kill with deferred reaping
//! for the running process, block/unblock, joins over the per-process wait
//! semaphore, foreground tracking and orphan reparenting.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch;
use crate::collections::Queue;
use crate::ipc::endpoint::{self, PipeEndpoint, PIPE_FD_COUNT};
use crate::scheduler::{self, context};
use crate::sync::semaphore::{self, SemaphoreHandle};

pub type Pid = usize;

pub const MAX_PROCESSES: usize = 64;
pub const IDLE_PROCESS_PID: Pid = 0;
pub const INIT_PROCESS_PID: Pid = 1;
pub const SHELL_PROCESS_PID: Pid = 2;
pub const PROCESS_STACK_SIZE: usize = 4096;
pub const PROCESS_NAME_MAX_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Min = 0,
    Mid = 1,
    Max = 2,
}

impl Priority {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Priority> {
        match index {
            0 => Some(Priority::Min),
            1 => Some(Priority::Mid),
            2 => Some(Priority::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

impl ProcessState {
    pub fn as_i32(self) -> i32 {
        match self {
            ProcessState::Ready => 0,
            ProcessState::Running => 1,
            ProcessState::Blocked => 2,
            ProcessState::Terminated => 3,
        }
    }
}

/// Typed process entry point: either a kernel function or a userland binary
/// placed at a fixed address by the bootloader.
#[derive(Debug, Clone, Copy)]
pub enum TaskEntry {
    Function(extern "C" fn(argc: u64, argv: *const *const u8) -> i64),
    Module(u64),
}

/// One process control block.
pub struct Process {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub name: String,
    pub priority: Priority,
    pub state: ProcessState,
    pub entry: TaskEntry,
    /// NUL-terminated argv copies owned by this PCB.
    argv_storage: Vec<Vec<u8>>,
    /// Pointers into `argv_storage` plus a trailing null, C style.
    argv_ptrs: Vec<*const u8>,
    /// Owned stack; stays mapped until the scheduler has switched away.
    stack: Box<[u8]>,
    pub rsp: u64,
    pub is_background: bool,
    pub is_foreground: bool,
    pub waiting_for_child: Option<Pid>,
    pub children: Queue<Pid>,
    /// Joiners block here; posted once per waiter when the process dies.
    pub wait_sem: SemaphoreHandle,
    pub fds: [PipeEndpoint; PIPE_FD_COUNT],
}

// Raw argv pointers refer to heap buffers owned by the same PCB.
unsafe impl Send for Process {}

impl Process {
    pub fn stack_base(&self) -> u64 {
        self.stack.as_ptr() as u64
    }
}

/// Snapshot handed to `ps` and `get_process_info`, laid out for userland.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcessInformation {
    pub pid: i32,
    pub name: [u8; PROCESS_NAME_MAX_LENGTH],
    pub priority: i32,
    pub state: i32,
    pub rsp: u64,
    pub stack_base: u64,
    pub is_foreground: u8,
}

struct PcbTable {
    slots: [Option<Box<Process>>; MAX_PROCESSES],
    count: usize,
    last_pid: Option<Pid>,
    foreground: Option<Pid>,
    initialized: bool,
}

impl PcbTable {
    /// Round-robin pid allocation starting after the last assigned pid. A
    /// slot is free iff it is empty or holds a terminated process.
    fn next_free_pid(&self) -> Option<Pid> {
        let start = match self.last_pid {
            None => return Some(0),
            Some(last) => (last + 1) % MAX_PROCESSES,
        };

        for i in 0..MAX_PROCESSES {
            let pid = (start + i) % MAX_PROCESSES;
            let free = match &self.slots[pid] {
                None => true,
                Some(p) => p.state == ProcessState::Terminated,
            };
            if free {
                return Some(pid);
            }
        }
        None
    }
}

const NO_PROCESS: Option<Box<Process>> = None;

static PCB_TABLE: Mutex<PcbTable> = Mutex::new(PcbTable {
    slots: [NO_PROCESS; MAX_PROCESSES],
    count: 0,
    last_pid: None,
    foreground: None,
    initialized: false,
});

/// Pids whose stacks cannot be freed until the scheduler switches off them.
static TERMINATED: Mutex<Vec<Pid>> = Mutex::new(Vec::new());

static SHELL_ENTRY: Mutex<Option<TaskEntry>> = Mutex::new(None);

pub fn init_pcb_table() {
    let mut table = PCB_TABLE.lock();
    if table.initialized {
        panic!("PCB table already initialized");
    }
    table.initialized = true;
}

/// Run `f` against the PCB for `pid`, if it exists. The closure must not
/// call back into the scheduler or semaphore layers: it runs under the
/// table lock.
pub(crate) fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    arch::without_interrupts(|| {
        let mut table = PCB_TABLE.lock();
        table.slots.get_mut(pid)?.as_mut().map(|p| f(p))
    })
}

fn process_alive(pid: Pid) -> bool {
    with_process(pid, |p| p.state != ProcessState::Terminated).unwrap_or(false)
}

pub fn get_current_pid() -> Option<Pid> {
    scheduler::current_pid()
}

/// Entry point, argc and argv for the launch trampoline.
pub(crate) fn launch_parameters(pid: Pid) -> Option<(TaskEntry, u64, *const *const u8)> {
    with_process(pid, |p| {
        (p.entry, p.argv_storage.len() as u64, p.argv_ptrs.as_ptr())
    })
}

/// Create a process and enroll it in the scheduler. Returns the new pid, or
/// `None` with everything obtained along the way released.
pub fn create_process(
    entry: TaskEntry,
    args: &[&str],
    priority: Priority,
    parent: Option<Pid>,
    is_background: bool,
) -> Option<Pid> {
    arch::without_interrupts(|| {
        let pid = {
            let table = PCB_TABLE.lock();
            table.next_free_pid()?
        };

        // A terminated process may still own the slot; finish tearing it
        // down before its pid is recycled.
        if with_process(pid, |p| p.state == ProcessState::Terminated).unwrap_or(false) {
            TERMINATED.lock().retain(|&p| p != pid);
            free_process(pid);
        }

        let mut stack = alloc::vec![0u8; PROCESS_STACK_SIZE].into_boxed_slice();

        let mut argv_storage: Vec<Vec<u8>> = Vec::with_capacity(args.len());
        for arg in args {
            let mut bytes = Vec::with_capacity(arg.len() + 1);
            bytes.extend_from_slice(arg.as_bytes());
            bytes.push(0);
            argv_storage.push(bytes);
        }
        let mut argv_ptrs: Vec<*const u8> =
            argv_storage.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(core::ptr::null());

        let mut name = String::from(args.first().copied().unwrap_or(""));
        name.truncate(PROCESS_NAME_MAX_LENGTH - 1);

        let wait_sem = semaphore::sem_init(&format!("process{}", pid), 0)?;

        let rsp = context::build_initial_frame(&mut stack, pid as u64);

        let process = Box::new(Process {
            pid,
            ppid: parent,
            name,
            priority,
            state: ProcessState::Ready,
            entry,
            argv_storage,
            argv_ptrs,
            stack,
            rsp,
            is_background,
            is_foreground: false,
            waiting_for_child: None,
            children: Queue::new(),
            wait_sem: wait_sem.clone(),
            fds: [PipeEndpoint::console(); PIPE_FD_COUNT],
        });

        {
            let mut table = PCB_TABLE.lock();
            table.slots[pid] = Some(process);
            table.count += 1;
            table.last_pid = Some(pid);
        }

        if let Some(ppid) = parent {
            with_process(ppid, |p| {
                if !p.children.contains(&pid) {
                    p.children.enqueue(pid);
                }
            });
        }

        if !is_background {
            set_foreground_process(pid);
        }

        if scheduler::add_process_to_scheduler(pid, priority) != 0 {
            free_process(pid);
            return None;
        }

        Some(pid)
    })
}

/// Full teardown of a process that is no longer on the CPU: wake joiners,
/// destroy the wait semaphore, reparent children, drop pipe references and
/// the foreground claim, then release the slot (stack, argv and children
/// queue go with the PCB).
fn free_process(pid: Pid) {
    let info = with_process(pid, |p| {
        let mut children = Vec::new();
        while let Some(child) = p.children.dequeue() {
            children.push(child);
        }
        (p.wait_sem.clone(), children, p.ppid)
    });
    let (wait_sem, children, ppid) = match info {
        Some(info) => info,
        None => return,
    };

    semaphore::wake_blocked(&wait_sem);
    semaphore::destroy(&wait_sem);

    let adopter = adoption_target(ppid);
    for child in children {
        if child == pid {
            continue;
        }
        with_process(child, |c| c.ppid = Some(adopter));
        if adopter != pid {
            with_process(adopter, |a| {
                if !a.children.contains(&child) {
                    a.children.enqueue(child);
                }
            });
        }
    }

    release_foreground_process(pid);

    if let Some(mut fds) = with_process(pid, |p| {
        let fds = p.fds;
        endpoint::reset_endpoints(&mut p.fds);
        fds
    }) {
        endpoint::release_endpoints(&mut fds);
    }

    arch::without_interrupts(|| {
        let mut table = PCB_TABLE.lock();
        if table.slots[pid].take().is_some() && table.count > 0 {
            table.count -= 1;
        }
    });
}

/// First live process among the original parent, init, the shell and idle.
fn adoption_target(ppid: Option<Pid>) -> Pid {
    let candidates = [
        ppid,
        Some(INIT_PROCESS_PID),
        Some(SHELL_PROCESS_PID),
        Some(IDLE_PROCESS_PID),
    ];
    for candidate in candidates.into_iter().flatten() {
        if process_alive(candidate) {
            return candidate;
        }
    }
    IDLE_PROCESS_PID
}

fn enqueue_terminated(pid: Pid) {
    let mut terminated = TERMINATED.lock();
    if terminated.contains(&pid) {
        return;
    }
    if terminated.len() >= MAX_PROCESSES {
        panic!("terminated process queue overflow");
    }
    terminated.push(pid);
}

/// Reap every terminated process except `exclude` (the one still on the
/// CPU). Called at each scheduler entry.
pub fn cleanup_terminated(exclude: Option<Pid>) {
    arch::without_interrupts(|| {
        let pending: Vec<Pid> = {
            let mut terminated = TERMINATED.lock();
            if terminated.is_empty() {
                return;
            }
            core::mem::take(&mut *terminated)
        };

        let mut kept = Vec::new();
        for pid in pending {
            if Some(pid) == exclude {
                kept.push(pid);
                continue;
            }
            // The slot may have been recycled already; only reap a PCB that
            // is still terminated.
            if with_process(pid, |p| p.state == ProcessState::Terminated).unwrap_or(false) {
                free_process(pid);
            }
        }

        let mut terminated = TERMINATED.lock();
        for pid in kept {
            if !terminated.contains(&pid) {
                terminated.push(pid);
            }
        }
    })
}

/// Terminate `pid`. Idempotent once the target is already terminated. The
/// idle and init processes can never be killed; the syscall layer also
/// shields the shell from userland.
pub fn kill(pid: Pid) -> i64 {
    if pid == IDLE_PROCESS_PID || pid == INIT_PROCESS_PID || pid >= MAX_PROCESSES {
        return -1;
    }

    arch::without_interrupts(|| {
        let state = match with_process(pid, |p| p.state) {
            Some(state) => state,
            None => return -1,
        };

        match state {
            ProcessState::Terminated => 0,
            ProcessState::Ready => {
                let priority = with_process(pid, |p| p.priority).unwrap_or(Priority::Min);
                if scheduler::remove_process_from_scheduler(pid, priority) != 0 {
                    return -1;
                }
                with_process(pid, |p| p.state = ProcessState::Terminated);
                free_process(pid);
                0
            }
            ProcessState::Blocked => {
                with_process(pid, |p| p.state = ProcessState::Terminated);
                free_process(pid);
                0
            }
            ProcessState::Running => {
                // Only the caller itself can be running. The stack stays
                // alive until the scheduler has switched off it, so the
                // reap is deferred to the next scheduler entry.
                with_process(pid, |p| p.state = ProcessState::Terminated);
                release_foreground_process(pid);
                if let Some(sem) = with_process(pid, |p| p.wait_sem.clone()) {
                    semaphore::wake_blocked(&sem);
                }
                enqueue_terminated(pid);
                scheduler::yield_now();
                0
            }
        }
    })
}

/// Move a Ready process out of the scheduler, or suspend the caller.
pub fn block(pid: Pid) -> i64 {
    if pid == IDLE_PROCESS_PID || pid >= MAX_PROCESSES {
        return -1;
    }

    arch::without_interrupts(|| {
        let state = match with_process(pid, |p| p.state) {
            Some(state) => state,
            None => return -1,
        };

        match state {
            ProcessState::Ready => {
                let priority = with_process(pid, |p| p.priority).unwrap_or(Priority::Min);
                if scheduler::remove_process_from_scheduler(pid, priority) != 0 {
                    return -1;
                }
                with_process(pid, |p| p.state = ProcessState::Blocked);
                0
            }
            ProcessState::Running => {
                with_process(pid, |p| p.state = ProcessState::Blocked);
                scheduler::yield_now();
                0
            }
            _ => -1,
        }
    })
}

/// Blocked -> Ready; any other transition is rejected.
pub fn unblock(pid: Pid) -> i64 {
    arch::without_interrupts(|| {
        let priority = match with_process(pid, |p| {
            if p.state != ProcessState::Blocked {
                return None;
            }
            p.state = ProcessState::Ready;
            Some(p.priority)
        }) {
            Some(Some(priority)) => priority,
            _ => return -1,
        };
        scheduler::add_process_to_scheduler(pid, priority)
    })
}

/// Change a process's priority, re-enqueueing it if it is currently ready
/// so its queue placement matches.
pub fn nice(pid: Pid, new_priority: Priority) -> i64 {
    if pid >= MAX_PROCESSES {
        return -1;
    }

    arch::without_interrupts(|| {
        let state = match with_process(pid, |p| {
            let state = p.state;
            p.priority = new_priority;
            state
        }) {
            Some(state) => state,
            None => return -1,
        };

        if state == ProcessState::Ready {
            scheduler::requeue_ready_process(pid, new_priority);
        }
        0
    })
}

/// Join on one child: returns immediately if it already terminated,
/// otherwise blocks on its wait semaphore. The child is removed from the
/// caller's children list either way.
pub fn wait_pid(pid: Pid) -> i64 {
    if pid >= MAX_PROCESSES {
        return -1;
    }

    arch::without_interrupts(|| {
        let current = match get_current_pid() {
            Some(current) => current,
            None => return -1,
        };

        let target = match with_process(pid, |p| (p.ppid, p.state, p.wait_sem.clone())) {
            Some(target) => target,
            None => return -1,
        };
        let (ppid, state, wait_sem) = target;

        if ppid != Some(current) {
            return -1;
        }

        if state == ProcessState::Terminated {
            with_process(current, |p| {
                p.children.remove(&pid);
            });
            return 0;
        }

        with_process(current, |p| p.waiting_for_child = Some(pid));
        semaphore::wait(&wait_sem);
        with_process(current, |p| {
            p.waiting_for_child = None;
            p.children.remove(&pid);
        });
        0
    })
}

/// Join on every child present when the call was made. Idempotent once no
/// children remain.
pub fn wait_children() -> i64 {
    arch::without_interrupts(|| {
        let current = match get_current_pid() {
            Some(current) => current,
            None => return -1,
        };

        let snapshot = match with_process(current, |p| {
            let mut pids = Vec::new();
            let size = p.children.len();
            if p.children.begin_cyclic_iter() {
                for _ in 0..size {
                    if let Some(child) = p.children.next_cyclic_iter() {
                        pids.push(child);
                    }
                }
            }
            pids
        }) {
            Some(snapshot) => snapshot,
            None => return -1,
        };

        for child in snapshot {
            let pending = with_process(child, |c| {
                if c.ppid == Some(current) && c.state != ProcessState::Terminated {
                    Some(c.wait_sem.clone())
                } else {
                    None
                }
            })
            .flatten();

            if let Some(sem) = pending {
                with_process(current, |p| p.waiting_for_child = Some(child));
                semaphore::wait(&sem);
                with_process(current, |p| p.waiting_for_child = None);
            }

            with_process(current, |p| {
                p.children.remove(&child);
            });
        }
        0
    })
}

pub fn get_foreground_pid() -> Option<Pid> {
    arch::without_interrupts(|| PCB_TABLE.lock().foreground)
}

/// Hand the console to `pid`. At most one foreground process exists.
pub fn set_foreground_process(pid: Pid) {
    arch::without_interrupts(|| {
        let previous = {
            let table = PCB_TABLE.lock();
            table.foreground
        };
        if previous == Some(pid) {
            return;
        }
        if let Some(previous) = previous {
            with_process(previous, |p| p.is_foreground = false);
        }
        with_process(pid, |p| p.is_foreground = true);
        PCB_TABLE.lock().foreground = Some(pid);
    })
}

/// Reassign the foreground only if `pid` currently holds it. Preference:
/// the process's parent, then init, then the shell, then idle.
pub fn release_foreground_process(pid: Pid) {
    arch::without_interrupts(|| {
        let held = PCB_TABLE.lock().foreground == Some(pid);
        if !held {
            return;
        }
        with_process(pid, |p| p.is_foreground = false);
        let ppid = with_process(pid, |p| p.ppid).flatten();
        let target = adoption_target(ppid);
        PCB_TABLE.lock().foreground = None;
        set_foreground_process(target);
    })
}

/// Kill whatever process owns the console (the Ctrl+C path). Protected
/// processes survive this.
pub fn kill_foreground_process() -> i64 {
    match get_foreground_pid() {
        Some(pid) if pid != SHELL_PROCESS_PID => kill(pid),
        _ => -1,
    }
}

pub fn get_process_info(pid: Pid) -> Option<ProcessInformation> {
    with_process(pid, |p| {
        let mut name = [0u8; PROCESS_NAME_MAX_LENGTH];
        let bytes = p.name.as_bytes();
        let len = bytes.len().min(PROCESS_NAME_MAX_LENGTH - 1);
        name[..len].copy_from_slice(&bytes[..len]);

        ProcessInformation {
            pid: p.pid as i32,
            name,
            priority: p.priority.index() as i32,
            state: p.state.as_i32(),
            rsp: p.rsp,
            stack_base: p.stack_base(),
            is_foreground: p.is_foreground as u8,
        }
    })
}

/// Terminate the calling process. Used by the launch trampoline when the
/// entry function returns; the exit status is discarded.
pub fn exit_current(_status: i64) -> ! {
    if let Some(pid) = get_current_pid() {
        kill(pid);
    }
    loop {
        scheduler::yield_now();
        arch::enable_and_halt();
    }
}

extern "C" fn init_main(_argc: u64, _argv: *const *const u8) -> i64 {
    loop {
        let shell_entry = *SHELL_ENTRY.lock();
        let Some(shell_entry) = shell_entry else {
            scheduler::yield_now();
            continue;
        };

        match create_process(
            shell_entry,
            &["shell"],
            Priority::Mid,
            Some(INIT_PROCESS_PID),
            false,
        ) {
            Some(shell) => {
                wait_pid(shell);
                crate::log_warn!("Shell exited; spawning a new one.");
            }
            None => {
                crate::log_error!("Failed to spawn shell.");
                scheduler::yield_now();
            }
        }
    }
}

/// Create the init supervisor (pid 1). It spawns the shell in the
/// foreground and respawns it whenever it exits.
pub fn start_init_process(shell_entry: TaskEntry) -> Option<Pid> {
    *SHELL_ENTRY.lock() = Some(shell_entry);
    create_process(
        TaskEntry::Function(init_main),
        &["init"],
        Priority::Mid,
        None,
        true,
    )
}

#[cfg(test)]
pub(crate) fn reset() {
    let mut table = PCB_TABLE.lock();
    table.slots = [NO_PROCESS; MAX_PROCESSES];
    table.count = 0;
    table.last_pid = None;
    table.foreground = None;
    table.initialized = true;
    drop(table);
    TERMINATED.lock().clear();
    *SHELL_ENTRY.lock() = None;
}

#[cfg(test)]
pub(crate) fn terminated_list_contains(pid: Pid) -> bool {
    TERMINATED.lock().contains(&pid)
}

#[cfg(test)]
mod tests;
