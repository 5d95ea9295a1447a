//! Preemptive priority scheduler with aging.
//!
//! One FIFO ready queue per priority level. A process runs for
//! `1 << priority` timer ticks before it is preempted; queues that keep
//! losing the selection accumulate a starvation counter and get boosted
//! once it reaches the threshold. The timer interrupt hands the saved
//! stack pointer to `schedule`, which returns the stack pointer of
//! whatever should run next.

pub mod context;

use spin::Mutex;

use crate::arch;
use crate::collections::Queue;
use crate::process::{self, Pid, Priority, ProcessState, TaskEntry};

pub const STARVATION_THRESHOLD: u32 = 5;

fn quantum_limit_for(priority: Priority) -> u32 {
    1 << priority.index()
}

struct Scheduler {
    ready_queues: [Queue<Pid>; Priority::COUNT],
    current: Option<Pid>,
    idle: Option<Pid>,
    /// On the very first entry the boot context is on the CPU, not the idle
    /// process; idle's fabricated frame must not be overwritten.
    first_interrupt: bool,
    current_quantum: u32,
    quantum_limit: u32,
    starvation_counters: [u32; Priority::COUNT],
}

impl Scheduler {
    const fn new() -> Self {
        Scheduler {
            ready_queues: [Queue::new(), Queue::new(), Queue::new()],
            current: None,
            idle: None,
            first_interrupt: true,
            current_quantum: 0,
            quantum_limit: 0,
            starvation_counters: [0; Priority::COUNT],
        }
    }

    fn age_waiting_priorities(&mut self) {
        for priority in 0..Priority::COUNT {
            if !self.ready_queues[priority].is_empty() {
                if self.starvation_counters[priority] < STARVATION_THRESHOLD {
                    self.starvation_counters[priority] += 1;
                }
            } else {
                self.starvation_counters[priority] = 0;
            }
        }
    }

    fn try_dequeue_at(&mut self, priority: usize) -> Option<Pid> {
        let pid = self.ready_queues[priority].dequeue()?;
        self.starvation_counters[priority] = 0;
        Some(pid)
    }

    /// Starved queues win first, highest priority otherwise.
    fn dequeue_next_ready(&mut self) -> Option<Pid> {
        for priority in (0..Priority::COUNT).rev() {
            if self.starvation_counters[priority] >= STARVATION_THRESHOLD {
                if let Some(boosted) = self.try_dequeue_at(priority) {
                    return Some(boosted);
                }
            }
        }

        for priority in (0..Priority::COUNT).rev() {
            if let Some(next) = self.try_dequeue_at(priority) {
                return Some(next);
            }
        }

        None
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

extern "C" fn idle_task(_argc: u64, _argv: *const *const u8) -> i64 {
    loop {
        arch::halt();
    }
}

/// Create the idle process (pid 0) and install it as the current process.
pub fn init() {
    let idle = match process::create_process(
        TaskEntry::Function(idle_task),
        &["idle"],
        Priority::Min,
        None,
        true,
    ) {
        Some(pid) => pid,
        None => panic!("Failed to create idle process."),
    };

    arch::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.ready_queues[Priority::Min.index()].remove(&idle);
        sched.current = Some(idle);
        sched.idle = Some(idle);
        sched.first_interrupt = true;
        sched.current_quantum = 0;
        sched.quantum_limit = 0;
    });
    process::with_process(idle, |p| p.state = ProcessState::Running);

    crate::log_info!("Scheduler initialized, idle process is pid {}.", idle);
}

/// Scheduler entry point, called with the interrupted context's stack
/// pointer from the timer ISR and the forced-yield vector. Returns the
/// stack pointer to resume.
pub extern "C" fn schedule(rsp: u64) -> u64 {
    let exclude = current_pid();
    process::cleanup_terminated(exclude);

    let mut sched = SCHEDULER.lock();

    if let Some(current) = sched.current {
        if let Some((state, priority)) = process::with_process(current, |p| (p.state, p.priority))
        {
            // Keep idle's preconstructed frame on the very first entry; the
            // incoming rsp still points into the boot stack.
            let keep_initial_frame = sched.first_interrupt && sched.idle == Some(current);
            if !keep_initial_frame {
                process::with_process(current, |p| p.rsp = rsp);
            }

            sched.current_quantum += 1;

            let should_switch = state != ProcessState::Running
                || sched.current_quantum >= sched.quantum_limit;

            if !should_switch {
                sched.first_interrupt = false;
                return rsp;
            }

            if state == ProcessState::Running {
                process::with_process(current, |p| p.state = ProcessState::Ready);
                sched.ready_queues[priority.index()].enqueue(current);
            }
        }
    }
    sched.first_interrupt = false;

    sched.age_waiting_priorities();

    let next = match sched.dequeue_next_ready() {
        Some(next) => next,
        // No runnable process; idle always exists.
        None => match sched.idle {
            Some(idle) => idle,
            None => panic!("No process available to schedule."),
        },
    };

    let (next_rsp, next_priority) = match process::with_process(next, |p| {
        p.state = ProcessState::Running;
        (p.rsp, p.priority)
    }) {
        Some(info) => info,
        None => panic!("Scheduled pid {} has no PCB.", next),
    };

    sched.current = Some(next);
    sched.current_quantum = 0;
    sched.quantum_limit = quantum_limit_for(next_priority);

    next_rsp
}

pub fn current_pid() -> Option<Pid> {
    arch::without_interrupts(|| SCHEDULER.lock().current)
}

pub fn add_process_to_scheduler(pid: Pid, priority: Priority) -> i64 {
    arch::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.ready_queues[priority.index()].enqueue(pid);
        0
    })
}

/// Drop `pid` from the ready queues, looking at its own priority first.
/// Fails (non-fatally) when the process is not currently ready.
pub fn remove_process_from_scheduler(pid: Pid, priority: Priority) -> i64 {
    arch::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if sched.ready_queues[priority.index()].remove(&pid) {
            return 0;
        }
        for other in 0..Priority::COUNT {
            if other == priority.index() {
                continue;
            }
            if sched.ready_queues[other].remove(&pid) {
                return 0;
            }
        }
        -1
    })
}

/// Move an already-ready process to the queue matching its new priority.
pub fn requeue_ready_process(pid: Pid, new_priority: Priority) -> i64 {
    arch::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let mut found = false;
        for priority in 0..Priority::COUNT {
            if sched.ready_queues[priority].remove(&pid) {
                found = true;
                break;
            }
        }
        if !found {
            return -1;
        }
        sched.ready_queues[new_priority.index()].enqueue(pid);
        0
    })
}

/// Force a synchronous pass through `schedule`. The caller may have set its
/// own state to Blocked or Terminated first.
pub fn yield_now() {
    arch::force_timer_interrupt();
}

#[cfg(test)]
pub(crate) fn reset() {
    *SCHEDULER.lock() = Scheduler::new();
}

#[cfg(test)]
pub(crate) fn ready_queue_snapshot(priority: Priority) -> alloc::vec::Vec<Pid> {
    let mut sched = SCHEDULER.lock();
    let queue = &mut sched.ready_queues[priority.index()];
    let mut pids = alloc::vec::Vec::new();
    let size = queue.len();
    if queue.begin_cyclic_iter() {
        for _ in 0..size {
            if let Some(pid) = queue.next_cyclic_iter() {
                pids.push(pid);
            }
        }
    }
    pids
}

#[cfg(test)]
pub(crate) fn starvation_counter(priority: Priority) -> u32 {
    SCHEDULER.lock().starvation_counters[priority.index()]
}

#[cfg(test)]
mod tests;
