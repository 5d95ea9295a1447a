//! Counting semaphores with named interning and FIFO wakeup.
//!
//! Handles are `Arc<Semaphore>`. A process-wide registry interns semaphores
//! by name: two `sem_init` calls with the same name return the same handle
//! and the second call does not reset the count. Each semaphore guards its
//! own state with a spinlock; the registry has a separate one.

use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;

use crate::arch;
use crate::collections::Queue;
use crate::process::{self, Pid};
use crate::scheduler;

pub type SemaphoreHandle = Arc<Semaphore>;

struct SemInner {
    count: u32,
    blocked: Queue<Pid>,
}

pub struct Semaphore {
    name: String,
    inner: Mutex<SemInner>,
}

/// Interning is by name, so equality is too. `Queue::remove` relies on this.
impl PartialEq for Semaphore {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Semaphore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }

    pub fn blocked_count(&self) -> usize {
        self.inner.lock().blocked.len()
    }
}

static REGISTRY: Mutex<Queue<SemaphoreHandle>> = Mutex::new(Queue::new());

fn find_by_name(registry: &mut Queue<SemaphoreHandle>, name: &str) -> Option<SemaphoreHandle> {
    let size = registry.len();
    if !registry.begin_cyclic_iter() {
        return None;
    }
    for _ in 0..size {
        let sem = registry.next_cyclic_iter()?;
        if sem.name == name {
            return Some(sem);
        }
    }
    None
}

/// Create or look up the semaphore registered under `name`.
pub fn sem_init(name: &str, initial_count: u32) -> Option<SemaphoreHandle> {
    arch::without_interrupts(|| {
        let mut registry = REGISTRY.lock();
        if let Some(existing) = find_by_name(&mut registry, name) {
            return Some(existing);
        }

        let sem = Arc::new(Semaphore {
            name: String::from(name),
            inner: Mutex::new(SemInner {
                count: initial_count,
                blocked: Queue::new(),
            }),
        });
        registry.enqueue(sem.clone());
        Some(sem)
    })
}

/// Decrement the count, or publish the caller on the blocked queue and
/// suspend. The pid is enqueued before the lock is dropped and `post`
/// consumes it under the same lock, so a wakeup cannot be lost.
pub fn wait(sem: &SemaphoreHandle) -> i64 {
    arch::without_interrupts(|| {
        let mut inner = sem.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            return 0;
        }

        let pid = match scheduler::current_pid() {
            Some(pid) => pid,
            None => return -1,
        };
        inner.blocked.enqueue(pid);
        drop(inner);
        process::block(pid);
        0
    })
}

/// Increment the count, or hand it directly to the oldest blocked process.
pub fn post(sem: &SemaphoreHandle) -> i64 {
    arch::without_interrupts(|| {
        let mut inner = sem.inner.lock();
        match inner.blocked.dequeue() {
            None => {
                inner.count += 1;
            }
            Some(pid) => {
                drop(inner);
                process::unblock(pid);
                // Give the woken process a chance to take the resource
                // before the caller grabs it again.
                scheduler::yield_now();
            }
        }
        0
    })
}

/// Post once per process currently blocked on `sem`, without the hand-off
/// yield (this runs from cleanup paths, including the scheduler entry).
pub fn wake_blocked(sem: &SemaphoreHandle) {
    arch::without_interrupts(|| {
        let pending = sem.inner.lock().blocked.len();
        for _ in 0..pending {
            let mut inner = sem.inner.lock();
            match inner.blocked.dequeue() {
                None => {
                    inner.count += 1;
                }
                Some(pid) => {
                    drop(inner);
                    process::unblock(pid);
                }
            }
        }
    })
}

/// Unregister `sem` and release every process still blocked on it. Waiters
/// return from `wait` normally; callers do not consult a destroyed handle.
pub fn destroy(sem: &SemaphoreHandle) {
    arch::without_interrupts(|| {
        REGISTRY.lock().remove(sem);

        loop {
            let mut inner = sem.inner.lock();
            match inner.blocked.dequeue() {
                Some(pid) => {
                    drop(inner);
                    process::unblock(pid);
                }
                None => break,
            }
        }
    })
}

/// Resolve a raw handle coming in through the syscall interface. Only
/// addresses of currently registered semaphores are accepted.
pub fn lookup_handle(addr: u64) -> Option<SemaphoreHandle> {
    arch::without_interrupts(|| {
        let mut registry = REGISTRY.lock();
        let size = registry.len();
        if !registry.begin_cyclic_iter() {
            return None;
        }
        for _ in 0..size {
            let sem = registry.next_cyclic_iter()?;
            if Arc::as_ptr(&sem) as u64 == addr {
                return Some(sem);
            }
        }
        None
    })
}

#[cfg(test)]
pub(crate) fn reset() {
    *REGISTRY.lock() = Queue::new();
}
