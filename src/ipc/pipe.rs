//! Bounded FIFO byte pipes built on two counting semaphores.
//!
//! `read_sem` counts readable bytes (starts at 0), `write_sem` counts free
//! slots (starts at the buffer size). A per-pipe spinlock serializes index
//! and refcount updates; the semaphores do all the blocking. A pipe is
//! reaped only once it is closed, unreferenced and no operation is mid-loop.

use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::arch;
use crate::sync::semaphore::{self, SemaphoreHandle};

pub const MAX_PIPES: usize = 64;
pub const PIPE_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    None,
    Reader,
    Writer,
}

struct PipeState {
    read_idx: usize,
    write_idx: usize,
    buffer: [u8; PIPE_BUFFER_SIZE],
    ref_count: usize,
    reader_count: usize,
    writer_count: usize,
    closed: bool,
    active_ops: usize,
}

impl PipeState {
    fn has_data(&self) -> bool {
        self.read_idx != self.write_idx
    }
}

pub struct Pipe {
    id: usize,
    state: Mutex<PipeState>,
    read_sem: SemaphoreHandle,
    write_sem: SemaphoreHandle,
}

const EMPTY_SLOT: Option<Arc<Pipe>> = None;
static PIPES: Mutex<[Option<Arc<Pipe>>; MAX_PIPES]> = Mutex::new([EMPTY_SLOT; MAX_PIPES]);
static PIPE_SERIAL: AtomicUsize = AtomicUsize::new(0);

fn get_pipe(pipe_id: usize) -> Option<Arc<Pipe>> {
    if pipe_id >= MAX_PIPES {
        return None;
    }
    arch::without_interrupts(|| PIPES.lock()[pipe_id].clone())
}

fn build_pipe(slot: usize, serial: usize) -> Option<Arc<Pipe>> {
    let read_sem = semaphore::sem_init(&format!("pipe{:02}R", serial % 100), 0)?;
    let write_sem = match semaphore::sem_init(
        &format!("pipe{:02}W", serial % 100),
        PIPE_BUFFER_SIZE as u32,
    ) {
        Some(sem) => sem,
        None => {
            semaphore::destroy(&read_sem);
            return None;
        }
    };

    Some(Arc::new(Pipe {
        id: slot,
        state: Mutex::new(PipeState {
            read_idx: 0,
            write_idx: 0,
            buffer: [0; PIPE_BUFFER_SIZE],
            ref_count: 0,
            reader_count: 0,
            writer_count: 0,
            closed: false,
            active_ops: 0,
        }),
        read_sem,
        write_sem,
    }))
}

/// Allocate a pipe slot. The new pipe starts with refcount 0; callers must
/// `pipe_retain` a role to obtain a usable endpoint.
pub fn open_pipe() -> Option<usize> {
    arch::without_interrupts(|| {
        let slot = {
            let pipes = PIPES.lock();
            pipes.iter().position(|slot| slot.is_none())?
        };

        let serial = PIPE_SERIAL.fetch_add(1, Ordering::Relaxed);
        let pipe = build_pipe(slot, serial)?;
        PIPES.lock()[slot] = Some(pipe);
        Some(slot)
    })
}

fn enter_operation(pipe: &Arc<Pipe>) {
    pipe.state.lock().active_ops += 1;
}

fn leave_operation(pipe: &Arc<Pipe>) {
    pipe.state.lock().active_ops -= 1;
}

fn try_finalize(pipe_id: usize) {
    arch::without_interrupts(|| {
        let pipe = {
            let mut pipes = PIPES.lock();
            let pipe = match pipes.get(pipe_id).and_then(|slot| slot.clone()) {
                Some(pipe) => pipe,
                None => return,
            };
            {
                let state = pipe.state.lock();
                if !(state.closed && state.ref_count == 0 && state.active_ops == 0) {
                    return;
                }
            }
            pipes[pipe_id] = None;
            pipe
        };

        semaphore::destroy(&pipe.read_sem);
        semaphore::destroy(&pipe.write_sem);
    })
}

fn close_pipe_internal(pipe: &Arc<Pipe>, role: PipeRole) -> i64 {
    let mut wake_readers = false;
    let mut wake_writers = false;

    let remaining_refs = {
        let mut state = pipe.state.lock();

        if state.ref_count > 0 {
            state.ref_count -= 1;
        }

        if (role == PipeRole::Reader || role == PipeRole::None) && state.reader_count > 0 {
            state.reader_count -= 1;
        }

        if (role == PipeRole::Writer || role == PipeRole::None) && state.writer_count > 0 {
            state.writer_count -= 1;
            if state.writer_count == 0 {
                state.closed = true;
                wake_readers = true;
            }
        }

        if state.ref_count == 0 {
            state.closed = true;
            wake_readers = true;
            wake_writers = true;
        }

        state.ref_count
    };

    if wake_readers {
        semaphore::wake_blocked(&pipe.read_sem);
    }
    if wake_writers {
        semaphore::wake_blocked(&pipe.write_sem);
    }

    if remaining_refs > 0 {
        return 0;
    }

    try_finalize(pipe.id);
    0
}

/// Close every endpoint reference in one call (role `None` drops both role
/// counters). Surfaced to userland as `sys_close_pipe`.
pub fn close_pipe(pipe_id: usize) -> i64 {
    match get_pipe(pipe_id) {
        Some(pipe) => close_pipe_internal(&pipe, PipeRole::None),
        None => -1,
    }
}

/// Register one more endpoint with the given role. Writing roles are
/// refused once the pipe has been closed for writing.
pub fn pipe_retain(pipe_id: usize, role: PipeRole) -> i64 {
    let pipe = match get_pipe(pipe_id) {
        Some(pipe) => pipe,
        None => return -1,
    };

    if role != PipeRole::Reader && role != PipeRole::Writer {
        return -1;
    }

    let mut state = pipe.state.lock();
    if role == PipeRole::Writer {
        if state.closed {
            return -1;
        }
        state.writer_count += 1;
    } else {
        state.reader_count += 1;
    }
    state.ref_count += 1;
    0
}

/// Drop one endpoint reference with the given role.
pub fn pipe_release(pipe_id: usize, role: PipeRole) -> i64 {
    match get_pipe(pipe_id) {
        Some(pipe) => close_pipe_internal(&pipe, role),
        None => -1,
    }
}

/// Read up to `buf.len()` bytes. Blocks on `read_sem` while the pipe is
/// open and empty; returns a short count once it closes.
pub fn read_pipe(pipe_id: usize, buf: &mut [u8]) -> i64 {
    let pipe = match get_pipe(pipe_id) {
        Some(pipe) => pipe,
        None => return -1,
    };
    if buf.is_empty() {
        return 0;
    }

    enter_operation(&pipe);
    let mut bytes_read = 0;

    while bytes_read < buf.len() {
        {
            let state = pipe.state.lock();
            if state.closed && !state.has_data() {
                break;
            }
        }

        if semaphore::wait(&pipe.read_sem) != 0 {
            break;
        }

        let mut state = pipe.state.lock();
        if !state.has_data() {
            // The close raced our wakeup; nothing was actually readable.
            let closed = state.closed;
            let writers_remaining = state.writer_count;
            drop(state);
            if closed || writers_remaining == 0 {
                break;
            }
            continue;
        }

        buf[bytes_read] = state.buffer[state.read_idx];
        state.read_idx = (state.read_idx + 1) % PIPE_BUFFER_SIZE;
        drop(state);

        semaphore::post(&pipe.write_sem);
        bytes_read += 1;
    }

    leave_operation(&pipe);
    try_finalize(pipe_id);
    bytes_read as i64
}

/// Write up to `buf.len()` bytes. Blocks on `write_sem` while the buffer is
/// full; stops early once the pipe closes.
pub fn write_pipe(pipe_id: usize, buf: &[u8]) -> i64 {
    let pipe = match get_pipe(pipe_id) {
        Some(pipe) => pipe,
        None => return -1,
    };
    if pipe.state.lock().closed {
        return -1;
    }
    if buf.is_empty() {
        return 0;
    }

    enter_operation(&pipe);
    let mut written = 0;

    while written < buf.len() {
        if pipe.state.lock().closed {
            break;
        }

        if semaphore::wait(&pipe.write_sem) != 0 {
            break;
        }

        if pipe.state.lock().closed {
            // Restore the slot we consumed so the teardown accounting on
            // write_sem stays consistent.
            semaphore::post(&pipe.write_sem);
            break;
        }

        let mut state = pipe.state.lock();
        let write_idx = state.write_idx;
        state.buffer[write_idx] = buf[written];
        state.write_idx = (write_idx + 1) % PIPE_BUFFER_SIZE;
        drop(state);

        semaphore::post(&pipe.read_sem);
        written += 1;
    }

    leave_operation(&pipe);
    try_finalize(pipe_id);
    written as i64
}

/// (ref_count, reader_count, writer_count) snapshot.
pub fn pipe_refcounts(pipe_id: usize) -> Option<(usize, usize, usize)> {
    let pipe = get_pipe(pipe_id)?;
    let state = pipe.state.lock();
    Some((state.ref_count, state.reader_count, state.writer_count))
}

pub fn pipe_exists(pipe_id: usize) -> bool {
    get_pipe(pipe_id).is_some()
}

#[cfg(test)]
pub(crate) fn reset() {
    *PIPES.lock() = [EMPTY_SLOT; MAX_PIPES];
    PIPE_SERIAL.store(0, Ordering::Relaxed);
}
