//! Per-process file-descriptor endpoints.
//!
//! Each process owns two endpoints (index 0 reads, index 1 writes), both
//! defaulting to the console. Rebinding an endpoint releases the pipe
//! reference it held and retains the new one, so the pipe refcount always
//! equals the number of endpoints pointing at it.

use super::pipe::{self, PipeRole};

pub const READ_FD: usize = 0;
pub const WRITE_FD: usize = 1;
pub const PIPE_FD_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEndpointType {
    None,
    Console,
    Pipe,
}

#[derive(Debug, Clone, Copy)]
pub struct PipeEndpoint {
    pub kind: PipeEndpointType,
    pub pipe_id: Option<usize>,
    pub role: PipeRole,
}

impl PipeEndpoint {
    pub const fn console() -> Self {
        PipeEndpoint {
            kind: PipeEndpointType::Console,
            pipe_id: None,
            role: PipeRole::None,
        }
    }
}

pub fn reset_endpoints(endpoints: &mut [PipeEndpoint; PIPE_FD_COUNT]) {
    for endpoint in endpoints.iter_mut() {
        *endpoint = PipeEndpoint::console();
    }
}

/// Drop whatever pipe references the endpoints still hold. Runs when a
/// process is torn down.
pub fn release_endpoints(endpoints: &mut [PipeEndpoint; PIPE_FD_COUNT]) {
    for endpoint in endpoints.iter_mut() {
        if endpoint.kind == PipeEndpointType::Pipe {
            if let Some(id) = endpoint.pipe_id {
                pipe::pipe_release(id, endpoint.role);
            }
        }
        *endpoint = PipeEndpoint {
            kind: PipeEndpointType::None,
            pipe_id: None,
            role: PipeRole::None,
        };
    }
}

fn set_endpoint(
    endpoint: &mut PipeEndpoint,
    role: PipeRole,
    kind: PipeEndpointType,
    pipe_id: Option<usize>,
) -> i64 {
    if endpoint.kind == PipeEndpointType::Pipe {
        if let Some(old_id) = endpoint.pipe_id {
            pipe::pipe_release(old_id, endpoint.role);
        }
    }

    endpoint.kind = PipeEndpointType::None;
    endpoint.pipe_id = None;
    endpoint.role = PipeRole::None;

    match kind {
        PipeEndpointType::None => 0,
        PipeEndpointType::Console => {
            endpoint.kind = PipeEndpointType::Console;
            0
        }
        PipeEndpointType::Pipe => {
            if role == PipeRole::None {
                return -1;
            }
            let id = match pipe_id {
                Some(id) => id,
                None => return -1,
            };
            if pipe::pipe_retain(id, role) != 0 {
                return -1;
            }
            endpoint.kind = PipeEndpointType::Pipe;
            endpoint.pipe_id = Some(id);
            endpoint.role = role;
            0
        }
    }
}

pub fn set_read_target(
    endpoints: &mut [PipeEndpoint; PIPE_FD_COUNT],
    kind: PipeEndpointType,
    pipe_id: Option<usize>,
) -> i64 {
    set_endpoint(&mut endpoints[READ_FD], PipeRole::Reader, kind, pipe_id)
}

pub fn set_write_target(
    endpoints: &mut [PipeEndpoint; PIPE_FD_COUNT],
    kind: PipeEndpointType,
    pipe_id: Option<usize>,
) -> i64 {
    set_endpoint(&mut endpoints[WRITE_FD], PipeRole::Writer, kind, pipe_id)
}

/// Pipe-backed endpoint read; the console path is routed by the syscall
/// layer.
pub fn endpoint_read(endpoint: &PipeEndpoint, buf: &mut [u8]) -> i64 {
    if endpoint.kind != PipeEndpointType::Pipe {
        return -1;
    }
    match endpoint.pipe_id {
        Some(id) => pipe::read_pipe(id, buf),
        None => -1,
    }
}

pub fn endpoint_write(endpoint: &PipeEndpoint, buf: &[u8]) -> i64 {
    if endpoint.kind != PipeEndpointType::Pipe {
        return -1;
    }
    match endpoint.pipe_id {
        Some(id) => pipe::write_pipe(id, buf),
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pipe;
    use serial_test::serial;

    fn reset_world() {
        pipe::reset();
        crate::sync::semaphore::reset();
    }

    #[test]
    #[serial]
    fn retain_release_restores_refcount() {
        reset_world();
        let id = pipe::open_pipe().unwrap();
        assert_eq!(pipe::pipe_refcounts(id), Some((0, 0, 0)));

        assert_eq!(pipe::pipe_retain(id, PipeRole::Reader), 0);
        assert_eq!(pipe::pipe_retain(id, PipeRole::Writer), 0);
        assert_eq!(pipe::pipe_refcounts(id), Some((2, 1, 1)));

        assert_eq!(pipe::pipe_release(id, PipeRole::Reader), 0);
        // ref_count always equals reader_count + writer_count.
        assert_eq!(pipe::pipe_refcounts(id), Some((1, 0, 1)));
    }

    #[test]
    #[serial]
    fn rebinding_endpoint_releases_previous_pipe() {
        reset_world();
        let first = pipe::open_pipe().unwrap();
        let second = pipe::open_pipe().unwrap();

        let mut endpoints = [PipeEndpoint::console(); PIPE_FD_COUNT];
        assert_eq!(
            set_write_target(&mut endpoints, PipeEndpointType::Pipe, Some(first)),
            0
        );
        assert_eq!(pipe::pipe_refcounts(first), Some((1, 0, 1)));

        assert_eq!(
            set_write_target(&mut endpoints, PipeEndpointType::Pipe, Some(second)),
            0
        );
        assert_eq!(pipe::pipe_refcounts(second), Some((1, 0, 1)));
        // The first pipe lost its only reference and was finalized.
        assert!(!pipe::pipe_exists(first));
    }

    #[test]
    #[serial]
    fn console_endpoint_rejects_pipe_io() {
        reset_world();
        let endpoint = PipeEndpoint::console();
        let mut buf = [0u8; 4];
        assert_eq!(endpoint_read(&endpoint, &mut buf), -1);
        assert_eq!(endpoint_write(&endpoint, b"xy"), -1);
    }

    #[test]
    #[serial]
    fn writer_cannot_retain_closed_pipe() {
        reset_world();
        let id = pipe::open_pipe().unwrap();
        assert_eq!(pipe::pipe_retain(id, PipeRole::Reader), 0);
        assert_eq!(pipe::pipe_retain(id, PipeRole::Writer), 0);
        // Last writer leaving closes the pipe for writing.
        assert_eq!(pipe::pipe_release(id, PipeRole::Writer), 0);
        assert_eq!(pipe::pipe_retain(id, PipeRole::Writer), -1);
        // Readers may still attach to drain it.
        assert_eq!(pipe::pipe_retain(id, PipeRole::Reader), 0);
    }
}
