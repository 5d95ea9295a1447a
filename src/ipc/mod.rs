pub mod endpoint;
pub mod pipe;

pub use endpoint::{PipeEndpoint, PipeEndpointType, PIPE_FD_COUNT, READ_FD, WRITE_FD};
pub use pipe::{PipeRole, MAX_PIPES, PIPE_BUFFER_SIZE};

pub fn init() {
    crate::log_info!(
        "Pipe subsystem ready ({} slots, {} byte buffers).",
        MAX_PIPES,
        PIPE_BUFFER_SIZE
    );
}
