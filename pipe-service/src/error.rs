use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the pipe client and server.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Endpoint is not connected")]
    NotConnected,
    #[error("Endpoint is already connected")]
    AlreadyConnected,
    #[error("Endpoint has been disposed")]
    Disposed,
    #[error("No peer appeared on the pipe within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Event '{0}' response did not match the registered argument shape")]
    ShapeMismatch(String),
    #[error("Peer process {0} has exited")]
    PeerExited(u32),
    #[error("Invalid process id: {0}")]
    InvalidProcessId(String),
}
