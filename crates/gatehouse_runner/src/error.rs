use gatehouse_protocol::error::ProtocolError;
use gatehouse_protocol::RunnerId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the orchestrator side of runners and sessions.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn runner {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Runner log {} unavailable: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Runner IPC failed: {0}")]
    Ipc(#[from] ProtocolError),

    #[error("Unknown runner {0}")]
    UnknownRunner(RunnerId),

    #[error("Runner {0} finished and its events were released")]
    Released(RunnerId),

    #[error("Session at capacity: {0} runners already active")]
    AtCapacity(usize),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
