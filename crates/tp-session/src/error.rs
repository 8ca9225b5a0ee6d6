use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start agent `{command}`: {reason}")]
    SpawnFailure { command: String, reason: String },

    #[error("agent protocol error: {0}")]
    ProtocolError(String),

    #[error("agent rejected {method} ({code}): {message}")]
    Remote {
        method: String,
        code: i32,
        message: String,
    },

    #[error("agent process exited unexpectedly: {0}")]
    ProcessExitedUnexpectedly(String),

    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
