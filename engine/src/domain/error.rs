//! Domain-level errors
//! These represent supervision and configuration rule violations,
//! not transport failures

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DomainError {
    // Backend registry errors
    #[error("backend '{0}' not found")]
    BackendNotFound(String),

    // Process lifecycle errors
    #[error("backend '{id}' is already running (pid {pid})")]
    AlreadyRunning { id: String, pid: u32 },

    #[error("failed to launch backend '{id}': {reason}")]
    Launch { id: String, reason: String },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration proposal already in flight for backend '{0}'")]
    Conflict(String),

    #[error("no prior configuration snapshot for backend '{0}'")]
    NoPriorSnapshot(String),

    // Control channel errors
    #[error("authentication material error: {0}")]
    Authentication(String),

    // Infrastructure carriers
    #[error("i/o failure: {0}")]
    Io(String),
}

impl DomainError {
    /// Wrap an io::Error with call-site context
    pub fn io(context: &str, err: std::io::Error) -> Self {
        DomainError::Io(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
