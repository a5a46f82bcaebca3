// Error taxonomy for the coordination engine.
//
// CAS loops absorb `TransientIO` and retry internally; every other kind
// propagates to the caller. `SessionTerminated` is never retried.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CoordinationError {
    #[error("session terminated")]
    SessionTerminated,

    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("entry already exists: {0}")]
    Exists(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transient I/O error: {0}")]
    TransientIO(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl CoordinationError {
    /// CAS loops retry on this kind alone; every other kind surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::TransientIO(_))
    }
}

impl From<std::io::Error> for CoordinationError {
    fn from(e: std::io::Error) -> Self {
        CoordinationError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
