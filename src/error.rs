//! Error kinds surfaced by the capture-to-connection pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaronteError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CaronteError {
    /// Whether a retry of the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaronteError::Transient(_))
    }
}

// Store failures are retryable from the caller's point of view; anything the
// store reports as malformed data is an invariant violation instead and is
// mapped explicitly at the call site.
impl From<rusqlite::Error> for CaronteError {
    fn from(err: rusqlite::Error) -> Self {
        CaronteError::Transient(err.to_string())
    }
}

impl From<std::io::Error> for CaronteError {
    fn from(err: std::io::Error) -> Self {
        CaronteError::Transient(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaronteError>;
