//! Ledger client error types.

use thiserror::Error;

/// Errors from remote ledger calls.
///
/// The split between `Transport` and `Rejected` matters to callers: a
/// transport failure is retryable and must stop a queue drain to preserve
/// ordering, while a rejection is permanent and the transaction is dropped.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Network-level failure: unreachable, timeout, 5xx. Retryable.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The ledger permanently refused the request. Not retryable.
    #[error("Rejected by ledger: {0}")]
    Rejected(String),

    /// Malformed response payload.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LedgerError {
    /// Whether this error is a retryable transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::InvalidResponse(_))
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Transport(err.to_string())
    }
}

/// Result type alias using LedgerError.
pub type LedgerResult<T> = Result<T, LedgerError>;
