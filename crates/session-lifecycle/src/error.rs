//! Time bank error taxonomy.

use balance_cache::CacheError;
use offline_transaction_queue::QueueError;
use thiserror::Error;
use timebank_database::DatabaseError;

/// User-facing and internal errors from session and balance operations.
///
/// Precondition violations propagate to the caller immediately; remote
/// failures on the online fast path degrade to the offline path instead of
/// surfacing here.
#[derive(Error, Debug)]
pub enum TimeBankError {
    /// The projected balance does not cover the requested duration.
    #[error("Insufficient balance: need {required}s, have {available}s")]
    InsufficientBalance { required: i64, available: i64 },

    /// A session is already active for this account.
    #[error("An unlocked session is already active")]
    ActiveSessionExists,

    /// No session is active to cancel.
    #[error("No active session")]
    NoActiveSession,

    /// Zero or negative duration requested.
    #[error("Invalid session duration: {0}s")]
    InvalidDuration(i64),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Balance cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Offline queue error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result type alias using TimeBankError.
pub type TimeBankResult<T> = Result<T, TimeBankError>;
