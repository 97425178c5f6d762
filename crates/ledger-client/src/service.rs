//! The abstract remote ledger contract.

use crate::LedgerResult;
use async_trait::async_trait;
use timebank_database::{Balance, PendingTransaction, TimeLedgerEntry};

/// Confirmation returned by a remote session start.
#[derive(Debug, Clone)]
pub struct RemoteSessionConfirmation {
    /// Server-assigned session identifier.
    pub session_id: String,
    /// Authoritative balance after the debit.
    pub balance_after: Balance,
    /// The ledger entry recording the debit.
    pub entry: TimeLedgerEntry,
}

/// Minimal contract consumed from the remote ledger service.
///
/// All calls require an authenticated caller; authentication itself is an
/// external collaborator. Implementations must accept a resubmitted
/// transaction id as a no-op returning the original entry.
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Submit a transaction. Idempotent by the transaction's id.
    async fn submit_transaction(
        &self,
        tx: &PendingTransaction,
    ) -> LedgerResult<TimeLedgerEntry>;

    /// Fetch the authoritative balance for an account.
    async fn get_balance(&self, account_id: &str) -> LedgerResult<Balance>;

    /// Fetch recent ledger entries for an account, newest first.
    async fn get_recent_entries(
        &self,
        account_id: &str,
        limit: u32,
    ) -> LedgerResult<Vec<TimeLedgerEntry>>;

    /// Start a session on the server, debiting the balance atomically.
    async fn start_session_remote(
        &self,
        account_id: &str,
        duration_seconds: i64,
        device_identifier: &str,
    ) -> LedgerResult<RemoteSessionConfirmation>;
}
