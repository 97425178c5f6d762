//! Scripted in-memory ledger for tests.
//!
//! Models the server-side behavior the contract demands: idempotent accept
//! keyed by transaction id, atomic session-start debit, and switchable
//! transport failures so sync failure paths can be exercised.

use crate::{LedgerError, LedgerResult, LedgerService, RemoteSessionConfirmation};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use timebank_database::{Balance, PendingTransaction, TimeLedgerEntry, TransactionKind};

struct MockState {
    balance: Balance,
    /// Accepted transaction ids mapped to their entries (idempotency).
    accepted: HashMap<String, TimeLedgerEntry>,
    entries: Vec<TimeLedgerEntry>,
    /// Order in which submissions were applied (excluding duplicates).
    submission_log: Vec<String>,
    transport_failing: bool,
    balance_fetch_failing: bool,
    rejected_ids: HashSet<String>,
}

/// In-memory `LedgerService` double.
pub struct MockLedger {
    state: Mutex<MockState>,
}

impl MockLedger {
    /// Create a mock ledger holding the given balance.
    pub fn new(account_id: &str, initial_seconds: i64) -> Self {
        Self {
            state: Mutex::new(MockState {
                balance: Balance {
                    account_id: account_id.to_string(),
                    current_seconds: initial_seconds,
                    lifetime_earned_seconds: initial_seconds,
                    lifetime_spent_seconds: 0,
                    daily_limit_seconds: 0,
                    weekly_limit_seconds: 0,
                    updated_at: Utc::now(),
                },
                accepted: HashMap::new(),
                entries: Vec::new(),
                submission_log: Vec::new(),
                transport_failing: false,
                balance_fetch_failing: false,
                rejected_ids: HashSet::new(),
            }),
        }
    }

    /// Make every call fail with a transport error.
    pub fn set_transport_failing(&self, failing: bool) {
        self.state.lock().unwrap().transport_failing = failing;
    }

    /// Make only balance/entry reads fail with a transport error.
    pub fn set_balance_fetch_failing(&self, failing: bool) {
        self.state.lock().unwrap().balance_fetch_failing = failing;
    }

    /// Permanently reject a specific transaction id.
    pub fn reject_transaction(&self, tx_id: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_ids
            .insert(tx_id.to_string());
    }

    /// Current server-side balance in seconds.
    pub fn balance_seconds(&self) -> i64 {
        self.state.lock().unwrap().balance.current_seconds
    }

    /// Ids of applied submissions, in order. Duplicates are not re-logged.
    pub fn submission_log(&self) -> Vec<String> {
        self.state.lock().unwrap().submission_log.clone()
    }

    /// Number of ledger entries recorded.
    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    fn apply_delta(state: &mut MockState, id: &str, kind: TransactionKind, delta: i64, description: &str) -> TimeLedgerEntry {
        state.balance.current_seconds += delta;
        if delta > 0 {
            state.balance.lifetime_earned_seconds += delta;
        } else {
            state.balance.lifetime_spent_seconds += -delta;
        }
        state.balance.updated_at = Utc::now();

        let entry = TimeLedgerEntry {
            id: format!("entry-{id}"),
            account_id: state.balance.account_id.clone(),
            kind,
            seconds_delta: delta,
            description: description.to_string(),
            balance_after_seconds: state.balance.current_seconds,
            recorded_at: Utc::now(),
        };
        state.entries.insert(0, entry.clone());
        entry
    }
}

#[async_trait]
impl LedgerService for MockLedger {
    async fn submit_transaction(
        &self,
        tx: &PendingTransaction,
    ) -> LedgerResult<TimeLedgerEntry> {
        let mut state = self.state.lock().unwrap();
        if state.transport_failing {
            return Err(LedgerError::Transport("mock transport down".into()));
        }
        if state.rejected_ids.contains(&tx.id) {
            return Err(LedgerError::Rejected("mock rejection".into()));
        }
        // Idempotent accept: a duplicate id returns the original entry
        // without changing the balance.
        if let Some(existing) = state.accepted.get(&tx.id) {
            return Ok(existing.clone());
        }

        let entry =
            Self::apply_delta(&mut state, &tx.id, tx.kind, tx.seconds_delta, &tx.description);
        state.accepted.insert(tx.id.clone(), entry.clone());
        state.submission_log.push(tx.id.clone());
        Ok(entry)
    }

    async fn get_balance(&self, account_id: &str) -> LedgerResult<Balance> {
        let state = self.state.lock().unwrap();
        if state.transport_failing || state.balance_fetch_failing {
            return Err(LedgerError::Transport("mock transport down".into()));
        }
        if state.balance.account_id != account_id {
            return Err(LedgerError::Rejected(format!(
                "unknown account: {account_id}"
            )));
        }
        Ok(state.balance.clone())
    }

    async fn get_recent_entries(
        &self,
        _account_id: &str,
        limit: u32,
    ) -> LedgerResult<Vec<TimeLedgerEntry>> {
        let state = self.state.lock().unwrap();
        if state.transport_failing || state.balance_fetch_failing {
            return Err(LedgerError::Transport("mock transport down".into()));
        }
        Ok(state.entries.iter().take(limit as usize).cloned().collect())
    }

    async fn start_session_remote(
        &self,
        account_id: &str,
        duration_seconds: i64,
        _device_identifier: &str,
    ) -> LedgerResult<RemoteSessionConfirmation> {
        let mut state = self.state.lock().unwrap();
        if state.transport_failing {
            return Err(LedgerError::Transport("mock transport down".into()));
        }
        if state.balance.account_id != account_id {
            return Err(LedgerError::Rejected(format!(
                "unknown account: {account_id}"
            )));
        }
        if state.balance.current_seconds < duration_seconds {
            return Err(LedgerError::Rejected("insufficient balance".into()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let entry = Self::apply_delta(
            &mut state,
            &session_id,
            TransactionKind::Spend,
            -duration_seconds,
            "Unlocked session",
        );
        state.submission_log.push(session_id.clone());

        Ok(RemoteSessionConfirmation {
            session_id,
            balance_after: state.balance.clone(),
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timebank_database::TransactionSource;

    fn spend_tx(seconds: i64) -> PendingTransaction {
        PendingTransaction::new(
            "acct-1",
            TransactionKind::Spend,
            -seconds,
            "spend",
            TransactionSource::UnlockedSession,
            "device-1",
        )
    }

    #[tokio::test]
    async fn test_submit_applies_delta() {
        let ledger = MockLedger::new("acct-1", 600);
        let entry = ledger.submit_transaction(&spend_tx(300)).await.unwrap();

        assert_eq!(entry.balance_after_seconds, 300);
        assert_eq!(ledger.balance_seconds(), 300);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_noop() {
        let ledger = MockLedger::new("acct-1", 600);
        let tx = spend_tx(100);

        let first = ledger.submit_transaction(&tx).await.unwrap();
        let second = ledger.submit_transaction(&tx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.balance_seconds(), 500);
        assert_eq!(ledger.submission_log().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let ledger = MockLedger::new("acct-1", 600);
        ledger.set_transport_failing(true);

        let err = ledger.submit_transaction(&spend_tx(100)).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(ledger.balance_seconds(), 600);
    }

    #[tokio::test]
    async fn test_remote_session_start_checks_balance() {
        let ledger = MockLedger::new("acct-1", 200);

        let err = ledger
            .start_session_remote("acct-1", 300, "device-1")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));

        let conf = ledger
            .start_session_remote("acct-1", 150, "device-1")
            .await
            .unwrap();
        assert_eq!(conf.balance_after.current_seconds, 50);
    }
}
