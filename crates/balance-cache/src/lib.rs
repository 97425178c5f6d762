//! Local balance cache: authoritative snapshot plus optimistic projection.
//!
//! The in-memory copy is the cache, the snapshot row is the durable record.
//! Applying a local delta is an optimistic, immediately user-visible update
//! that may later be superseded; `replace_with_authoritative` is the only
//! way to clear accumulated optimism. Every mutation persists before it is
//! visible to readers.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use timebank_database::{Balance, Database, DatabaseError, PendingTransaction};
use tracing::{debug, warn};

/// Balance cache error type.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// No snapshot exists to apply a delta against.
    #[error("No balance snapshot for account {0}")]
    NoSnapshot(String),
}

/// Result type alias using CacheError.
pub type CacheResult<T> = Result<T, CacheError>;

/// Durable snapshot of the last known balance for one account.
pub struct LocalBalanceCache {
    account_id: String,
    db: Arc<Database>,
    current: Mutex<Option<Balance>>,
}

impl LocalBalanceCache {
    /// Create a cache for an account. Call [`load`](Self::load) before use.
    pub fn new(account_id: &str, db: Arc<Database>) -> Self {
        Self {
            account_id: account_id.to_string(),
            db,
            current: Mutex::new(None),
        }
    }

    /// Reload the persisted snapshot, if any.
    pub fn load(&self) -> CacheResult<()> {
        let snapshot = self.db.get_balance_snapshot(&self.account_id)?;
        if let Some(ref balance) = snapshot {
            debug!(
                account_id = %self.account_id,
                current_seconds = balance.current_seconds,
                "Loaded balance snapshot"
            );
        }
        *self.current.lock() = snapshot;
        Ok(())
    }

    /// Get the current balance, if a snapshot exists.
    pub fn get(&self) -> Option<Balance> {
        self.current.lock().clone()
    }

    /// Current seconds of the optimistic projection; zero with no snapshot.
    pub fn current_seconds(&self) -> i64 {
        self.current
            .lock()
            .as_ref()
            .map(|b| b.current_seconds)
            .unwrap_or(0)
    }

    /// Apply a not-yet-confirmed transaction to the local projection.
    ///
    /// The projection may transiently go negative when an offline spend
    /// races a not-yet-applied offline earn; reconciliation corrects it.
    pub fn apply_local_delta(&self, tx: &PendingTransaction) -> CacheResult<Balance> {
        let mut guard = self.current.lock();
        let balance = guard
            .as_mut()
            .ok_or_else(|| CacheError::NoSnapshot(self.account_id.clone()))?;

        balance.current_seconds += tx.seconds_delta;
        if tx.seconds_delta > 0 {
            balance.lifetime_earned_seconds += tx.seconds_delta;
        } else {
            balance.lifetime_spent_seconds += -tx.seconds_delta;
        }
        balance.updated_at = Utc::now();

        if balance.current_seconds < 0 {
            warn!(
                account_id = %self.account_id,
                current_seconds = balance.current_seconds,
                "Optimistic projection went negative; awaiting reconciliation"
            );
        }

        self.db.upsert_balance_snapshot(balance)?;
        debug!(
            account_id = %self.account_id,
            tx_id = %tx.id,
            seconds_delta = tx.seconds_delta,
            current_seconds = balance.current_seconds,
            "Applied local delta"
        );
        Ok(balance.clone())
    }

    /// Replace the projection with the server's authoritative balance,
    /// discarding any accumulated optimism.
    pub fn replace_with_authoritative(&self, balance: Balance) -> CacheResult<()> {
        self.db.upsert_balance_snapshot(&balance)?;
        debug!(
            account_id = %self.account_id,
            current_seconds = balance.current_seconds,
            "Replaced with authoritative balance"
        );
        *self.current.lock() = Some(balance);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timebank_database::{TransactionKind, TransactionSource};

    fn balance(seconds: i64) -> Balance {
        Balance {
            account_id: "acct-1".to_string(),
            current_seconds: seconds,
            lifetime_earned_seconds: seconds,
            lifetime_spent_seconds: 0,
            daily_limit_seconds: 0,
            weekly_limit_seconds: 0,
            updated_at: Utc::now(),
        }
    }

    fn delta_tx(delta: i64) -> PendingTransaction {
        let kind = if delta < 0 {
            TransactionKind::Spend
        } else {
            TransactionKind::Earn
        };
        PendingTransaction::new("acct-1", kind, delta, "test", TransactionSource::Manual, "d-1")
    }

    fn cache() -> LocalBalanceCache {
        let db = Arc::new(Database::open_in_memory().unwrap());
        LocalBalanceCache::new("acct-1", db)
    }

    #[test]
    fn test_empty_cache() {
        let cache = cache();
        cache.load().unwrap();
        assert!(cache.get().is_none());
        assert_eq!(cache.current_seconds(), 0);
    }

    #[test]
    fn test_apply_delta_requires_snapshot() {
        let cache = cache();
        let result = cache.apply_local_delta(&delta_tx(-100));
        assert!(matches!(result, Err(CacheError::NoSnapshot(_))));
    }

    #[test]
    fn test_apply_delta_updates_and_persists() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = LocalBalanceCache::new("acct-1", db.clone());
        cache.replace_with_authoritative(balance(600)).unwrap();

        cache.apply_local_delta(&delta_tx(-300)).unwrap();
        assert_eq!(cache.current_seconds(), 300);
        assert_eq!(cache.get().unwrap().lifetime_spent_seconds, 300);

        cache.apply_local_delta(&delta_tx(120)).unwrap();
        assert_eq!(cache.current_seconds(), 420);
        assert_eq!(cache.get().unwrap().lifetime_earned_seconds, 720);

        // Persisted through to the snapshot row
        let persisted = db.get_balance_snapshot("acct-1").unwrap().unwrap();
        assert_eq!(persisted.current_seconds, 420);
    }

    #[test]
    fn test_projection_may_go_negative() {
        let cache = cache();
        cache.replace_with_authoritative(balance(100)).unwrap();

        cache.apply_local_delta(&delta_tx(-300)).unwrap();
        assert_eq!(cache.current_seconds(), -200);
    }

    #[test]
    fn test_authoritative_replace_discards_optimism() {
        let cache = cache();
        cache.replace_with_authoritative(balance(600)).unwrap();
        cache.apply_local_delta(&delta_tx(-300)).unwrap();

        cache.replace_with_authoritative(balance(450)).unwrap();
        assert_eq!(cache.current_seconds(), 450);
    }

    #[test]
    fn test_reload_survives_restart() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        {
            let cache = LocalBalanceCache::new("acct-1", db.clone());
            cache.replace_with_authoritative(balance(240)).unwrap();
        }

        let cache = LocalBalanceCache::new("acct-1", db);
        cache.load().unwrap();
        assert_eq!(cache.current_seconds(), 240);
    }
}
