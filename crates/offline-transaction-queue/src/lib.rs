//! Durable, ordered queue of transactions awaiting the remote ledger.
//!
//! The disk rows are the record, the in-memory deque is the cache. Enqueue
//! writes the row before the in-memory append so a crash between enqueue
//! and drain never loses a transaction. The queue never reorders and never
//! deduplicates: ordering is a correctness requirement (a refund may
//! reference an earlier session spend), and duplicate forwarding is
//! tolerated downstream via idempotent submission.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use timebank_database::{Database, DatabaseError, PendingTransaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Queue error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;

/// Durable FIFO queue of pending transactions for one account.
pub struct OfflineTransactionQueue {
    account_id: String,
    db: Arc<Database>,
    pending: Mutex<VecDeque<PendingTransaction>>,
}

impl OfflineTransactionQueue {
    /// Create a queue for an account. Call [`load`](Self::load) to recover
    /// rows persisted by a previous process.
    pub fn new(account_id: &str, db: Arc<Database>) -> Self {
        Self {
            account_id: account_id.to_string(),
            db,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Get the account this queue belongs to.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Load persisted rows into memory (crash recovery).
    pub async fn load(&self) -> QueueResult<()> {
        let rows = self.db.list_pending_transactions(&self.account_id)?;
        let mut pending = self.pending.lock().await;
        pending.clear();
        pending.extend(rows);
        if !pending.is_empty() {
            info!(
                account_id = %self.account_id,
                count = pending.len(),
                "Recovered pending transactions"
            );
        }
        Ok(())
    }

    /// Append a transaction. The durable row is written before the
    /// in-memory copy becomes visible.
    pub async fn enqueue(&self, tx: PendingTransaction) -> QueueResult<()> {
        self.db.insert_pending_transaction(&tx)?;

        let mut pending = self.pending.lock().await;
        debug!(
            account_id = %self.account_id,
            tx_id = %tx.id,
            seconds_delta = tx.seconds_delta,
            "Enqueued pending transaction"
        );
        pending.push_back(tx);
        Ok(())
    }

    /// Snapshot the queue contents in enqueue order without removing them.
    pub async fn drain_in_order(&self) -> Vec<PendingTransaction> {
        self.pending.lock().await.iter().cloned().collect()
    }

    /// All queued transactions in enqueue order.
    pub async fn all(&self) -> Vec<PendingTransaction> {
        self.drain_in_order().await
    }

    /// Remove transactions the ledger has confirmed (or permanently
    /// rejected). Returns the number removed from durable storage.
    pub async fn remove_confirmed(&self, tx_ids: &[String]) -> QueueResult<usize> {
        let removed = self.db.delete_pending_transactions(tx_ids)?;

        let mut pending = self.pending.lock().await;
        pending.retain(|tx| !tx_ids.contains(&tx.id));

        if removed > 0 {
            debug!(
                account_id = %self.account_id,
                removed,
                remaining = pending.len(),
                "Removed confirmed transactions"
            );
        }
        Ok(removed)
    }

    /// Number of transactions waiting for confirmation.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timebank_database::{TransactionKind, TransactionSource};

    fn tx(delta: i64, description: &str) -> PendingTransaction {
        let kind = if delta < 0 {
            TransactionKind::Spend
        } else {
            TransactionKind::Earn
        };
        PendingTransaction::new(
            "acct-1",
            kind,
            delta,
            description,
            TransactionSource::Manual,
            "device-1",
        )
    }

    fn queue() -> OfflineTransactionQueue {
        let db = Arc::new(Database::open_in_memory().unwrap());
        OfflineTransactionQueue::new("acct-1", db)
    }

    #[tokio::test]
    async fn test_enqueue_and_order() {
        let queue = queue();
        queue.enqueue(tx(-300, "a")).await.unwrap();
        queue.enqueue(tx(120, "b")).await.unwrap();
        queue.enqueue(tx(-60, "c")).await.unwrap();

        assert_eq!(queue.pending_count().await, 3);
        let snapshot = queue.drain_in_order().await;
        assert_eq!(
            snapshot.iter().map(|t| t.description.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );

        // Snapshot does not remove
        assert_eq!(queue.pending_count().await, 3);
    }

    #[tokio::test]
    async fn test_remove_confirmed() {
        let queue = queue();
        let a = tx(-300, "a");
        let b = tx(120, "b");
        let a_id = a.id.clone();
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();

        let removed = queue.remove_confirmed(&[a_id]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.pending_count().await, 1);
        assert_eq!(queue.all().await[0].description, "b");
    }

    #[tokio::test]
    async fn test_crash_recovery_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timebank.sqlite");

        let descriptions = ["first", "second", "third"];
        {
            let db = Arc::new(Database::open(&path).unwrap());
            let queue = OfflineTransactionQueue::new("acct-1", db);
            for d in descriptions {
                queue.enqueue(tx(-10, d)).await.unwrap();
            }
            // Simulated crash: no clean shutdown, everything dropped
        }

        let db = Arc::new(Database::open(&path).unwrap());
        let queue = OfflineTransactionQueue::new("acct-1", db);
        queue.load().await.unwrap();

        let recovered = queue.drain_in_order().await;
        assert_eq!(recovered.len(), 3);
        assert_eq!(
            recovered.iter().map(|t| t.description.as_str()).collect::<Vec<_>>(),
            descriptions
        );
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = OfflineTransactionQueue::new("acct-1", db);
        queue.enqueue(tx(-10, "a")).await.unwrap();

        queue.load().await.unwrap();
        queue.load().await.unwrap();
        assert_eq!(queue.pending_count().await, 1);
    }
}
