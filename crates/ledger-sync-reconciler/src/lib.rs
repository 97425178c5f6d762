//! Drains the offline queue against the remote ledger and refreshes local
//! authoritative state.
//!
//! A sync forwards queued transactions strictly in enqueue order. A
//! transport failure stops the batch so a later transaction can never be
//! submitted ahead of a failed earlier one; a business-logic rejection
//! drops the transaction and continues so a permanently invalid entry
//! cannot block the queue forever. Confirmations are never rolled back: if
//! the follow-up balance refresh fails, the cache simply stays on its
//! optimistic projection until the next successful refresh.
//!
//! Sync is single-flight. A trigger while one is running coalesces into a
//! no-op; the next periodic or connectivity-triggered run picks up any
//! remaining work.

use balance_cache::LocalBalanceCache;
use connectivity_oracle::ConnectivityOracle;
use ledger_client::LedgerService;
use offline_transaction_queue::OfflineTransactionQueue;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use timebank_database::TimeLedgerEntry;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Backstop sync interval.
const SYNC_BACKSTOP_INTERVAL: Duration = Duration::from_secs(300);

/// How many recent ledger entries to keep for the activity view.
const RECENT_ENTRIES_LIMIT: u32 = 50;

/// What a `perform_sync` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another sync was already in flight; this call was a no-op.
    AlreadyRunning,
    /// The link was not suitable for sync; nothing was attempted.
    SkippedUnsuitable,
    /// A sync ran; see the report for what happened.
    Completed(SyncReport),
}

/// Per-run accounting for logging and inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Transactions the ledger accepted this run.
    pub submitted: usize,
    /// Transactions the ledger permanently rejected and we dropped.
    pub dropped: usize,
    /// Transactions still queued after this run.
    pub remaining: usize,
    /// Whether the authoritative refresh succeeded.
    pub refreshed: bool,
}

/// Single-flight reconciler between the local queue and the remote ledger.
pub struct SyncReconciler {
    account_id: String,
    ledger: Arc<dyn LedgerService>,
    queue: Arc<OfflineTransactionQueue>,
    cache: Arc<LocalBalanceCache>,
    oracle: Arc<ConnectivityOracle>,
    in_flight: AtomicBool,
    recent_entries: RwLock<Vec<TimeLedgerEntry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncReconciler {
    /// Create a reconciler.
    pub fn new(
        account_id: &str,
        ledger: Arc<dyn LedgerService>,
        queue: Arc<OfflineTransactionQueue>,
        cache: Arc<LocalBalanceCache>,
        oracle: Arc<ConnectivityOracle>,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            ledger,
            queue,
            cache,
            oracle,
            in_flight: AtomicBool::new(false),
            recent_entries: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the background triggers: a connectivity watcher that syncs
    /// after the oracle's suggested delay, and a periodic backstop whose
    /// first tick also covers process start/resume.
    pub fn start(self: &Arc<Self>) {
        self.start_with_backstop(SYNC_BACKSTOP_INTERVAL);
    }

    /// `start` with a caller-chosen backstop interval.
    pub fn start_with_backstop(self: &Arc<Self>, backstop: Duration) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!(account_id = %self.account_id, "Sync triggers already armed");
            return;
        }

        let watcher = {
            let this = Arc::clone(self);
            let mut rx = this.oracle.subscribe();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let state = *rx.borrow_and_update();
                    if !state.is_connected {
                        continue;
                    }
                    let delay = this.oracle.suggested_sync_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    this.perform_sync().await;
                }
            })
        };
        tasks.push(watcher);

        let backstop = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = interval(backstop);
                loop {
                    ticker.tick().await;
                    this.perform_sync().await;
                }
            })
        };
        tasks.push(backstop);
    }

    /// Stop the background trigger tasks.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Recent authoritative ledger entries, newest first, as of the last
    /// successful refresh.
    pub fn recent_entries(&self) -> Vec<TimeLedgerEntry> {
        self.recent_entries.read().clone()
    }

    /// Run a sync if the link is suitable and none is in flight.
    ///
    /// Safe to call repeatedly from any trigger; never propagates errors.
    pub async fn perform_sync(&self) -> SyncOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(account_id = %self.account_id, "Sync already in flight");
            return SyncOutcome::AlreadyRunning;
        }

        let outcome = self.sync_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    async fn sync_inner(&self) -> SyncOutcome {
        if !self.oracle.is_suitable_for_sync() {
            debug!(account_id = %self.account_id, "Link not suitable for sync");
            return SyncOutcome::SkippedUnsuitable;
        }

        let mut report = SyncReport::default();

        // Snapshot without mutating; rows are removed only after the
        // ledger's verdict is known.
        let snapshot = self.queue.drain_in_order().await;
        let mut settled_ids: Vec<String> = Vec::new();

        for tx in &snapshot {
            match self.ledger.submit_transaction(tx).await {
                Ok(entry) => {
                    debug!(
                        tx_id = %tx.id,
                        entry_id = %entry.id,
                        balance_after = entry.balance_after_seconds,
                        "Transaction confirmed"
                    );
                    settled_ids.push(tx.id.clone());
                    report.submitted += 1;
                }
                Err(e) if e.is_transport() => {
                    // Order must be preserved: nothing after this one may
                    // be submitted until it succeeds on a later attempt.
                    warn!(tx_id = %tx.id, error = %e, "Transport failure, stopping batch");
                    break;
                }
                Err(e) => {
                    warn!(tx_id = %tx.id, error = %e, "Transaction rejected, dropping");
                    settled_ids.push(tx.id.clone());
                    report.dropped += 1;
                }
            }
        }

        if !settled_ids.is_empty() {
            if let Err(e) = self.queue.remove_confirmed(&settled_ids).await {
                warn!(account_id = %self.account_id, error = %e, "Failed to remove settled transactions");
            }
        }
        report.remaining = self.queue.pending_count().await;

        report.refreshed = self.refresh_authoritative().await;

        info!(
            account_id = %self.account_id,
            submitted = report.submitted,
            dropped = report.dropped,
            remaining = report.remaining,
            refreshed = report.refreshed,
            "Sync complete"
        );
        SyncOutcome::Completed(report)
    }

    /// Refresh the balance and recent-activity view from the server.
    ///
    /// Failures here leave already-confirmed transactions confirmed; the
    /// cache keeps its optimistic projection until the next refresh.
    async fn refresh_authoritative(&self) -> bool {
        let balance = match self.ledger.get_balance(&self.account_id).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(account_id = %self.account_id, error = %e, "Balance refresh failed");
                return false;
            }
        };

        if let Err(e) = self.cache.replace_with_authoritative(balance) {
            warn!(account_id = %self.account_id, error = %e, "Failed to persist authoritative balance");
            return false;
        }

        match self
            .ledger
            .get_recent_entries(&self.account_id, RECENT_ENTRIES_LIMIT)
            .await
        {
            Ok(entries) => {
                *self.recent_entries.write() = entries;
            }
            Err(e) => {
                // Balance already refreshed; the stale activity view is
                // refreshed on the next run.
                warn!(account_id = %self.account_id, error = %e, "Entry refresh failed");
            }
        }
        true
    }
}
