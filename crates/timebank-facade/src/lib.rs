//! Single entry point tying the time bank components together.
//!
//! `TimeBank` owns one account's balance cache, offline queue, sync
//! reconciler, connectivity oracle and session manager, and serializes the
//! session-mutating operations (start, cancel, the expiry sweep) behind one
//! lock so their check-then-act sequences never interleave. Reads and sync
//! go through without that lock.

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use balance_cache::LocalBalanceCache;
use ledger_client::{HttpLedgerClient, HttpLedgerConfig};
use ledger_sync_reconciler::SyncReconciler;
use offline_transaction_queue::OfflineTransactionQueue;
use session_lifecycle::SessionLifecycleManager;
use timebank_config_and_utils::{load_or_create_device_identifier, Config, CoreError, Paths};
use timebank_database::Database;

pub use connectivity_oracle::{ConnectivityOracle, ConnectivityState, TransportType};
pub use ledger_client::{LedgerError, LedgerService};
pub use ledger_sync_reconciler::{SyncOutcome, SyncReport};
pub use session_lifecycle::{EnforcementSink, NoopEnforcement, TimeBankError, TimeBankResult};
pub use timebank_database::{
    Balance, DatabaseError, SessionStatus, TimeLedgerEntry, TransactionKind, TransactionSource,
    UnlockedSession,
};

/// How often the background sweep checks the active session for expiry.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Countdown publication cadence.
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Backstop sync interval when none is configured.
const DEFAULT_SYNC_BACKSTOP: Duration = Duration::from_secs(300);

/// Errors while assembling a `TimeBank` from configuration.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Ledger client error: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    TimeBank(#[from] TimeBankError),
}

/// One account's time bank: balance, queue, sessions and sync.
pub struct TimeBank {
    account_id: String,
    oracle: Arc<ConnectivityOracle>,
    cache: Arc<LocalBalanceCache>,
    queue: Arc<OfflineTransactionQueue>,
    reconciler: Arc<SyncReconciler>,
    sessions: Arc<SessionLifecycleManager>,
    /// Serializes start, cancel and the expiry sweep.
    op_lock: Arc<Mutex<()>>,
    sync_backstop: Duration,
    countdown_tx: watch::Sender<Option<i64>>,
    countdown_task: SyncMutex<Option<JoinHandle<()>>>,
    sweep_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl TimeBank {
    /// Assemble a time bank from already-built components.
    ///
    /// Loads the persisted balance snapshot and queued transactions, so the
    /// instance reflects durable state from the previous run immediately.
    pub async fn new(
        account_id: &str,
        device_identifier: &str,
        db: Arc<Database>,
        ledger: Arc<dyn LedgerService>,
        oracle: Arc<ConnectivityOracle>,
        enforcement: Arc<dyn EnforcementSink>,
    ) -> TimeBankResult<Self> {
        let cache = Arc::new(LocalBalanceCache::new(account_id, db.clone()));
        cache.load()?;

        let queue = Arc::new(OfflineTransactionQueue::new(account_id, db.clone()));
        queue.load().await?;

        let reconciler = Arc::new(SyncReconciler::new(
            account_id,
            ledger.clone(),
            queue.clone(),
            cache.clone(),
            oracle.clone(),
        ));

        let sessions = Arc::new(SessionLifecycleManager::new(
            account_id,
            device_identifier,
            db,
            cache.clone(),
            queue.clone(),
            ledger,
            oracle.clone(),
            enforcement,
        ));

        let (countdown_tx, _) = watch::channel(None);

        Ok(Self {
            account_id: account_id.to_string(),
            oracle,
            cache,
            queue,
            reconciler,
            sessions,
            op_lock: Arc::new(Mutex::new(())),
            sync_backstop: DEFAULT_SYNC_BACKSTOP,
            countdown_tx,
            countdown_task: SyncMutex::new(None),
            sweep_task: SyncMutex::new(None),
        })
    }

    /// Assemble a time bank from on-disk configuration.
    ///
    /// Opens the database under the configured base directory, loads or
    /// generates the device identifier, and points the HTTP ledger client
    /// at the configured API. The caller still decides the enforcement
    /// sink and feeds the connectivity oracle.
    pub async fn from_config(
        config: &Config,
        paths: &Paths,
        account_id: &str,
        enforcement: Arc<dyn EnforcementSink>,
    ) -> Result<Self, SetupError> {
        paths.ensure_dirs()?;
        let device_identifier = load_or_create_device_identifier(paths)?;
        let db = Arc::new(Database::open(&paths.database_file())?);

        let ledger: Arc<dyn LedgerService> = Arc::new(HttpLedgerClient::new(HttpLedgerConfig {
            api_url: config.ledger_api_url.clone(),
            ..HttpLedgerConfig::default()
        })?);

        let oracle = Arc::new(ConnectivityOracle::new());
        let mut bank =
            Self::new(account_id, &device_identifier, db, ledger, oracle, enforcement).await?;
        bank.sync_backstop = Duration::from_secs(config.sync_backstop_secs);
        Ok(bank)
    }

    /// Start background work: resume any persisted session, run the expiry
    /// sweep, and arm the sync triggers.
    pub async fn start(&self) -> TimeBankResult<()> {
        if self.sessions.load_active_session().await?.is_some() {
            self.spawn_countdown();
        }

        let mut sweep = self.sweep_task.lock();
        if sweep.is_none() {
            *sweep = Some(self.spawn_expiry_sweep());
        }
        drop(sweep);

        self.reconciler.start_with_backstop(self.sync_backstop);
        info!(account_id = %self.account_id, "Time bank started");
        Ok(())
    }

    /// Stop all background tasks. Durable state is already on disk.
    pub fn shutdown(&self) {
        self.reconciler.stop();
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.countdown_task.lock().take() {
            task.abort();
        }
        self.countdown_tx.send_replace(None);
        info!(account_id = %self.account_id, "Time bank stopped");
    }

    /// Start an unlocked session spending `duration_seconds` of balance.
    pub async fn start_session(&self, duration_seconds: i64) -> TimeBankResult<UnlockedSession> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.start_session(duration_seconds).await?;
        self.spawn_countdown();
        Ok(session)
    }

    /// Cancel the active session, refunding the unused remainder.
    pub async fn cancel_session(&self) -> TimeBankResult<UnlockedSession> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.cancel_session().await?;
        self.stop_countdown();
        Ok(session)
    }

    /// Credit earned time to the account.
    pub async fn record_earn(
        &self,
        seconds: i64,
        description: &str,
        source: TransactionSource,
    ) -> TimeBankResult<()> {
        let _guard = self.op_lock.lock().await;
        self.sessions.record_earn(seconds, description, source).await
    }

    /// The locally known balance, if a snapshot exists yet.
    pub fn balance(&self) -> Option<Balance> {
        self.cache.get()
    }

    /// Spendable seconds according to the optimistic projection.
    pub fn balance_seconds(&self) -> i64 {
        self.cache.current_seconds()
    }

    /// The active session, if any.
    pub async fn active_session(&self) -> Option<UnlockedSession> {
        self.sessions.active_session().await
    }

    /// Authoritative recent ledger entries from the last successful sync.
    pub fn recent_activity(&self) -> Vec<TimeLedgerEntry> {
        self.reconciler.recent_entries()
    }

    /// Transactions waiting to be forwarded to the ledger.
    pub async fn pending_transaction_count(&self) -> usize {
        self.queue.pending_count().await
    }

    /// Latest connectivity observation for this account's device.
    pub fn report_connectivity(&self, state: ConnectivityState) {
        self.oracle.report(state);
    }

    /// Current connectivity as last reported.
    pub fn connectivity(&self) -> ConnectivityState {
        self.oracle.current()
    }

    /// Run a sync right now instead of waiting for a trigger.
    pub async fn force_sync(&self) -> SyncOutcome {
        self.reconciler.perform_sync().await
    }

    /// Remaining seconds of the active session, updated every second.
    /// `None` means no session is active.
    pub fn subscribe_remaining(&self) -> watch::Receiver<Option<i64>> {
        self.countdown_tx.subscribe()
    }

    /// Publish the active session's remaining time until it ends or is
    /// cancelled. An existing countdown is replaced, not doubled.
    fn spawn_countdown(&self) {
        let mut guard = self.countdown_task.lock();
        if let Some(previous) = guard.take() {
            previous.abort();
        }

        let sessions = self.sessions.clone();
        let tx = self.countdown_tx.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = interval(COUNTDOWN_TICK);
            loop {
                ticker.tick().await;
                match sessions.active_session().await {
                    Some(session) if session.status == SessionStatus::Active => {
                        tx.send_replace(Some(session.remaining_seconds(Utc::now())));
                    }
                    _ => {
                        tx.send_replace(None);
                        break;
                    }
                }
            }
        }));
    }

    fn stop_countdown(&self) {
        if let Some(task) = self.countdown_task.lock().take() {
            task.abort();
        }
        self.countdown_tx.send_replace(None);
    }

    /// Periodic expiry detection. Expiry is noticed within the sweep
    /// interval, not at the exact end instant.
    fn spawn_expiry_sweep(&self) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let account_id = self.account_id.clone();
        let op_lock = self.op_lock.clone();
        tokio::spawn(async move {
            let mut ticker = interval(EXPIRY_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let _guard = op_lock.lock().await;
                match sessions.check_expiry().await {
                    Ok(Some(expired)) => {
                        info!(
                            account_id = %account_id,
                            session_id = %expired.id,
                            "Expiry sweep closed a session"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(account_id = %account_id, error = %e, "Expiry sweep failed");
                    }
                }
            }
        })
    }
}
