//! Session lifecycle manager.

use crate::{EnforcementSink, TimeBankError, TimeBankResult};
use balance_cache::LocalBalanceCache;
use chrono::{Duration, Utc};
use connectivity_oracle::ConnectivityOracle;
use ledger_client::{LedgerService, RemoteSessionConfirmation};
use offline_transaction_queue::OfflineTransactionQueue;
use std::sync::Arc;
use timebank_database::{
    Database, PendingTransaction, SessionStatus, TransactionKind, TransactionSource,
    UnlockedSession,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Metadata key linking a transaction to its session.
const SESSION_ID_KEY: &str = "session_id";

/// Owns the single allowed unlocked session per account.
///
/// Callers (the facade) serialize start/cancel/expiry within one
/// mutual-exclusion region; the internal lock only protects the active
/// session slot.
pub struct SessionLifecycleManager {
    account_id: String,
    device_identifier: String,
    db: Arc<Database>,
    cache: Arc<LocalBalanceCache>,
    queue: Arc<OfflineTransactionQueue>,
    ledger: Arc<dyn LedgerService>,
    oracle: Arc<ConnectivityOracle>,
    enforcement: Arc<dyn EnforcementSink>,
    active: Mutex<Option<UnlockedSession>>,
}

impl SessionLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: &str,
        device_identifier: &str,
        db: Arc<Database>,
        cache: Arc<LocalBalanceCache>,
        queue: Arc<OfflineTransactionQueue>,
        ledger: Arc<dyn LedgerService>,
        oracle: Arc<ConnectivityOracle>,
        enforcement: Arc<dyn EnforcementSink>,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            device_identifier: device_identifier.to_string(),
            db,
            cache,
            queue,
            ledger,
            oracle,
            enforcement,
            active: Mutex::new(None),
        }
    }

    /// The currently active session, if any.
    pub async fn active_session(&self) -> Option<UnlockedSession> {
        self.active.lock().await.clone()
    }

    /// Resume a persisted active session at startup.
    ///
    /// A session whose end already passed while the process was down is
    /// expired immediately rather than resumed. Returns the session that is
    /// still active, if any.
    pub async fn load_active_session(&self) -> TimeBankResult<Option<UnlockedSession>> {
        let Some(mut session) = self.db.get_active_session(&self.account_id)? else {
            return Ok(None);
        };

        if session.is_past_end(Utc::now()) {
            info!(session_id = %session.id, "Expiring stale session from previous run");
            self.db
                .update_session_status(&session.id, SessionStatus::Expired)?;
            session.status = SessionStatus::Expired;
            self.enforcement.restrictions_restored(&session);
            return Ok(None);
        }

        info!(
            session_id = %session.id,
            ends_at = %session.ends_at,
            "Resumed active session"
        );
        let mut active = self.active.lock().await;
        *active = Some(session.clone());
        Ok(Some(session))
    }

    /// Start a new unlocked session, spending `duration_seconds` of balance.
    ///
    /// The balance check reads the optimistic projection, so an offline
    /// start may overspend against unconfirmed earns; reconciliation
    /// corrects it. Remote failures degrade to the offline path; the
    /// precondition rejections never do.
    pub async fn start_session(&self, duration_seconds: i64) -> TimeBankResult<UnlockedSession> {
        if duration_seconds <= 0 {
            return Err(TimeBankError::InvalidDuration(duration_seconds));
        }

        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|s| s.status == SessionStatus::Active) {
            return Err(TimeBankError::ActiveSessionExists);
        }

        let available = self.cache.current_seconds();
        if available < duration_seconds {
            return Err(TimeBankError::InsufficientBalance {
                required: duration_seconds,
                available,
            });
        }

        let session = if self.oracle.current().is_connected {
            match self
                .ledger
                .start_session_remote(&self.account_id, duration_seconds, &self.device_identifier)
                .await
            {
                Ok(confirmation) => self.finish_online_start(duration_seconds, confirmation)?,
                Err(e) => {
                    warn!(error = %e, "Remote session start failed, using offline path");
                    self.start_offline(duration_seconds).await?
                }
            }
        } else {
            self.start_offline(duration_seconds).await?
        };

        *active = Some(session.clone());
        self.enforcement.restrictions_lifted(&session);
        info!(
            session_id = %session.id,
            duration_seconds,
            ends_at = %session.ends_at,
            "Session started"
        );
        Ok(session)
    }

    /// Cancel the active session, refunding the unused remainder.
    pub async fn cancel_session(&self) -> TimeBankResult<UnlockedSession> {
        let mut active = self.active.lock().await;
        let Some(current) = active.as_ref() else {
            return Err(TimeBankError::NoActiveSession);
        };
        let mut session = current.clone();

        // Rounded up in the account's favor.
        let remaining = session.remaining_seconds(Utc::now());

        // Status write first: a failure here leaves the slot and the row
        // untouched, so the cancel can simply be retried.
        self.db
            .update_session_status(&session.id, SessionStatus::Cancelled)?;

        if remaining > 0 {
            let refund = PendingTransaction::new(
                &self.account_id,
                TransactionKind::AdminAdjustment,
                remaining,
                "Refund for cancelled session",
                TransactionSource::AdminAdjustment,
                &self.device_identifier,
            )
            .with_metadata(SESSION_ID_KEY, &session.id);

            self.settle_transaction(refund).await?;
        }

        *active = None;
        session.status = SessionStatus::Cancelled;
        session.updated_at = Utc::now();

        self.enforcement.restrictions_restored(&session);
        info!(
            session_id = %session.id,
            refunded_seconds = remaining,
            "Session cancelled"
        );
        Ok(session)
    }

    /// Expire the active session once its end time has passed.
    ///
    /// Invoked by a coarse periodic sweep, so expiry is detected within the
    /// sweep interval rather than at the exact instant. No refund: the full
    /// duration was consumed as intended.
    pub async fn check_expiry(&self) -> TimeBankResult<Option<UnlockedSession>> {
        let mut active = self.active.lock().await;
        let Some(current) = active.as_ref().filter(|s| s.is_past_end(Utc::now())) else {
            return Ok(None);
        };
        let mut session = current.clone();

        // The slot is cleared only after the row update lands; a failed
        // write leaves the session in place for the next sweep.
        self.db
            .update_session_status(&session.id, SessionStatus::Expired)?;
        *active = None;
        session.status = SessionStatus::Expired;
        session.updated_at = Utc::now();

        self.enforcement.restrictions_restored(&session);
        info!(session_id = %session.id, "Session expired");
        Ok(Some(session))
    }

    /// Credit earned time, e.g. for a completed task.
    ///
    /// Submitted immediately when online, queued otherwise; the local
    /// projection reflects the credit right away either way.
    pub async fn record_earn(
        &self,
        seconds: i64,
        description: &str,
        source: TransactionSource,
    ) -> TimeBankResult<()> {
        if seconds <= 0 {
            return Err(TimeBankError::InvalidDuration(seconds));
        }

        let earn = PendingTransaction::new(
            &self.account_id,
            TransactionKind::Earn,
            seconds,
            description,
            source,
            &self.device_identifier,
        );
        self.settle_transaction(earn).await?;
        info!(seconds, description, "Earn recorded");
        Ok(())
    }

    /// Offline start: enqueue the spend and apply it optimistically.
    async fn start_offline(&self, duration_seconds: i64) -> TimeBankResult<UnlockedSession> {
        let session = self.build_session(uuid::Uuid::new_v4().to_string(), duration_seconds);

        let spend = PendingTransaction::new(
            &self.account_id,
            TransactionKind::Spend,
            -duration_seconds,
            "Unlocked session",
            TransactionSource::UnlockedSession,
            &self.device_identifier,
        )
        .with_metadata(SESSION_ID_KEY, &session.id);

        self.queue.enqueue(spend.clone()).await?;
        self.cache.apply_local_delta(&spend)?;
        self.db.insert_unlocked_session(&session)?;

        debug!(session_id = %session.id, "Session started offline");
        Ok(session)
    }

    /// Online start: the server already debited; record its answer.
    fn finish_online_start(
        &self,
        duration_seconds: i64,
        confirmation: RemoteSessionConfirmation,
    ) -> TimeBankResult<UnlockedSession> {
        let session = self.build_session(confirmation.session_id.clone(), duration_seconds);
        self.cache
            .replace_with_authoritative(confirmation.balance_after)?;
        self.db.insert_unlocked_session(&session)?;

        debug!(session_id = %session.id, "Session started online");
        Ok(session)
    }

    /// Submit a transaction now when online and nothing older is still
    /// queued; otherwise queue it so it reaches the ledger after the
    /// earlier entries. Either way the local projection reflects it
    /// immediately.
    async fn settle_transaction(&self, tx: PendingTransaction) -> TimeBankResult<()> {
        if self.oracle.current().is_connected && self.queue.is_empty().await {
            match self.ledger.submit_transaction(&tx).await {
                Ok(entry) => {
                    debug!(tx_id = %tx.id, entry_id = %entry.id, "Transaction submitted online");
                    self.cache.apply_local_delta(&tx)?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(tx_id = %tx.id, error = %e, "Online submission failed, queueing");
                }
            }
        }

        self.queue.enqueue(tx.clone()).await?;
        self.cache.apply_local_delta(&tx)?;
        Ok(())
    }

    fn build_session(&self, id: String, duration_seconds: i64) -> UnlockedSession {
        let now = Utc::now();
        UnlockedSession {
            id,
            account_id: self.account_id.clone(),
            duration_seconds,
            cost_seconds: duration_seconds,
            started_at: now,
            ends_at: now + Duration::seconds(duration_seconds),
            status: SessionStatus::Active,
            device_identifier: self.device_identifier.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopEnforcement;
    use connectivity_oracle::ConnectivityState;
    use ledger_client::testing::MockLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use timebank_database::Balance;

    struct CountingEnforcement {
        lifted: AtomicUsize,
        restored: AtomicUsize,
    }

    impl CountingEnforcement {
        fn new() -> Self {
            Self {
                lifted: AtomicUsize::new(0),
                restored: AtomicUsize::new(0),
            }
        }
    }

    impl EnforcementSink for CountingEnforcement {
        fn restrictions_lifted(&self, _session: &UnlockedSession) {
            self.lifted.fetch_add(1, Ordering::SeqCst);
        }
        fn restrictions_restored(&self, _session: &UnlockedSession) {
            self.restored.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        db: Arc<Database>,
        ledger: Arc<MockLedger>,
        cache: Arc<LocalBalanceCache>,
        queue: Arc<OfflineTransactionQueue>,
        oracle: Arc<ConnectivityOracle>,
        enforcement: Arc<CountingEnforcement>,
        manager: SessionLifecycleManager,
    }

    fn fixture(initial_seconds: i64) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ledger = Arc::new(MockLedger::new("acct-1", initial_seconds));
        let cache = Arc::new(LocalBalanceCache::new("acct-1", db.clone()));
        let queue = Arc::new(OfflineTransactionQueue::new("acct-1", db.clone()));
        let oracle = Arc::new(ConnectivityOracle::new());
        let enforcement = Arc::new(CountingEnforcement::new());

        cache
            .replace_with_authoritative(Balance {
                account_id: "acct-1".to_string(),
                current_seconds: initial_seconds,
                lifetime_earned_seconds: initial_seconds,
                lifetime_spent_seconds: 0,
                daily_limit_seconds: 0,
                weekly_limit_seconds: 0,
                updated_at: Utc::now(),
            })
            .unwrap();

        let manager = SessionLifecycleManager::new(
            "acct-1",
            "device-1",
            db.clone(),
            cache.clone(),
            queue.clone(),
            ledger.clone(),
            oracle.clone(),
            enforcement.clone(),
        );

        Fixture {
            db,
            ledger,
            cache,
            queue,
            oracle,
            enforcement,
            manager,
        }
    }

    #[tokio::test]
    async fn test_invalid_duration_rejected() {
        let f = fixture(600);
        assert!(matches!(
            f.manager.start_session(0).await,
            Err(TimeBankError::InvalidDuration(0))
        ));
        assert!(matches!(
            f.manager.start_session(-10).await,
            Err(TimeBankError::InvalidDuration(-10))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let f = fixture(100);
        let err = f.manager.start_session(300).await.unwrap_err();
        match err {
            TimeBankError::InsufficientBalance { required, available } => {
                assert_eq!(required, 300);
                assert_eq!(available, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_start_queues_and_debits() {
        let f = fixture(600);

        let session = f.manager.start_session(300).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.cost_seconds, 300);

        // Optimistic debit, spend queued, nothing hit the server
        assert_eq!(f.cache.current_seconds(), 300);
        assert_eq!(f.queue.pending_count().await, 1);
        assert!(f.ledger.submission_log().is_empty());
        assert_eq!(f.enforcement.lifted.load(Ordering::SeqCst), 1);

        // Persisted as active
        assert!(f.db.get_active_session("acct-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_online_start_uses_server_response() {
        let f = fixture(600);
        f.oracle.report(ConnectivityState::wifi());

        let session = f.manager.start_session(300).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        // Server debited; no queued transaction
        assert_eq!(f.ledger.balance_seconds(), 300);
        assert_eq!(f.cache.current_seconds(), 300);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_online_start_falls_back_on_transport_failure() {
        let f = fixture(600);
        f.oracle.report(ConnectivityState::wifi());
        f.ledger.set_transport_failing(true);

        let session = f.manager.start_session(300).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        // Degraded to the offline path
        assert_eq!(f.cache.current_seconds(), 300);
        assert_eq!(f.queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let f = fixture(600);
        f.manager.start_session(100).await.unwrap();

        assert!(matches!(
            f.manager.start_session(100).await,
            Err(TimeBankError::ActiveSessionExists)
        ));
    }

    #[tokio::test]
    async fn test_cancel_without_session_rejected() {
        let f = fixture(600);
        assert!(matches!(
            f.manager.cancel_session().await,
            Err(TimeBankError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_cancel_refunds_remaining() {
        let f = fixture(600);
        f.manager.start_session(300).await.unwrap();
        assert_eq!(f.cache.current_seconds(), 300);

        let cancelled = f.manager.cancel_session().await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        // Refund of (almost) the whole duration; 1s of rounding tolerance
        let balance = f.cache.current_seconds();
        assert!((599..=600).contains(&balance), "balance was {balance}");

        // Spend plus refund queued, order preserved
        let queued = f.queue.drain_in_order().await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].kind, TransactionKind::Spend);
        assert_eq!(queued[1].kind, TransactionKind::AdminAdjustment);
        assert!(queued[1].seconds_delta > 0);
        assert_eq!(
            queued[1].metadata.get("session_id").unwrap(),
            &cancelled.id
        );

        assert_eq!(f.enforcement.restored.load(Ordering::SeqCst), 1);
        assert!(f.manager.active_session().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_partway_refunds_unused_remainder() {
        let f = fixture(600);
        // A 10-minute session that started 4 minutes ago
        let now = Utc::now();
        let session = UnlockedSession {
            id: "sess-1".to_string(),
            account_id: "acct-1".to_string(),
            duration_seconds: 600,
            cost_seconds: 600,
            started_at: now - Duration::seconds(240),
            ends_at: now + Duration::seconds(360),
            status: SessionStatus::Active,
            device_identifier: "device-1".to_string(),
            created_at: now - Duration::seconds(240),
            updated_at: now - Duration::seconds(240),
        };
        f.db.insert_unlocked_session(&session).unwrap();
        f.manager.load_active_session().await.unwrap().unwrap();

        let cancelled = f.manager.cancel_session().await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        let queued = f.queue.drain_in_order().await;
        assert_eq!(queued.len(), 1);
        let refund = queued[0].seconds_delta;
        assert!((360..=361).contains(&refund), "refund was {refund}");
    }

    #[tokio::test]
    async fn test_cancel_submits_online() {
        let f = fixture(600);
        f.oracle.report(ConnectivityState::wifi());
        f.manager.start_session(300).await.unwrap();

        f.manager.cancel_session().await.unwrap();

        // Online start plus online cancel: the refund went straight to
        // the ledger, nothing was queued.
        assert!(f.queue.is_empty().await);
        assert_eq!(f.ledger.submission_log().len(), 1);
    }

    #[tokio::test]
    async fn test_online_cancel_queues_refund_behind_queued_spend() {
        let f = fixture(600);
        // Spend queued while offline; then connectivity returns before a
        // sync has drained it.
        f.manager.start_session(300).await.unwrap();
        f.oracle.report(ConnectivityState::wifi());

        f.manager.cancel_session().await.unwrap();

        // The refund must not reach the server ahead of the spend it
        // undoes, so it queues behind it.
        assert!(f.ledger.submission_log().is_empty());
        let queued = f.queue.drain_in_order().await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].kind, TransactionKind::Spend);
        assert_eq!(queued[1].kind, TransactionKind::AdminAdjustment);
    }

    #[tokio::test]
    async fn test_failed_cancel_keeps_active_session() {
        let f = fixture(600);
        // Session tracked in memory but its row is missing, so the status
        // update fails.
        let now = Utc::now();
        let session = UnlockedSession {
            id: "sess-ghost".to_string(),
            account_id: "acct-1".to_string(),
            duration_seconds: 300,
            cost_seconds: 300,
            started_at: now,
            ends_at: now + Duration::seconds(300),
            status: SessionStatus::Active,
            device_identifier: "device-1".to_string(),
            created_at: now,
            updated_at: now,
        };
        *f.manager.active.lock().await = Some(session);

        assert!(matches!(
            f.manager.cancel_session().await,
            Err(TimeBankError::Database(_))
        ));

        // The slot survives the failure: no refund was applied, and a new
        // start is still refused as a precondition, not a storage error.
        assert!(f.manager.active_session().await.is_some());
        assert!(f.queue.is_empty().await);
        assert_eq!(f.cache.current_seconds(), 600);
        assert!(matches!(
            f.manager.start_session(100).await,
            Err(TimeBankError::ActiveSessionExists)
        ));
    }

    #[tokio::test]
    async fn test_failed_expiry_leaves_session_for_next_sweep() {
        let f = fixture(600);
        let now = Utc::now();
        let session = UnlockedSession {
            id: "sess-ghost".to_string(),
            account_id: "acct-1".to_string(),
            duration_seconds: 60,
            cost_seconds: 60,
            started_at: now - Duration::seconds(120),
            ends_at: now - Duration::seconds(60),
            status: SessionStatus::Active,
            device_identifier: "device-1".to_string(),
            created_at: now - Duration::seconds(120),
            updated_at: now - Duration::seconds(120),
        };
        *f.manager.active.lock().await = Some(session.clone());

        assert!(f.manager.check_expiry().await.is_err());
        assert!(f.manager.active_session().await.is_some());

        // Once the row is there, the next sweep succeeds.
        f.db.insert_unlocked_session(&session).unwrap();
        let expired = f.manager.check_expiry().await.unwrap().unwrap();
        assert_eq!(expired.status, SessionStatus::Expired);
        assert!(f.manager.active_session().await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_without_refund() {
        let f = fixture(600);
        let now = Utc::now();
        let session = UnlockedSession {
            id: "sess-1".to_string(),
            account_id: "acct-1".to_string(),
            duration_seconds: 60,
            cost_seconds: 60,
            started_at: now - Duration::seconds(120),
            ends_at: now - Duration::seconds(60),
            status: SessionStatus::Active,
            device_identifier: "device-1".to_string(),
            created_at: now - Duration::seconds(120),
            updated_at: now - Duration::seconds(120),
        };
        f.db.insert_unlocked_session(&session).unwrap();
        *f.manager.active.lock().await = Some(session);

        let expired = f.manager.check_expiry().await.unwrap().unwrap();
        assert_eq!(expired.status, SessionStatus::Expired);

        // No refund transaction of any kind
        assert!(f.queue.is_empty().await);
        assert_eq!(f.cache.current_seconds(), 600);
        assert_eq!(f.enforcement.restored.load(Ordering::SeqCst), 1);
        assert!(f.manager.active_session().await.is_none());
    }

    #[tokio::test]
    async fn test_check_expiry_leaves_running_session() {
        let f = fixture(600);
        f.manager.start_session(300).await.unwrap();

        assert!(f.manager.check_expiry().await.unwrap().is_none());
        assert!(f.manager.active_session().await.is_some());
    }

    #[tokio::test]
    async fn test_stale_session_expired_at_startup() {
        let f = fixture(600);
        let now = Utc::now();
        let session = UnlockedSession {
            id: "sess-stale".to_string(),
            account_id: "acct-1".to_string(),
            duration_seconds: 60,
            cost_seconds: 60,
            started_at: now - Duration::seconds(3600),
            ends_at: now - Duration::seconds(3540),
            status: SessionStatus::Active,
            device_identifier: "device-1".to_string(),
            created_at: now - Duration::seconds(3600),
            updated_at: now - Duration::seconds(3600),
        };
        f.db.insert_unlocked_session(&session).unwrap();

        let resumed = f.manager.load_active_session().await.unwrap();
        assert!(resumed.is_none());
        assert!(f.manager.active_session().await.is_none());

        let recent = f.db.list_recent_sessions("acct-1", 10).unwrap();
        assert_eq!(recent[0].status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn test_record_earn_offline_queues_credit() {
        let f = fixture(100);
        f.manager
            .record_earn(120, "Chores done", TransactionSource::TaskReward)
            .await
            .unwrap();

        assert_eq!(f.cache.current_seconds(), 220);
        assert_eq!(f.queue.pending_count().await, 1);
        let queued = f.queue.drain_in_order().await;
        assert_eq!(queued[0].kind, TransactionKind::Earn);
        assert_eq!(queued[0].seconds_delta, 120);
    }

    #[tokio::test]
    async fn test_record_earn_online_submits_directly() {
        let f = fixture(100);
        f.oracle.report(ConnectivityState::wifi());

        f.manager
            .record_earn(120, "Chores done", TransactionSource::TaskReward)
            .await
            .unwrap();

        assert!(f.queue.is_empty().await);
        assert_eq!(f.ledger.balance_seconds(), 220);
        assert_eq!(f.cache.current_seconds(), 220);
    }

    #[tokio::test]
    async fn test_record_earn_rejects_nonpositive() {
        let f = fixture(100);
        assert!(matches!(
            f.manager
                .record_earn(0, "nope", TransactionSource::Manual)
                .await,
            Err(TimeBankError::InvalidDuration(0))
        ));
    }

    #[tokio::test]
    async fn test_noop_enforcement_compiles() {
        let f = fixture(600);
        let session = f.manager.start_session(60).await.unwrap();
        let sink = NoopEnforcement;
        sink.restrictions_lifted(&session);
        sink.restrictions_restored(&session);
    }
}
