//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Authoritative consumable time balance for an account.
///
/// One row per account. The `current_seconds` value held locally may be an
/// optimistic projection; the remote ledger's copy is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: String,
    /// Remaining consumable balance in seconds. Never negative after a
    /// server-confirmed transaction; may transiently go negative in the
    /// local optimistic projection.
    pub current_seconds: i64,
    pub lifetime_earned_seconds: i64,
    pub lifetime_spent_seconds: i64,
    pub daily_limit_seconds: i64,
    pub weekly_limit_seconds: i64,
    pub updated_at: DateTime<Utc>,
}

/// Kind of balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Earn,
    Spend,
    AdminAdjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Spend => "spend",
            Self::AdminAdjustment => "admin_adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earn" => Some(Self::Earn),
            "spend" => Some(Self::Spend),
            "admin_adjustment" => Some(Self::AdminAdjustment),
            _ => None,
        }
    }
}

/// Producer of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    UnlockedSession,
    TaskReward,
    AdminAdjustment,
    Manual,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnlockedSession => "unlocked_session",
            Self::TaskReward => "task_reward",
            Self::AdminAdjustment => "admin_adjustment",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unlocked_session" => Some(Self::UnlockedSession),
            "task_reward" => Some(Self::TaskReward),
            "admin_adjustment" => Some(Self::AdminAdjustment),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// A balance change not yet confirmed by the remote ledger.
///
/// Created while offline or when a remote call fails; appended to the
/// durable queue; removed only after the ledger accepts it. Never mutated
/// in place. The `id` doubles as the idempotency key for submission, so
/// retrying an already-accepted transaction is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: String,
    pub account_id: String,
    pub kind: TransactionKind,
    /// Signed; positive for earn, negative for spend.
    pub seconds_delta: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
    pub source: TransactionSource,
    pub device_identifier: String,
    pub created_at: DateTime<Utc>,
}

impl PendingTransaction {
    /// Create a new pending transaction with a fresh id.
    pub fn new(
        account_id: &str,
        kind: TransactionKind,
        seconds_delta: i64,
        description: &str,
        source: TransactionSource,
        device_identifier: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            kind,
            seconds_delta,
            description: description.to_string(),
            metadata: HashMap::new(),
            source,
            device_identifier: device_identifier.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Attach a metadata key-value pair.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Authoritative, append-only ledger record returned by the remote ledger
/// once a transaction is accepted. Read-only on this side; populates the
/// recent-activity view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLedgerEntry {
    pub id: String,
    pub account_id: String,
    pub kind: TransactionKind,
    pub seconds_delta: i64,
    pub description: String,
    pub balance_after_seconds: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Status of an unlocked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// A spend-and-unlock lease on consumed time.
///
/// At most one session per account is `active` at any time, enforced both
/// in memory and by a partial unique index in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockedSession {
    pub id: String,
    pub account_id: String,
    pub duration_seconds: i64,
    /// Normally equal to `duration_seconds`.
    pub cost_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub device_identifier: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnlockedSession {
    /// Remaining whole seconds until `ends_at`, rounded up in the
    /// account's favor and clamped at zero.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        let ms = (self.ends_at - now).num_milliseconds();
        if ms <= 0 {
            0
        } else {
            (ms + 999) / 1000
        }
    }

    /// Whether the session has passed its end time.
    pub fn is_past_end(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }
}
