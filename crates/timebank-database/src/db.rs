//! Database connection and query operations.

use crate::{
    migrations, Balance, DatabaseError, DatabaseResult, PendingTransaction, SessionStatus,
    TransactionKind, TransactionSource, UnlockedSession,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tracing::debug;

/// Database wrapper with query methods.
///
/// The connection is guarded by a mutex so the wrapper can be shared as
/// `Arc<Database>` across tasks. All queries are short and local-disk only.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL for concurrent readers; synchronous = FULL because the queue's
        // contract is that a crash after enqueue returns may not lose rows.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ==========================================
    // Balance snapshots
    // ==========================================

    /// Insert or replace the balance snapshot for an account.
    pub fn upsert_balance_snapshot(&self, balance: &Balance) -> DatabaseResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO balance_snapshots (account_id, current_seconds, lifetime_earned_seconds,
                lifetime_spent_seconds, daily_limit_seconds, weekly_limit_seconds, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_id) DO UPDATE SET
                current_seconds = excluded.current_seconds,
                lifetime_earned_seconds = excluded.lifetime_earned_seconds,
                lifetime_spent_seconds = excluded.lifetime_spent_seconds,
                daily_limit_seconds = excluded.daily_limit_seconds,
                weekly_limit_seconds = excluded.weekly_limit_seconds,
                updated_at = excluded.updated_at",
            params![
                balance.account_id,
                balance.current_seconds,
                balance.lifetime_earned_seconds,
                balance.lifetime_spent_seconds,
                balance.daily_limit_seconds,
                balance.weekly_limit_seconds,
                balance.updated_at.to_rfc3339(),
            ],
        )?;
        debug!(account_id = %balance.account_id, current_seconds = balance.current_seconds, "Balance snapshot persisted");
        Ok(())
    }

    /// Get the balance snapshot for an account, if one exists.
    pub fn get_balance_snapshot(&self, account_id: &str) -> DatabaseResult<Option<Balance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, current_seconds, lifetime_earned_seconds, lifetime_spent_seconds,
                    daily_limit_seconds, weekly_limit_seconds, updated_at
             FROM balance_snapshots WHERE account_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![account_id], row_to_balance)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ==========================================
    // Pending transactions (the durable queue)
    // ==========================================

    /// Append a pending transaction to the durable queue.
    pub fn insert_pending_transaction(&self, tx: &PendingTransaction) -> DatabaseResult<()> {
        let metadata = serde_json::to_string(&tx.metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pending_transactions
                (tx_id, account_id, kind, seconds_delta, description, metadata, source,
                 device_identifier, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tx.id,
                tx.account_id,
                tx.kind.as_str(),
                tx.seconds_delta,
                tx.description,
                metadata,
                tx.source.as_str(),
                tx.device_identifier,
                tx.created_at.to_rfc3339(),
            ],
        )?;
        debug!(tx_id = %tx.id, seconds_delta = tx.seconds_delta, "Pending transaction persisted");
        Ok(())
    }

    /// List pending transactions for an account in enqueue order.
    pub fn list_pending_transactions(
        &self,
        account_id: &str,
    ) -> DatabaseResult<Vec<PendingTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tx_id, account_id, kind, seconds_delta, description, metadata, source,
                    device_identifier, created_at
             FROM pending_transactions WHERE account_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![account_id], row_to_pending_transaction)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Delete pending transactions by id. Returns the number removed.
    pub fn delete_pending_transactions(&self, tx_ids: &[String]) -> DatabaseResult<usize> {
        let conn = self.conn.lock();
        let mut removed = 0;
        for tx_id in tx_ids {
            removed += conn.execute(
                "DELETE FROM pending_transactions WHERE tx_id = ?1",
                params![tx_id],
            )?;
        }
        debug!(removed, "Pending transactions removed");
        Ok(removed)
    }

    /// Count pending transactions for an account.
    pub fn pending_transaction_count(&self, account_id: &str) -> DatabaseResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_transactions WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ==========================================
    // Unlocked sessions
    // ==========================================

    /// Insert a new unlocked session.
    pub fn insert_unlocked_session(&self, session: &UnlockedSession) -> DatabaseResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO unlocked_sessions
                (id, account_id, duration_seconds, cost_seconds, started_at, ends_at, status,
                 device_identifier, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.account_id,
                session.duration_seconds,
                session.cost_seconds,
                session.started_at.to_rfc3339(),
                session.ends_at.to_rfc3339(),
                session.status.as_str(),
                session.device_identifier,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Update a session's status.
    pub fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE unlocked_sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), session_id],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(format!(
                "session {session_id}"
            )));
        }
        debug!(session_id = %session_id, status = status.as_str(), "Session status updated");
        Ok(())
    }

    /// Get the active session for an account, if any.
    pub fn get_active_session(&self, account_id: &str) -> DatabaseResult<Option<UnlockedSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, duration_seconds, cost_seconds, started_at, ends_at, status,
                    device_identifier, created_at, updated_at
             FROM unlocked_sessions WHERE account_id = ?1 AND status = 'active'",
        )?;
        let mut rows = stmt.query_map(params![account_id], row_to_session)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// List recent sessions for an account, newest first.
    pub fn list_recent_sessions(
        &self,
        account_id: &str,
        limit: u32,
    ) -> DatabaseResult<Vec<UnlockedSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, duration_seconds, cost_seconds, started_at, ends_at, status,
                    device_identifier, created_at, updated_at
             FROM unlocked_sessions WHERE account_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account_id, limit], row_to_session)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_kind(s: &str) -> rusqlite::Result<TransactionKind> {
    TransactionKind::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown transaction kind: {s}").into(),
        )
    })
}

fn row_to_balance(row: &Row<'_>) -> rusqlite::Result<Balance> {
    let updated_at: String = row.get(6)?;
    Ok(Balance {
        account_id: row.get(0)?,
        current_seconds: row.get(1)?,
        lifetime_earned_seconds: row.get(2)?,
        lifetime_spent_seconds: row.get(3)?,
        daily_limit_seconds: row.get(4)?,
        weekly_limit_seconds: row.get(5)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_pending_transaction(row: &Row<'_>) -> rusqlite::Result<PendingTransaction> {
    let kind: String = row.get(2)?;
    let metadata: String = row.get(5)?;
    let source: String = row.get(6)?;
    let created_at: String = row.get(8)?;

    Ok(PendingTransaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        kind: parse_kind(&kind)?,
        seconds_delta: row.get(3)?,
        description: row.get(4)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        source: TransactionSource::parse(&source).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                format!("unknown transaction source: {source}").into(),
            )
        })?,
        device_identifier: row.get(7)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<UnlockedSession> {
    let started_at: String = row.get(4)?;
    let ends_at: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(UnlockedSession {
        id: row.get(0)?,
        account_id: row.get(1)?,
        duration_seconds: row.get(2)?,
        cost_seconds: row.get(3)?,
        started_at: parse_timestamp(&started_at)?,
        ends_at: parse_timestamp(&ends_at)?,
        status: SessionStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                format!("unknown session status: {status}").into(),
            )
        })?,
        device_identifier: row.get(7)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
