//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_initial_schema(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Initial schema - balance snapshots, pending transactions, sessions.
fn migrate_v1_initial_schema(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: initial schema");

    // balance_snapshots table - last known authoritative balance plus any
    // local optimistic projection, one row per account.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS balance_snapshots (
            account_id TEXT PRIMARY KEY,
            current_seconds INTEGER NOT NULL,
            lifetime_earned_seconds INTEGER NOT NULL DEFAULT 0,
            lifetime_spent_seconds INTEGER NOT NULL DEFAULT 0,
            daily_limit_seconds INTEGER NOT NULL DEFAULT 0,
            weekly_limit_seconds INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        ",
    )?;

    // pending_transactions table - the durable offline queue. `seq`
    // preserves enqueue order; `tx_id` is the idempotency key sent to the
    // remote ledger.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pending_transactions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_id TEXT NOT NULL UNIQUE,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            seconds_delta INTEGER NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}',
            source TEXT NOT NULL,
            device_identifier TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_transactions_account
            ON pending_transactions(account_id, seq);
        ",
    )?;

    // unlocked_sessions table - active and historical sessions. The partial
    // unique index enforces at most one active session per account.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS unlocked_sessions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            duration_seconds INTEGER NOT NULL,
            cost_seconds INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ends_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            device_identifier TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_unlocked_sessions_one_active
            ON unlocked_sessions(account_id) WHERE status = 'active';
        CREATE INDEX IF NOT EXISTS idx_unlocked_sessions_account
            ON unlocked_sessions(account_id, started_at);
        ",
    )?;

    record_migration(conn, 1, "initial_schema")?;
    Ok(())
}
