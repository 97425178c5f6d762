//! SQLite persistence layer for the time bank.
//!
//! This crate provides:
//! - Database migrations
//! - Model types for balance snapshots, pending transactions, and sessions
//! - Query helpers used by the cache, queue, and session lifecycle crates
//!
//! The database file holds all durable local state: the last authoritative
//! balance snapshot, the ordered queue of transactions not yet accepted by
//! the remote ledger, and unlocked-session records.

mod db;
mod error;
mod migrations;
mod models;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use migrations::run_migrations;
pub use models::*;
