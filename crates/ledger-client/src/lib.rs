//! Remote ledger service contract and HTTP client.
//!
//! The remote ledger is the single source of truth for balances. This crate
//! defines the minimal contract consumed by the reconciler and the session
//! lifecycle (`LedgerService`), the transport-vs-rejection error taxonomy
//! that drives retry decisions, and the production HTTP implementation.
//!
//! Submission is idempotent: the pending transaction's id is the
//! idempotency key, so resending an already-accepted transaction after a
//! partial network failure is a no-op on the server.

mod error;
mod http;
mod service;
pub mod testing;

pub use error::{LedgerError, LedgerResult};
pub use http::{HttpLedgerClient, HttpLedgerConfig};
pub use service::{LedgerService, RemoteSessionConfirmation};
