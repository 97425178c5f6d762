//! Unlocked-session lifecycle: start, cancel-with-refund, expiry.
//!
//! A session is a pre-paid lease on consumed time. States move
//! `none -> active -> {expired, cancelled}`; the terminal states are final
//! and at most one session per account is active at any time. Starting
//! debits the ledger synchronously when online and falls back to the
//! offline queue otherwise; cancelling refunds the unused remainder;
//! natural expiry consumes the full duration and refunds nothing.

mod enforcement;
mod error;
mod manager;

pub use enforcement::{EnforcementSink, NoopEnforcement};
pub use error::{TimeBankError, TimeBankResult};
pub use manager::SessionLifecycleManager;
