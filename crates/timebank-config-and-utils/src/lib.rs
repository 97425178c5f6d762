//! Core configuration and utilities for the time bank.

mod config;
mod device;
mod error;
mod logging;
mod paths;

pub use config::{Config, DEFAULT_LEDGER_API_URL, DEFAULT_LOG_LEVEL};
pub use device::load_or_create_device_identifier;
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_with_file};
pub use paths::Paths;
