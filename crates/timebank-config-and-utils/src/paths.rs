//! File system paths for the time bank.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Device identifier filename under the base directory.
const DEVICE_ID_FILE_NAME: &str = "device-id";

/// Manages file system paths for the time bank's durable state.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for runtime files (~/.timebank)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.timebank`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".timebank"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.timebank).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.timebank/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the database file path (~/.timebank/timebank.sqlite).
    ///
    /// Holds the balance snapshot, the pending-transaction queue, and
    /// session records.
    pub fn database_file(&self) -> PathBuf {
        self.base_dir.join("timebank.sqlite")
    }

    /// Get the device identifier file path (~/.timebank/device-id).
    pub fn device_id_file(&self) -> PathBuf {
        self.base_dir.join(DEVICE_ID_FILE_NAME)
    }

    /// Get the logs directory (~/.timebank/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the log file path (~/.timebank/logs/timebank.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("timebank.jsonl")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
