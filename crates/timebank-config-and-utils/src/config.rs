//! Configuration management for the time bank.

use crate::{CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default remote ledger API URL (can be overridden at compile time via
/// the TIMEBANK_LEDGER_API_URL env var).
pub const DEFAULT_LEDGER_API_URL: &str = match option_env!("TIMEBANK_LEDGER_API_URL") {
    Some(url) => url,
    None => "https://ledger.timebank.dev",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default backstop sync interval in seconds.
const DEFAULT_SYNC_BACKSTOP_SECS: u64 = 300;

/// Main time bank configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Remote ledger API base URL.
    #[serde(default = "default_ledger_api_url")]
    pub ledger_api_url: String,
    /// Backstop sync interval in seconds.
    #[serde(default = "default_sync_backstop_secs")]
    pub sync_backstop_secs: u64,
}

fn default_ledger_api_url() -> String {
    DEFAULT_LEDGER_API_URL.to_string()
}

fn default_sync_backstop_secs() -> u64 {
    DEFAULT_SYNC_BACKSTOP_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            ledger_api_url: DEFAULT_LEDGER_API_URL.to_string(),
            sync_backstop_secs: DEFAULT_SYNC_BACKSTOP_SECS,
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("TIMEBANK_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }

    /// Get the ledger API URL as a parsed URL.
    pub fn ledger_api_url(&self) -> CoreResult<Url> {
        Ok(Url::parse(&self.ledger_api_url)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.ledger_api_url, DEFAULT_LEDGER_API_URL);
        assert_eq!(config.sync_backstop_secs, DEFAULT_SYNC_BACKSTOP_SECS);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "ledgerApiUrl": "https://ledger.example.com"
        }"#;
        // Field names are snake_case in the file; the camelCase key above
        // must be ignored and fall back to the default.
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.ledger_api_url, DEFAULT_LEDGER_API_URL);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.log_level = "trace".to_string();
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.log_level, "trace");
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.ledger_api_url, DEFAULT_LEDGER_API_URL);
    }

    #[test]
    fn test_config_ledger_api_url_parse() {
        let config = Config::default();
        let url = config.ledger_api_url().unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_config_invalid_url() {
        let mut config = Config::default();
        config.ledger_api_url = "not a valid url".to_string();
        assert!(config.ledger_api_url().is_err());
    }
}
