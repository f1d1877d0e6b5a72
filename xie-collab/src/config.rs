//! Server configuration, loaded from a JSON file.
//!
//! Every field has a default, so `{}` (or no file at all) is a working
//! configuration:
//!
//! ```json
//! {
//!   "bind_addr": "127.0.0.1:9090",
//!   "docs_dir": "docs",
//!   "outbound_capacity": 256,
//!   "housekeeping": {
//!     "period_secs": 2,
//!     "unload_after_secs": 7800,
//!     "session_idle_end_secs": 7200,
//!     "session_request_expiry_secs": 10
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Timing policy for the orchestrator's housekeeping pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// How often housekeeping runs
    pub period_secs: u64,
    /// Documents not accessed for this long are saved and unloaded.
    /// Must exceed `session_idle_end_secs`.
    pub unload_after_secs: u64,
    /// Sessions without activity for this long are terminated
    pub session_idle_end_secs: u64,
    /// Requested sessions not started within this time are dropped
    pub session_request_expiry_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            period_secs: 2,
            unload_after_secs: 7800,
            session_idle_end_secs: 7200,
            session_request_expiry_secs: 10,
        }
    }
}

impl HousekeepingConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn unload_after(&self) -> Duration {
        Duration::from_secs(self.unload_after_secs)
    }

    pub fn session_idle_end(&self) -> Duration {
        Duration::from_secs(self.session_idle_end_secs)
    }

    pub fn session_request_expiry(&self) -> Duration {
        Duration::from_secs(self.session_request_expiry_secs)
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// Directory holding one `<docId>.json` snapshot per document
    pub docs_dir: PathBuf,
    /// Messages buffered per peer before the dispatcher waits on it
    pub outbound_capacity: usize,
    pub housekeeping: HousekeepingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            docs_dir: PathBuf::from("docs"),
            outbound_capacity: 256,
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hk = &self.housekeeping;
        if hk.period_secs == 0 {
            return Err(ConfigError::Invalid(
                "housekeeping.period_secs must be positive".to_string(),
            ));
        }
        if hk.unload_after_secs <= hk.session_idle_end_secs {
            return Err(ConfigError::Invalid(format!(
                "housekeeping.unload_after_secs ({}) must be greater than session_idle_end_secs ({})",
                hk.unload_after_secs, hk.session_idle_end_secs
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
