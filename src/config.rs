//! Mirror configuration
//!
//! Defaults can be overridden from the environment or the CLI.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Environment variable for the dataset base directory
pub const DATA_DIR_ENV: &str = "SERVICETAG_DATA_DIR";

/// Environment variable for the HTTP timeout in seconds
pub const HTTP_TIMEOUT_ENV: &str = "SERVICETAG_HTTP_TIMEOUT_SECS";

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings shared by the synchronizer and the store
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Directory holding one dataset file per cloud
    pub data_dir: PathBuf,
    /// Timeout for discovery and download requests
    pub http_timeout: Duration,
    /// User agent sent to the provider
    pub user_agent: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            http_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: format!("servicetag-mirror/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl MirrorConfig {
    /// Build a config from defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(raw) = env::var(HTTP_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.http_timeout = Duration::from_secs(secs),
                _ => warn!(value = %raw, "Ignoring invalid {}", HTTP_TIMEOUT_ENV),
            }
        }

        config
    }

    /// Use a different dataset directory
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Use a different request timeout
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}
