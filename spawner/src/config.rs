//! Spawner-wide settings, typically loaded from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigurationError;

const DEFAULT_USER: &str = "nobody";
const DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT: usize = 8;
const DEFAULT_REAP_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpawnerConfig {
    /// Lower privileges in the child. Only takes effect when the spawner runs as root.
    pub user_switching: bool,
    pub default_user: String,
    /// When unset, the default user's primary group is used.
    pub default_group: Option<String>,
    /// Upper bound on live connections (idle + checked out) per socket endpoint.
    pub max_connections_per_endpoint: usize,
    /// How long failure cleanup waits for a killed child to be reaped.
    pub reap_timeout_ms: u64,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            user_switching: true,
            default_user: DEFAULT_USER.to_string(),
            default_group: None,
            max_connections_per_endpoint: DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
            reap_timeout_ms: DEFAULT_REAP_TIMEOUT_MS,
        }
    }
}

impl SpawnerConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(contents).map_err(|source| ConfigurationError::ParseConfig { source })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigurationError::ReadConfig {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&contents)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }
}
