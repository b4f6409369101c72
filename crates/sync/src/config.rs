use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigSnafu, SyncResult};

pub const CONFIG_DIRECTORY_NAME: &str = "chatsync";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATABASE_FILE_NAME: &str = "chatsync.sqlite3";
pub const ENV_PREFIX: &str = "CHATSYNC_";

pub const DEFAULT_RECENCY_CAPACITY: usize = 5;
pub const DEFAULT_RECENCY_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyConfig {
    #[serde(default = "default_recency_capacity")]
    pub capacity: usize,
    #[serde(default = "default_recency_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            capacity: default_recency_capacity(),
            ttl_secs: default_recency_ttl_secs(),
        }
    }
}

impl RecencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: String::new(),
            timeout_secs: default_remote_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub recency: RecencyConfig,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recency: RecencyConfig::default(),
            database_path: default_database_path(),
            remote: RemoteConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatsync"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    /// Defaults, then the JSON file when present, then `CHATSYNC_*` variables
    /// (`CHATSYNC_RECENCY__CAPACITY=8`).
    pub fn load(path: &Path) -> SyncResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("sync config not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config = figment.extract::<Self>().context(ConfigSnafu {
            stage: "extract-sync-config",
            path: path.to_path_buf(),
        })?;
        Ok(config.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.recency.capacity = self.recency.capacity.max(1);
        self.recency.ttl_secs = self.recency.ttl_secs.max(1);
        self.remote.timeout_secs = self.remote.timeout_secs.max(1);
        self.remote.endpoint = self.remote.endpoint.trim().to_string();
        self.remote.auth_token = self.remote.auth_token.trim().to_string();
        if self.database_path.as_os_str().is_empty() {
            self.database_path = default_database_path();
        }
        self
    }
}

fn default_recency_capacity() -> usize {
    DEFAULT_RECENCY_CAPACITY
}

fn default_recency_ttl_secs() -> u64 {
    DEFAULT_RECENCY_TTL_SECS
}

fn default_remote_timeout_secs() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SECS
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(CONFIG_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".chatsync"))
        .join(DATABASE_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let config = SyncConfig::load(&jail.directory().join("absent.json")).unwrap();

            assert_eq!(config.recency, RecencyConfig::default());
            assert_eq!(config.recency.ttl(), Duration::from_secs(300));
            assert!(!config.remote.is_configured());
            Ok(())
        });
    }

    #[test]
    fn file_and_environment_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.json",
                r#"{
                    "recency": { "capacity": 8 },
                    "remote": { "endpoint": " https://sync.example.com ", "timeout_secs": 3 }
                }"#,
            )?;
            jail.set_env("CHATSYNC_RECENCY__TTL_SECS", "30");

            let config = SyncConfig::load(&jail.directory().join("config.json")).unwrap();

            assert_eq!(config.recency.capacity, 8);
            assert_eq!(config.recency.ttl_secs, 30);
            assert_eq!(config.remote.endpoint, "https://sync.example.com");
            assert_eq!(config.remote.timeout_secs, 3);
            Ok(())
        });
    }

    #[test]
    fn zero_bounds_are_clamped() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.json",
                r#"{ "recency": { "capacity": 0, "ttl_secs": 0 } }"#,
            )?;

            let config = SyncConfig::load(&jail.directory().join("config.json")).unwrap();

            assert_eq!(config.recency.capacity, 1);
            assert_eq!(config.recency.ttl_secs, 1);
            Ok(())
        });
    }

    #[test]
    fn malformed_values_surface_a_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("config.json", r#"{ "recency": { "capacity": "many" } }"#)?;

            let result = SyncConfig::load(&jail.directory().join("config.json"));

            assert!(matches!(result, Err(crate::SyncError::Config { .. })));
            Ok(())
        });
    }
}
