//! Centralized configuration for Tidal.
//!
//! Every section deserializes from JSON with defaults for missing fields and
//! can be overridden from `TIDAL_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineConfig, EngineType};
use crate::filter::PeerFilterConfig;
use crate::network::ProxyConfig;
use crate::service::RetryPolicy;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Central configuration for all Tidal components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TidalConfig {
    pub client: ClientConfig,
    pub engines: Vec<EngineConfig>,
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub peer_filter: PeerFilterConfig,
    /// Initial proxy settings; the live value is a `Setting<ProxyConfig>`
    pub proxy: ProxyConfig,
}

impl Default for TidalConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            engines: vec![
                EngineConfig::new(EngineType::Libtorrent),
                EngineConfig::new(EngineType::RemoteService),
            ],
            service: ServiceConfig::default(),
            storage: StorageConfig::default(),
            peer_filter: PeerFilterConfig::default(),
            proxy: ProxyConfig::Disabled,
        }
    }
}

/// Identity this client presents to peers and HTTP servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Version string the fingerprint and user agent derive from
    pub version: String,
    /// Two-character client tag in the peer-id prefix
    pub fingerprint_tag: String,
    /// Product name in the user agent
    pub product: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            fingerprint_tag: "TD".to_string(),
            product: "tidal".to_string(),
        }
    }
}

/// Background download service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// `host:port` the service listens on
    pub address: String,
    /// Executable to spawn; `None` when the service is started externally
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    /// Delay after spawning before the first probe
    #[serde(with = "duration_millis")]
    pub warmup: Duration,
    pub probe_attempts: u32,
    #[serde(with = "duration_millis")]
    pub probe_interval: Duration,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// How often a connected service is checked for liveness
    #[serde(with = "duration_millis")]
    pub health_interval: Duration,
    /// Caller-side retry policy for handle acquisition
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:48620".to_string(),
            program: None,
            args: Vec::new(),
            warmup: Duration::from_millis(1500),
            probe_attempts: 10,
            probe_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
            health_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory sessions save downloads into
    pub save_dir: PathBuf,
    /// Directories searched for native engine libraries
    pub library_dirs: Vec<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("downloads"),
            library_dirs: vec![PathBuf::from("lib")],
        }
    }
}

impl TidalConfig {
    /// Loads a JSON config file; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Io` - If the file cannot be read
    /// - `ConfigError::Parse` - If the file is not valid JSON for this schema
    /// - `ConfigError::Invalid` - If a value fails validation
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// # Errors
    ///
    /// - `ConfigError::Parse` - If `text` is not valid JSON for this schema
    /// - `ConfigError::Invalid` - If a value fails validation
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration with environment variable overrides.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - If a variable does not parse or the result fails validation
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(version) = std::env::var("TIDAL_VERSION") {
            config.client.version = version;
        }

        if let Ok(proxy) = std::env::var("TIDAL_PROXY") {
            config.proxy = match proxy.trim() {
                "" | "none" => ProxyConfig::Disabled,
                url => ProxyConfig::http(url),
            };
        }

        if let Ok(address) = std::env::var("TIDAL_SERVICE_ADDR") {
            config.service.address = address;
        }

        if let Ok(warmup) = std::env::var("TIDAL_SERVICE_WARMUP_MS") {
            let millis = warmup.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                field: "TIDAL_SERVICE_WARMUP_MS",
                reason: format!("'{warmup}': {e}"),
            })?;
            config.service.warmup = Duration::from_millis(millis);
        }

        if let Ok(save_dir) = std::env::var("TIDAL_SAVE_DIR") {
            config.storage.save_dir = PathBuf::from(save_dir);
        }

        if let Ok(block) = std::env::var("TIDAL_BLOCK_INVALID_PEER_ID") {
            config.peer_filter.block_invalid_peer_id =
                block.trim().parse().map_err(|e| ConfigError::Invalid {
                    field: "TIDAL_BLOCK_INVALID_PEER_ID",
                    reason: format!("'{block}': {e}"),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Creates a fast, deterministic configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            engines: vec![EngineConfig::new(EngineType::Simulated)],
            service: ServiceConfig {
                warmup: Duration::ZERO,
                probe_attempts: 1,
                probe_interval: Duration::from_millis(1),
                connect_timeout: Duration::from_millis(100),
                health_interval: Duration::from_millis(50),
                retry: RetryPolicy {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    max_attempts: 3,
                },
                ..ServiceConfig::default()
            },
            storage: StorageConfig {
                save_dir: std::env::temp_dir().join("tidal-test"),
                library_dirs: Vec::new(),
            },
            ..Default::default()
        }
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - Naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tag = &self.client.fingerprint_tag;
        if tag.len() != 2 || !tag.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ConfigError::Invalid {
                field: "client.fingerprint_tag",
                reason: format!("expected two ASCII letters or digits, got '{tag}'"),
            });
        }

        self.proxy.validate().map_err(|e| ConfigError::Invalid {
            field: "proxy",
            reason: e.to_string(),
        })?;

        for (index, engine) in self.engines.iter().enumerate() {
            let duplicate = self.engines[..index]
                .iter()
                .any(|other| other.engine_type == engine.engine_type);
            if duplicate {
                return Err(ConfigError::Invalid {
                    field: "engines",
                    reason: format!("engine {} configured twice", engine.engine_type),
                });
            }
        }

        Ok(())
    }

    /// Config for `engine_type`, or its defaults when not listed.
    pub fn engine(&self, engine_type: EngineType) -> EngineConfig {
        self.engines
            .iter()
            .find(|engine| engine.engine_type == engine_type)
            .cloned()
            .unwrap_or_else(|| EngineConfig::new(engine_type))
    }
}

/// Serializes a `Duration` as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
