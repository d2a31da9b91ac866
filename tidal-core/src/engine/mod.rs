//! Pluggable download engines and their session lifecycle.
//!
//! An engine represents one backend. It reports whether its native
//! dependencies are usable, and builds the expensive [`DownloadSession`] on
//! demand. [`EngineInstanceCache`] keeps at most one session per engine and
//! [`EngineRegistry`] picks which engine to use.

pub mod cache;
pub mod fingerprint;
pub mod native;
pub mod native_engine;
pub mod registry;
pub mod service_backend;
pub mod simulation;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub use cache::EngineInstanceCache;
pub use fingerprint::{ClientFingerprint, PeerId};
pub use native::{LibraryLoadError, LibraryLoader, LibraryProbe, NativeLibrary, StaticLibrary};
pub use native_engine::{EngineDependencies, NativeBackend, NativeDownloadEngine};
pub use registry::{EngineRegistry, NetworkConditions};
pub use service_backend::{EndpointSessionFactory, RemoteSessionFactory, ServiceBackend};
pub use simulation::{SessionStats, SimulatedBackend, SimulatedSession};

use crate::filter::{PeerInfo, SharedFilterChain, Verdict};
use crate::network::{FetchError, HttpFetcher};
use crate::service::ServiceError;
use crate::setting::Setting;

/// Which backend a config or engine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    /// In-process engine backed by a native torrent library
    #[default]
    Libtorrent,
    /// Engine whose I/O runs inside a separate service process
    RemoteService,
    /// In-process engine without native dependencies
    Simulated,
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Libtorrent => write!(f, "libtorrent"),
            Self::RemoteService => write!(f, "remote-service"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// Where an engine's I/O actually executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineLocation {
    Local,
    Remote,
}

/// Backend configuration. Engines only ever act on the latest value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine_type: EngineType,
    pub enabled: bool,
    /// Download bandwidth limit in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Upload bandwidth limit in bytes per second (None = unlimited)
    pub upload_limit: Option<u64>,
    pub max_peer_connections: usize,
    /// Stop seeding once this upload/download ratio is reached
    pub share_ratio_limit: Option<f32>,
    pub enable_dht: bool,
}

impl EngineConfig {
    pub fn new(engine_type: EngineType) -> Self {
        Self {
            engine_type,
            ..Default::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_type: EngineType::default(),
            enabled: true,
            download_limit: None,
            upload_limit: None,
            max_peer_connections: 200,
            share_ratio_limit: None,
            enable_dht: true,
        }
    }
}

/// Errors from engine support checks and session construction.
///
/// `Clone` so one construction failure can be delivered to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine {engine} is not supported: {reason}")]
    Unsupported { engine: EngineType, reason: String },

    #[error("Engine {engine} failed to create a session: {reason}")]
    Construction { engine: EngineType, reason: String },

    #[error("Save directory {path} is unusable: {reason}")]
    SaveDirectory { path: PathBuf, reason: String },

    #[error("HTTP setup failed: {0}")]
    Http(#[from] FetchError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Engine {engine} has been shut down")]
    Closed { engine: EngineType },

    #[error("No usable download engine")]
    NoUsableEngine,
}

/// Filesystem location sessions save into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveDirectory {
    path: PathBuf,
}

impl SaveDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory if needed.
    ///
    /// # Errors
    ///
    /// - `EngineError::SaveDirectory` - If it cannot be created
    pub fn ensure_exists(&self) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.path).map_err(|e| EngineError::SaveDirectory {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

/// Everything a backend's native constructor receives.
#[derive(Clone)]
pub struct SessionParams {
    pub config: EngineConfig,
    pub save_dir: SaveDirectory,
    pub fingerprint: ClientFingerprint,
    pub peer_id: PeerId,
    /// Fetcher fixed at construction with the proxy sampled at that moment
    pub http: Arc<dyn HttpFetcher>,
    /// Admission chain consulted on every peer connection
    pub peer_filter: SharedFilterChain,
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("config", &self.config)
            .field("save_dir", &self.save_dir)
            .field("fingerprint", &self.fingerprint)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Live, expensive-to-create engine instance.
#[async_trait]
pub trait DownloadSession: Send + Sync {
    fn engine_type(&self) -> EngineType;

    /// Admission decision for a connecting or accepted peer.
    ///
    /// Runs on the connection path; never blocks.
    fn admit_peer(&self, peer: &PeerInfo) -> Verdict;

    /// Releases native resources. Called once by the owning cache.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One pluggable backend.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    fn location(&self) -> EngineLocation;

    /// Time-varying configuration for this engine.
    fn config(&self) -> &Setting<EngineConfig>;

    /// Whether the native dependencies are loadable.
    ///
    /// Computed lazily on first use; never fails, a load failure reads as
    /// `false`.
    fn is_supported(&self) -> watch::Receiver<bool>;

    /// Samples [`Self::is_supported`] once.
    fn test_connection(&self) -> bool {
        *self.is_supported().borrow()
    }

    /// Builds a new session for `config`.
    ///
    /// # Errors
    ///
    /// - `EngineError::Unsupported` - If the backend is currently unsupported
    /// - Any construction error from the backend
    async fn new_instance(
        &self,
        config: EngineConfig,
    ) -> Result<Arc<dyn DownloadSession>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_from_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"engine_type": "remote_service", "upload_limit": 1024}"#)
                .unwrap();

        assert_eq!(config.engine_type, EngineType::RemoteService);
        assert_eq!(config.upload_limit, Some(1024));
        assert!(config.enabled);
        assert_eq!(config.max_peer_connections, 200);
    }

    #[test]
    fn test_save_directory_is_created() {
        let root = tempfile::tempdir().unwrap();
        let save_dir = SaveDirectory::new(root.path().join("nested/downloads"));

        save_dir.ensure_exists().unwrap();
        assert!(save_dir.path().is_dir());
    }

    #[test]
    fn test_save_directory_under_file_fails() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let result = SaveDirectory::new(file.join("downloads")).ensure_exists();
        assert!(matches!(result, Err(EngineError::SaveDirectory { .. })));
    }
}
