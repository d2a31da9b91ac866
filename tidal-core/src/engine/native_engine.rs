//! Engine backed by a native library and a backend-specific constructor.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{
    ClientFingerprint, DownloadEngine, DownloadSession, EngineConfig, EngineError,
    EngineLocation, EngineType, LibraryLoader, NativeLibrary, PeerId, SaveDirectory,
    SessionParams,
};
use crate::filter::SharedFilterChain;
use crate::network::{HttpClientFactory, ProxyConfig};
use crate::setting::Setting;

/// Backend-specific half of a [`NativeDownloadEngine`].
#[async_trait]
pub trait NativeBackend: Send + Sync + 'static {
    fn engine_type(&self) -> EngineType;

    fn location(&self) -> EngineLocation;

    /// Library that must load before sessions can be created.
    fn library(&self) -> Arc<dyn NativeLibrary>;

    /// The backend's native constructor.
    ///
    /// # Errors
    ///
    /// - `EngineError` - If the session could not be created
    async fn create_session(
        &self,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError>;
}

/// Collaborators every engine receives at construction.
#[derive(Clone)]
pub struct EngineDependencies {
    /// Live proxy settings, sampled once per session
    pub proxy: Setting<ProxyConfig>,
    pub http_factory: Arc<dyn HttpClientFactory>,
    pub save_dir: SaveDirectory,
    pub fingerprint: ClientFingerprint,
    pub peer_filter: SharedFilterChain,
}

/// [`DownloadEngine`] that gates a [`NativeBackend`] on its library loading.
pub struct NativeDownloadEngine {
    backend: Arc<dyn NativeBackend>,
    loader: LibraryLoader,
    config: Setting<EngineConfig>,
    deps: EngineDependencies,
    supported: watch::Sender<bool>,
}

impl NativeDownloadEngine {
    pub fn new(
        backend: Arc<dyn NativeBackend>,
        config: Setting<EngineConfig>,
        deps: EngineDependencies,
    ) -> Self {
        let loader = LibraryLoader::new(backend.library());
        let (supported, _) = watch::channel(false);

        Self {
            backend,
            loader,
            config,
            deps,
            supported,
        }
    }

    /// Name of the native library this engine depends on.
    pub fn library_name(&self) -> &str {
        self.loader.library_name()
    }

    fn refresh_support(&self) -> bool {
        let loaded = self.loader.is_loaded();
        self.supported.send_if_modified(|current| {
            if *current == loaded {
                false
            } else {
                *current = loaded;
                true
            }
        });
        loaded
    }
}

#[async_trait]
impl DownloadEngine for NativeDownloadEngine {
    fn engine_type(&self) -> EngineType {
        self.backend.engine_type()
    }

    fn location(&self) -> EngineLocation {
        self.backend.location()
    }

    fn config(&self) -> &Setting<EngineConfig> {
        &self.config
    }

    fn is_supported(&self) -> watch::Receiver<bool> {
        self.refresh_support();
        self.supported.subscribe()
    }

    async fn new_instance(
        &self,
        config: EngineConfig,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        let engine = self.engine_type();

        if let Err(e) = self.loader.ensure_loaded() {
            self.refresh_support();
            return Err(EngineError::Unsupported {
                engine,
                reason: e.to_string(),
            });
        }
        self.refresh_support();

        // Sampled once; the session keeps this proxy for its lifetime
        let proxy = self.deps.proxy.sample();
        let http = self
            .deps
            .http_factory
            .create(&proxy, self.deps.fingerprint.user_agent())?;

        self.deps.save_dir.ensure_exists()?;

        let params = SessionParams {
            config,
            save_dir: self.deps.save_dir.clone(),
            fingerprint: self.deps.fingerprint.clone(),
            peer_id: PeerId::generate(&self.deps.fingerprint),
            http,
            peer_filter: self.deps.peer_filter.clone(),
        };

        tracing::info!(
            "Creating {} session (fingerprint: {}, proxy: {})",
            engine,
            self.deps.fingerprint,
            proxy.is_enabled()
        );
        let session = self.backend.create_session(params).await?;
        tracing::info!("{} session ready", engine);

        Ok(session)
    }
}
