//! In-process backend without native dependencies.
//!
//! Used for development mode and tests. Sessions run every peer through the
//! shared admission chain and count the outcome, but exchange no data.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    DownloadSession, EngineConfig, EngineError, EngineLocation, EngineType, NativeBackend,
    NativeLibrary, PeerId, SaveDirectory, SessionParams, StaticLibrary,
};
use crate::filter::{PeerInfo, SharedFilterChain, Verdict};
use crate::network::{FetchError, HttpFetcher};

/// Backend creating [`SimulatedSession`]s.
pub struct SimulatedBackend {
    library: Arc<dyn NativeLibrary>,
    construction_delay: Duration,
    constructions: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::with_library(Arc::new(StaticLibrary::available("simulated")))
    }

    /// Backend whose library never loads.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::with_library(Arc::new(StaticLibrary::unavailable("simulated", reason)))
    }

    /// Backend gated on `library`, e.g. a [`super::LibraryProbe`].
    pub fn with_library(library: Arc<dyn NativeLibrary>) -> Self {
        Self {
            library,
            construction_delay: Duration::ZERO,
            constructions: AtomicUsize::new(0),
        }
    }

    /// Makes each construction take `delay`, like a slow native constructor.
    pub fn with_construction_delay(mut self, delay: Duration) -> Self {
        self.construction_delay = delay;
        self
    }

    /// Number of native constructor calls so far.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NativeBackend for SimulatedBackend {
    fn engine_type(&self) -> EngineType {
        EngineType::Simulated
    }

    fn location(&self) -> EngineLocation {
        EngineLocation::Local
    }

    fn library(&self) -> Arc<dyn NativeLibrary> {
        Arc::clone(&self.library)
    }

    async fn create_session(
        &self,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        if !self.construction_delay.is_zero() {
            tokio::time::sleep(self.construction_delay).await;
        }

        Ok(Arc::new(SimulatedSession::new(EngineType::Simulated, params)))
    }
}

/// Admission counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub admitted: u64,
    pub rejected: u64,
}

/// Session that only performs peer admission.
pub struct SimulatedSession {
    engine_type: EngineType,
    config: EngineConfig,
    save_dir: SaveDirectory,
    peer_id: PeerId,
    http: Arc<dyn HttpFetcher>,
    peer_filter: SharedFilterChain,
    admitted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

impl SimulatedSession {
    pub fn new(engine_type: EngineType, params: SessionParams) -> Self {
        tracing::debug!(
            "Simulated {} session with peer id {}",
            engine_type,
            params.peer_id
        );
        Self {
            engine_type,
            config: params.config,
            save_dir: params.save_dir,
            peer_id: params.peer_id,
            http: params.http,
            peer_filter: params.peer_filter,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn save_dir(&self) -> &SaveDirectory {
        &self.save_dir
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Downloads torrent metadata through the session's fetcher.
    ///
    /// # Errors
    ///
    /// - `FetchError` - If the download failed
    pub async fn fetch_metadata(&self, url: &str) -> Result<Bytes, FetchError> {
        self.http.fetch(url).await
    }
}

#[async_trait]
impl DownloadSession for SimulatedSession {
    fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    fn admit_peer(&self, peer: &PeerInfo) -> Verdict {
        let verdict = self.peer_filter.evaluate(peer);
        match verdict {
            Verdict::Allow => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
            }
            Verdict::Block { filter } => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    "Rejected peer {}:{} ({}) by filter #{}",
                    peer.ip,
                    peer.port,
                    peer.client,
                    filter
                );
            }
        }
        verdict
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Closed {} session", self.engine_type);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
