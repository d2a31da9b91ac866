//! Engine lookup and selection.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{
    DownloadEngine, DownloadSession, EngineError, EngineInstanceCache, EngineLocation, EngineType,
};

/// Network facts that influence which engines may be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkConditions {
    /// Remote engines are skipped on metered networks
    pub metered: bool,
}

/// One instance cache per registered engine.
pub struct EngineRegistry {
    caches: Vec<Arc<EngineInstanceCache>>,
    scope: CancellationToken,
}

impl EngineRegistry {
    /// Registers `engines` in priority order. Later duplicates of an engine
    /// type are ignored.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(engines: Vec<Arc<dyn DownloadEngine>>, scope: CancellationToken) -> Self {
        let mut caches: Vec<Arc<EngineInstanceCache>> = Vec::with_capacity(engines.len());

        for engine in engines {
            let engine_type = engine.engine_type();
            if caches.iter().any(|cache| cache.engine_type() == engine_type) {
                tracing::warn!("Ignoring duplicate registration of engine {}", engine_type);
                continue;
            }
            caches.push(Arc::new(EngineInstanceCache::new(engine, scope.child_token())));
        }

        Self { caches, scope }
    }

    pub fn engine(&self, engine_type: EngineType) -> Option<&Arc<EngineInstanceCache>> {
        self.caches
            .iter()
            .find(|cache| cache.engine_type() == engine_type)
    }

    pub fn engine_types(&self) -> Vec<EngineType> {
        self.caches.iter().map(|cache| cache.engine_type()).collect()
    }

    /// Preferred usable engine: enabled, supported and allowed on this
    /// network. Local engines win over remote ones; registration order
    /// breaks ties.
    pub fn select(&self, network: NetworkConditions) -> Option<&Arc<EngineInstanceCache>> {
        let usable = |cache: &&Arc<EngineInstanceCache>| {
            let engine = cache.engine();
            let location = engine.location();

            if !engine.config().sample().enabled {
                return false;
            }
            if network.metered && location == EngineLocation::Remote {
                return false;
            }
            engine.test_connection()
        };

        let local = self
            .caches
            .iter()
            .filter(|cache| cache.engine().location() == EngineLocation::Local)
            .find(usable);
        local.or_else(|| {
            self.caches
                .iter()
                .filter(|cache| cache.engine().location() == EngineLocation::Remote)
                .find(usable)
        })
    }

    /// Session of the selected engine.
    ///
    /// # Errors
    ///
    /// - `EngineError::NoUsableEngine` - If no engine is usable
    /// - Any error from the selected engine's construction
    pub async fn session(
        &self,
        network: NetworkConditions,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        let cache = self.select(network).ok_or(EngineError::NoUsableEngine)?;
        tracing::debug!("Selected engine {}", cache.engine_type());
        cache.get().await
    }

    /// Tears down every cached session.
    pub async fn shutdown(&self) {
        self.scope.cancel();
        for cache in &self.caches {
            cache.shutdown().await;
        }
        tracing::info!("Engine registry shut down");
    }
}
