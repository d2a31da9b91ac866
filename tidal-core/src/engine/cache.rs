//! At-most-one live session per engine.
//!
//! The slot check and the registration of a construction happen under one
//! lock, so only one `new_instance` call runs at a time. Construction runs
//! on its own task behind a shared future: every concurrent caller awaits
//! the same result, and a caller giving up never cancels the construction
//! others are waiting for.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{DownloadEngine, DownloadSession, EngineError, EngineType};
use crate::panic_message;

type SessionResult = Result<Arc<dyn DownloadSession>, EngineError>;
type SharedBuild = Shared<BoxFuture<'static, SessionResult>>;

enum Slot {
    Empty,
    Building { generation: u64, build: SharedBuild },
    Ready(Arc<dyn DownloadSession>),
    Closed,
}

/// Result of a construction, decided under the slot lock.
enum Settled {
    Installed(Arc<dyn DownloadSession>),
    /// Teardown began while the session was being built
    Orphaned(Arc<dyn DownloadSession>),
    Failed(EngineError),
}

/// Lazily creates and then shares one session of an engine.
pub struct EngineInstanceCache {
    engine: Arc<dyn DownloadEngine>,
    slot: Arc<Mutex<Slot>>,
    generation: AtomicU64,
    scope: CancellationToken,
}

impl EngineInstanceCache {
    /// Creates an empty cache tied to `scope`.
    ///
    /// Cancelling `scope` closes the cached session. Must be called within a
    /// Tokio runtime.
    pub fn new(engine: Arc<dyn DownloadEngine>, scope: CancellationToken) -> Self {
        let slot = Arc::new(Mutex::new(Slot::Empty));

        let teardown_slot = Arc::clone(&slot);
        let teardown_scope = scope.clone();
        let engine_type = engine.engine_type();
        tokio::spawn(async move {
            teardown_scope.cancelled().await;
            close_slot(&teardown_slot, engine_type).await;
        });

        Self {
            engine,
            slot,
            generation: AtomicU64::new(0),
            scope,
        }
    }

    pub fn engine(&self) -> &Arc<dyn DownloadEngine> {
        &self.engine
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine.engine_type()
    }

    /// Returns the session, creating it on first demand.
    ///
    /// Concurrent callers share one construction and receive the same
    /// session. A failed construction is reported to every waiter and leaves
    /// the cache empty for the next call.
    ///
    /// # Errors
    ///
    /// - `EngineError::Closed` - If teardown has begun
    /// - Any `EngineError` from the engine's `new_instance`
    pub async fn get(&self) -> SessionResult {
        if self.scope.is_cancelled() {
            return Err(self.closed_error());
        }

        let build = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Ready(session) => return Ok(Arc::clone(session)),
                Slot::Closed => return Err(self.closed_error()),
                Slot::Building { build, .. } => build.clone(),
                Slot::Empty => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let build = self.start_build(generation);
                    *slot = Slot::Building {
                        generation,
                        build: build.clone(),
                    };
                    build
                }
            }
        };

        build.await
    }

    /// Current session without triggering construction.
    pub fn peek(&self) -> Option<Arc<dyn DownloadSession>> {
        match &*self.slot.lock() {
            Slot::Ready(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Closes the session, if any, and rejects all later calls.
    ///
    /// Safe to call repeatedly and concurrently with scope cancellation; the
    /// session is closed exactly once.
    pub async fn shutdown(&self) {
        self.scope.cancel();
        close_slot(&self.slot, self.engine_type()).await;
    }

    fn start_build(&self, generation: u64) -> SharedBuild {
        let engine = Arc::clone(&self.engine);
        let slot = Arc::clone(&self.slot);
        let config = engine.config().sample();
        let engine_type = engine.engine_type();

        let build = async move {
            tracing::debug!("Constructing {} session (generation {})", engine_type, generation);
            let result = AssertUnwindSafe(engine.new_instance(config))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let reason = panic_message(payload.as_ref());
                    Err(EngineError::Construction {
                        engine: engine_type,
                        reason: format!("constructor panicked: {reason}"),
                    })
                });

            let settled = {
                let mut slot = slot.lock();
                let current = matches!(
                    &*slot,
                    Slot::Building { generation: building, .. } if *building == generation
                );
                match result {
                    Ok(session) if current => {
                        *slot = Slot::Ready(Arc::clone(&session));
                        Settled::Installed(session)
                    }
                    Ok(session) => Settled::Orphaned(session),
                    Err(e) => {
                        if current {
                            *slot = Slot::Empty;
                        }
                        Settled::Failed(e)
                    }
                }
            };

            match settled {
                Settled::Installed(session) => Ok(session),
                Settled::Orphaned(session) => {
                    tracing::debug!("Closing {} session built during teardown", engine_type);
                    session.close().await;
                    Err(EngineError::Closed {
                        engine: engine_type,
                    })
                }
                Settled::Failed(e) => {
                    tracing::warn!("Failed to construct {} session: {}", engine_type, e);
                    Err(e)
                }
            }
        }
        .boxed()
        .shared();

        // Drive construction to completion even if every waiter goes away
        tokio::spawn(build.clone());
        build
    }

    fn closed_error(&self) -> EngineError {
        EngineError::Closed {
            engine: self.engine_type(),
        }
    }
}

async fn close_slot(slot: &Mutex<Slot>, engine_type: EngineType) {
    let previous = std::mem::replace(&mut *slot.lock(), Slot::Closed);
    if let Slot::Ready(session) = previous {
        session.close().await;
        tracing::info!("Tore down {} session", engine_type);
    }
}
