//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::{
    ClientFingerprint, DownloadSession, EngineConfig, EngineDependencies, EngineError,
    EngineLocation, EngineType, NativeBackend, NativeLibrary, PeerId, SaveDirectory,
    SessionParams, SimulatedBackend, SimulatedSession, StaticLibrary,
};
use crate::filter::SharedFilterChain;
use crate::network::{FetchError, HttpClientFactory, HttpFetcher, ProxyConfig};
use crate::service::{ServiceError, ServiceStarter};
use crate::setting::Setting;

/// One scripted outcome of [`ScriptedStarter::start`].
#[derive(Debug, Clone)]
pub enum StartStep {
    Succeed(u32),
    Fail(String),
    NoHandle,
    /// Never completes
    Hang,
    Delay(Duration, u32),
    Panic,
}

/// Starter replaying a script; the last step repeats once exhausted.
pub struct ScriptedStarter {
    steps: Vec<StartStep>,
    calls: Arc<AtomicUsize>,
    lost: Arc<Notify>,
}

impl ScriptedStarter {
    pub fn new(steps: Vec<StartStep>) -> Self {
        assert!(!steps.is_empty(), "script needs at least one step");
        Self {
            steps,
            calls: Arc::new(AtomicUsize::new(0)),
            lost: Arc::new(Notify::new()),
        }
    }

    /// Notifying it makes the current handle's watcher report it dead.
    pub fn lost_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.lost)
    }

    /// Counter of `start` calls, shared with the starter.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl ServiceStarter for ScriptedStarter {
    type Handle = u32;

    async fn start(&self) -> Result<u32, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps[call.min(self.steps.len() - 1)].clone();

        match step {
            StartStep::Succeed(handle) => Ok(handle),
            StartStep::Fail(reason) => Err(ServiceError::StartFailed { reason }),
            StartStep::NoHandle => Err(ServiceError::NoHandle),
            StartStep::Hang => futures::future::pending().await,
            StartStep::Delay(delay, handle) => {
                tokio::time::sleep(delay).await;
                Ok(handle)
            }
            StartStep::Panic => panic!("service binder crashed"),
        }
    }

    fn watch(&self, _handle: &u32) -> BoxFuture<'static, ()> {
        let lost = Arc::clone(&self.lost);
        async move { lost.notified().await }.boxed()
    }
}

/// Fetcher returning a fixed body.
pub struct StaticBodyFetcher {
    body: Bytes,
}

#[async_trait]
impl HttpFetcher for StaticBodyFetcher {
    async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
        Ok(self.body.clone())
    }
}

/// Factory recording the proxy and user agent of every fetcher it builds.
pub struct RecordingHttpFactory {
    body: Bytes,
    created: Mutex<Vec<(ProxyConfig, String)>>,
}

impl RecordingHttpFactory {
    pub fn new() -> Arc<Self> {
        Self::with_body("")
    }

    pub fn with_body(body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            body: Bytes::from_static(body.as_bytes()),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<(ProxyConfig, String)> {
        self.created.lock().clone()
    }
}

impl HttpClientFactory for RecordingHttpFactory {
    fn create(
        &self,
        proxy: &ProxyConfig,
        user_agent: &str,
    ) -> Result<Arc<dyn HttpFetcher>, FetchError> {
        proxy.validate()?;
        self.created
            .lock()
            .push((proxy.clone(), user_agent.to_string()));
        Ok(Arc::new(StaticBodyFetcher {
            body: self.body.clone(),
        }))
    }
}

pub fn test_fingerprint() -> ClientFingerprint {
    ClientFingerprint::derive("TD", "tidal", "0.1.0").expect("valid test fingerprint")
}

/// Dependencies saving into a fresh temporary directory.
pub fn test_dependencies(
    factory: Arc<RecordingHttpFactory>,
) -> (EngineDependencies, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let deps = EngineDependencies {
        proxy: Setting::new(ProxyConfig::Disabled),
        http_factory: factory,
        save_dir: SaveDirectory::new(dir.path().join("downloads")),
        fingerprint: test_fingerprint(),
        peer_filter: SharedFilterChain::default(),
    };
    (deps, dir)
}

pub fn test_session_params(
    factory: Arc<RecordingHttpFactory>,
) -> (SessionParams, tempfile::TempDir) {
    let (deps, dir) = test_dependencies(factory);
    let http = deps
        .http_factory
        .create(&ProxyConfig::Disabled, deps.fingerprint.user_agent())
        .expect("test fetcher");
    let params = SessionParams {
        config: EngineConfig::new(EngineType::Simulated),
        save_dir: deps.save_dir,
        peer_id: PeerId::generate(&deps.fingerprint),
        fingerprint: deps.fingerprint,
        http,
        peer_filter: deps.peer_filter,
    };
    (params, dir)
}

/// Simulated backend whose first constructions fail.
pub struct FlakyBackend {
    inner: SimulatedBackend,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyBackend {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            inner: SimulatedBackend::new(),
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NativeBackend for FlakyBackend {
    fn engine_type(&self) -> EngineType {
        self.inner.engine_type()
    }

    fn location(&self) -> EngineLocation {
        self.inner.location()
    }

    fn library(&self) -> Arc<dyn NativeLibrary> {
        self.inner.library()
    }

    async fn create_session(
        &self,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EngineError::Construction {
                engine: EngineType::Simulated,
                reason: "transient native failure".to_string(),
            });
        }
        self.inner.create_session(params).await
    }
}

/// Simulated backend whose first constructions panic.
pub struct PanickingBackend {
    inner: SimulatedBackend,
    panics_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl PanickingBackend {
    pub fn panicking_first(panics: usize) -> Self {
        Self {
            inner: SimulatedBackend::new(),
            panics_left: AtomicUsize::new(panics),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NativeBackend for PanickingBackend {
    fn engine_type(&self) -> EngineType {
        self.inner.engine_type()
    }

    fn location(&self) -> EngineLocation {
        self.inner.location()
    }

    fn library(&self) -> Arc<dyn NativeLibrary> {
        self.inner.library()
    }

    async fn create_session(
        &self,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let should_panic = self
            .panics_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_panic {
            panic!("native constructor crashed");
        }
        self.inner.create_session(params).await
    }
}

/// Remote-located backend that needs no service.
pub struct RemoteStubBackend;

#[async_trait]
impl NativeBackend for RemoteStubBackend {
    fn engine_type(&self) -> EngineType {
        EngineType::RemoteService
    }

    fn location(&self) -> EngineLocation {
        EngineLocation::Remote
    }

    fn library(&self) -> Arc<dyn NativeLibrary> {
        Arc::new(StaticLibrary::available("remote-stub"))
    }

    async fn create_session(
        &self,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        Ok(Arc::new(SimulatedSession::new(
            EngineType::RemoteService,
            params,
        )))
    }
}
