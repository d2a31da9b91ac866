//! Backend whose sessions live inside a background service.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    DownloadSession, EngineError, EngineLocation, EngineType, NativeBackend, NativeLibrary,
    SessionParams, SimulatedSession, StaticLibrary,
};
use crate::service::{
    RetryPolicy, ServiceConnection, ServiceEndpoint, ServiceStarter, acquire_with_backoff,
};

/// Opens a session over an acquired service handle.
#[async_trait]
pub trait RemoteSessionFactory<H: Send + 'static>: Send + Sync + 'static {
    /// # Errors
    ///
    /// - `EngineError` - If the service refused or failed to open the session
    async fn open_session(
        &self,
        handle: H,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError>;
}

/// [`NativeBackend`] that acquires a service handle before opening a session.
pub struct ServiceBackend<S: ServiceStarter, F> {
    library: Arc<dyn NativeLibrary>,
    connection: ServiceConnection<S>,
    factory: F,
    retry: RetryPolicy,
}

impl<S, F> ServiceBackend<S, F>
where
    S: ServiceStarter,
    F: RemoteSessionFactory<S::Handle>,
{
    pub fn new(connection: ServiceConnection<S>, factory: F, retry: RetryPolicy) -> Self {
        let library = Arc::new(StaticLibrary::available(connection.label()));
        Self {
            library,
            connection,
            factory,
            retry,
        }
    }

    /// Replaces the client library checked before any session is created.
    pub fn with_library(mut self, library: Arc<dyn NativeLibrary>) -> Self {
        self.library = library;
        self
    }

    pub fn connection(&self) -> &ServiceConnection<S> {
        &self.connection
    }
}

#[async_trait]
impl<S, F> NativeBackend for ServiceBackend<S, F>
where
    S: ServiceStarter,
    F: RemoteSessionFactory<S::Handle>,
{
    fn engine_type(&self) -> EngineType {
        EngineType::RemoteService
    }

    fn location(&self) -> EngineLocation {
        EngineLocation::Remote
    }

    fn library(&self) -> Arc<dyn NativeLibrary> {
        Arc::clone(&self.library)
    }

    async fn create_session(
        &self,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        let handle = acquire_with_backoff(&self.connection, &self.retry).await?;
        tracing::debug!("Opening remote session over {:?}", handle);
        self.factory.open_session(handle, params).await
    }
}

/// Opens admission-only sessions against a TCP service endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointSessionFactory;

#[async_trait]
impl RemoteSessionFactory<ServiceEndpoint> for EndpointSessionFactory {
    async fn open_session(
        &self,
        handle: ServiceEndpoint,
        params: SessionParams,
    ) -> Result<Arc<dyn DownloadSession>, EngineError> {
        tracing::info!("Remote session bound to {}", handle);
        Ok(Arc::new(SimulatedSession::new(
            EngineType::RemoteService,
            params,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::service::{ConnectionState, ServiceError};
    use crate::test_support::{
        RecordingHttpFactory, ScriptedStarter, StartStep, test_session_params,
    };

    struct HandleRecordingFactory;

    #[async_trait]
    impl RemoteSessionFactory<u32> for HandleRecordingFactory {
        async fn open_session(
            &self,
            handle: u32,
            params: SessionParams,
        ) -> Result<Arc<dyn DownloadSession>, EngineError> {
            if handle == 0 {
                return Err(EngineError::Construction {
                    engine: EngineType::RemoteService,
                    reason: "handle 0 is invalid".to_string(),
                });
            }
            Ok(Arc::new(SimulatedSession::new(
                EngineType::RemoteService,
                params,
            )))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_session_opened_after_service_warms_up() {
        let starter = ScriptedStarter::new(vec![StartStep::NoHandle, StartStep::Succeed(11)]);
        let calls = starter.calls();
        let backend = ServiceBackend::new(
            ServiceConnection::new("svc", starter),
            HandleRecordingFactory,
            fast_retry(),
        );
        let (params, _dir) = test_session_params(RecordingHttpFactory::new());

        let session = backend.create_session(params).await.unwrap();

        assert_eq!(session.engine_type(), EngineType::RemoteService);
        assert_eq!(backend.connection().state(), ConnectionState::Connected(11));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.location(), EngineLocation::Remote);
    }

    #[tokio::test]
    async fn test_service_never_available() {
        let starter = ScriptedStarter::new(vec![StartStep::Fail("refused".to_string())]);
        let backend = ServiceBackend::new(
            ServiceConnection::new("svc", starter),
            HandleRecordingFactory,
            fast_retry(),
        );
        let (params, _dir) = test_session_params(RecordingHttpFactory::new());

        let result = backend.create_session(params).await;
        assert!(matches!(
            result,
            Err(EngineError::Service(ServiceError::RetriesExhausted {
                attempts: 3,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_custom_library_gates_support() {
        let starter = ScriptedStarter::new(vec![StartStep::Succeed(1)]);
        let backend = ServiceBackend::new(
            ServiceConnection::new("svc", starter),
            HandleRecordingFactory,
            fast_retry(),
        )
        .with_library(Arc::new(StaticLibrary::unavailable("client", "not installed")));

        assert!(backend.library().load().is_err());
    }
}
