//! Lifecycle of the connection to the background download service.
//!
//! Some engines run their I/O inside a separate service process. Getting a
//! usable handle to it is asynchronous, may take a warm-up interval and can
//! be revoked at any time by the OS or by the service dying.

pub mod backoff;
pub mod connection;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;

pub use backoff::{RetryPolicy, acquire_with_backoff};
pub use connection::ServiceConnection;
pub use tcp::{ServiceEndpoint, TcpServiceStarter};

/// Errors surfaced while acquiring a service handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Service start failed: {reason}")]
    StartFailed { reason: String },

    #[error("Service started but returned no handle")]
    NoHandle,

    #[error("Service disconnected")]
    Disconnected,

    #[error("Connection attempt abandoned")]
    Abandoned,

    #[error("Service unavailable after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl ServiceError {
    /// Whether a caller-driven retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StartFailed { .. } | Self::NoHandle | Self::Disconnected
        )
    }
}

/// Requests the service and waits until it hands out a usable handle.
///
/// Backend-specific warm-up delays belong inside `start`; the state machine
/// imposes no timeout of its own.
#[async_trait]
pub trait ServiceStarter: Send + Sync + 'static {
    type Handle: Clone + fmt::Debug + Send + Sync + 'static;

    /// # Errors
    ///
    /// - `ServiceError::StartFailed` - If the service could not be started
    /// - `ServiceError::NoHandle` - If the service started but never became reachable
    async fn start(&self) -> Result<Self::Handle, ServiceError>;

    /// Resolves once `handle` is known to be dead.
    ///
    /// Polled on its own task while the connection holds `handle`; the
    /// default never resolves, leaving disconnects to
    /// [`ServiceConnection::on_disconnected`].
    fn watch(&self, _handle: &Self::Handle) -> BoxFuture<'static, ()> {
        futures::future::pending().boxed()
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState<H> {
    Idle,
    Connecting,
    Connected(H),
    Disconnected,
    Failed(String),
}

impl<H> ConnectionState<H> {
    pub fn kind(&self) -> ConnectionStateKind {
        match self {
            Self::Idle => ConnectionStateKind::Idle,
            Self::Connecting => ConnectionStateKind::Connecting,
            Self::Connected(_) => ConnectionStateKind::Connected,
            Self::Disconnected => ConnectionStateKind::Disconnected,
            Self::Failed(_) => ConnectionStateKind::Failed,
        }
    }

    pub fn handle(&self) -> Option<&H> {
        match self {
            Self::Connected(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Handle-free view of [`ConnectionState`] for diagnostics and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStateKind {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionStateKind {
    /// Legal edges of the lifecycle.
    ///
    /// `Connecting -> Idle` is the abandon path when every waiter went away;
    /// `Connecting -> Disconnected` is a disconnect preempting an attempt.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionStateKind::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Idle)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Disconnected, Connecting)
        )
    }
}

impl fmt::Display for ConnectionStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One applied state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: ConnectionStateKind,
    pub to: ConnectionStateKind,
    /// Attempt number the transition belongs to
    pub attempt: u64,
}

/// Snapshot for diagnostics and caller-side backoff decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ConnectionStateKind,
    /// Number of connection attempts started so far
    pub attempt: u64,
    /// Failures since the last successful connection
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl ServiceStatus {
    /// Short status line, e.g. "connecting…" or "failed: timed out".
    pub fn describe(&self) -> String {
        match (self.state, &self.last_failure) {
            (ConnectionStateKind::Connecting, _) => "connecting…".to_string(),
            (ConnectionStateKind::Failed, Some(reason)) => format!("failed: {reason}"),
            (state, _) => state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use ConnectionStateKind::*;

        assert!(Idle.can_transition_to(Connecting));
        assert!(Failed.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Disconnected));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn test_status_description() {
        let status = ServiceStatus {
            state: ConnectionStateKind::Failed,
            attempt: 2,
            consecutive_failures: 2,
            last_failure: Some("timed out".to_string()),
            last_failure_at: Some(Utc::now()),
        };
        assert_eq!(status.describe(), "failed: timed out");

        let connecting = ServiceStatus {
            state: ConnectionStateKind::Connecting,
            ..status
        };
        assert_eq!(connecting.describe(), "connecting…");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ServiceError::NoHandle.is_retryable());
        assert!(ServiceError::Disconnected.is_retryable());
        assert!(!ServiceError::Abandoned.is_retryable());
    }
}
