//! Service starter for a download service listening on a local TCP port.

use std::fmt;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{ServiceError, ServiceStarter};
use crate::config::ServiceConfig;

/// Reachable service endpoint handed out once the service is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub addr: SocketAddr,
    /// Process id when the service was spawned by us
    pub pid: Option<u32>,
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {})", self.addr, pid),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// Optionally spawns the service executable, waits its warm-up interval and
/// probes the configured address until it accepts connections.
///
/// A handed-out endpoint is watched: it dies when the spawned process exits
/// or the address stops accepting connections.
pub struct TcpServiceStarter {
    config: ServiceConfig,
    child: Arc<Mutex<Option<Child>>>,
}

impl TcpServiceStarter {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns the configured program unless a previous instance still runs.
    ///
    /// Returns the pid and whether the process was spawned by this call.
    async fn ensure_process(&self) -> Result<(Option<u32>, bool), ServiceError> {
        let Some(program) = &self.config.program else {
            return Ok((None, false));
        };

        let mut child = self.child.lock().await;
        if let Some(running) = child.as_mut() {
            match running.try_wait() {
                Ok(None) => return Ok((running.id(), false)),
                Ok(Some(status)) => {
                    tracing::warn!("Service process exited with {}, restarting", status);
                }
                Err(e) => {
                    tracing::warn!("Failed to query service process: {}", e);
                }
            }
        }

        let spawned = Command::new(program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::StartFailed {
                reason: format!("failed to spawn {}: {e}", program.display()),
            })?;

        let pid = spawned.id();
        tracing::info!("Spawned service {} (pid {:?})", program.display(), pid);
        *child = Some(spawned);
        Ok((pid, true))
    }

    async fn probe(&self) -> Option<SocketAddr> {
        let address = self.config.address.as_str();

        for probe in 1..=self.config.probe_attempts.max(1) {
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
                .await
            {
                Ok(Ok(stream)) => return stream.peer_addr().ok(),
                Ok(Err(e)) => {
                    tracing::debug!("Service probe {} to {} failed: {}", probe, address, e);
                }
                Err(_) => {
                    tracing::debug!("Service probe {} to {} timed out", probe, address);
                }
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }

        None
    }
}

#[async_trait]
impl ServiceStarter for TcpServiceStarter {
    type Handle = ServiceEndpoint;

    async fn start(&self) -> Result<ServiceEndpoint, ServiceError> {
        let (pid, spawned) = self.ensure_process().await?;
        if spawned && !self.config.warmup.is_zero() {
            tracing::debug!("Waiting {:?} for service warm-up", self.config.warmup);
            tokio::time::sleep(self.config.warmup).await;
        }

        let addr = self.probe().await.ok_or(ServiceError::NoHandle)?;
        Ok(ServiceEndpoint { addr, pid })
    }

    fn watch(&self, handle: &ServiceEndpoint) -> BoxFuture<'static, ()> {
        watch_endpoint(
            handle.clone(),
            Arc::clone(&self.child),
            self.config.health_interval,
            self.config.connect_timeout,
        )
        .boxed()
    }
}

/// Returns once `endpoint` is unusable.
async fn watch_endpoint(
    endpoint: ServiceEndpoint,
    child: Arc<Mutex<Option<Child>>>,
    interval: Duration,
    connect_timeout: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        if endpoint.pid.is_some() {
            let mut child = child.lock().await;
            let exited = match child.as_mut() {
                Some(running) => running.try_wait(),
                None => Ok(None),
            };
            if let Ok(Some(status)) = exited {
                tracing::warn!("Service process for {} exited with {}", endpoint, status);
                return;
            }
        }

        match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint.addr)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!("Service at {} stopped accepting connections: {}", endpoint, e);
                return;
            }
            Err(_) => {
                tracing::warn!("Service at {} stopped responding", endpoint);
                return;
            }
        }
    }
}
