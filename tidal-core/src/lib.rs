//! Tidal Core - download engine selection, service binding and peer admission
//!
//! This crate decides which torrent engine backend runs, creates its session
//! at most once, manages the connection to the background service a backend
//! may depend on, and admits or rejects peers before any protocol traffic.

pub mod config;
pub mod engine;
pub mod filter;
pub mod network;
pub mod service;
pub mod setting;
pub mod tracing_setup;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigError, TidalConfig};
pub use engine::{
    ClientFingerprint, DownloadEngine, DownloadSession, EngineConfig, EngineError,
    EngineInstanceCache, EngineLocation, EngineRegistry, EngineType,
};
pub use filter::{FilterChain, PeerFilter, PeerInfo, SharedFilterChain, Verdict};
pub use network::{FetchError, HttpFetcher, ProxyConfig};
pub use service::{ConnectionState, ServiceConnection, ServiceError, ServiceStatus};
pub use setting::Setting;

/// Errors that can bubble up from any Tidal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TidalError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Network error: {0}")]
    Network(#[from] FetchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TidalError::Engine(e) => match e {
                EngineError::Unsupported { engine, .. } => {
                    format!("The {engine} engine is not available on this system")
                }
                EngineError::NoUsableEngine => "No download engine is available".to_string(),
                EngineError::Closed { .. } => "The download engine is shutting down".to_string(),
                EngineError::SaveDirectory { path, .. } => {
                    format!("Cannot save downloads to {}", path.display())
                }
                _ => "The download engine failed to start".to_string(),
            },
            TidalError::Service(ServiceError::Disconnected) => {
                "The download service disconnected".to_string()
            }
            TidalError::Service(_) => "The download service is unavailable".to_string(),
            TidalError::Network(FetchError::InvalidProxy { reason }) => {
                format!("Invalid proxy settings: {reason}")
            }
            TidalError::Network(_) => "Network request failed".to_string(),
            TidalError::Config(e) => format!("Invalid configuration: {e}"),
            TidalError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TidalError::Config(_)
                | TidalError::Network(FetchError::InvalidProxy { .. })
                | TidalError::Engine(EngineError::Http(FetchError::InvalidProxy { .. }))
                | TidalError::Engine(EngineError::SaveDirectory { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TidalError>;

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
