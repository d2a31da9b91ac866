//! HTTP byte fetching for engine metadata retrieval.
//!
//! Sessions receive an [`HttpFetcher`] built once at construction time from
//! the proxy settings sampled at that moment and a fixed client identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Proxy settings as published by the application's settings layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyConfig {
    #[default]
    Disabled,
    /// HTTP(S) proxy, e.g. `http://127.0.0.1:7890`
    Http {
        url: String,
        username: Option<String>,
        password: Option<String>,
    },
}

impl ProxyConfig {
    /// Proxy without credentials.
    pub fn http(url: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Http { .. })
    }

    /// Checks that the proxy URL is absolute and uses a supported scheme.
    ///
    /// # Errors
    ///
    /// - `FetchError::InvalidProxy` - If the URL cannot be parsed or its scheme is unsupported
    pub fn validate(&self) -> Result<(), FetchError> {
        let Self::Http { url, .. } = self else {
            return Ok(());
        };

        let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidProxy {
            reason: format!("{url}: {e}"),
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(FetchError::InvalidProxy {
                reason: format!("unsupported scheme '{scheme}'"),
            }),
        }
    }
}

/// Errors from HTTP byte fetching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid proxy configuration: {reason}")]
    InvalidProxy { reason: String },

    #[error("Invalid URL '{url}'")]
    InvalidUrl { url: String },

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("HTTP client construction failed: {reason}")]
    ClientBuild { reason: String },
}

/// Capability to download a URL into memory.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetches the body of `url`.
    ///
    /// # Errors
    ///
    /// - `FetchError::InvalidUrl` - If `url` is not an absolute URL
    /// - `FetchError::Request` - If the transport failed or timed out
    /// - `FetchError::Status` - If the server answered with a non-2xx status
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Builds fetchers for a given proxy and identity.
pub trait HttpClientFactory: Send + Sync {
    /// # Errors
    ///
    /// - `FetchError::InvalidProxy` - If the proxy settings are unusable
    /// - `FetchError::ClientBuild` - If the underlying client cannot be built
    fn create(
        &self,
        proxy: &ProxyConfig,
        user_agent: &str,
    ) -> Result<Arc<dyn HttpFetcher>, FetchError>;
}

/// Factory producing reqwest-backed fetchers.
#[derive(Debug, Clone)]
pub struct ReqwestClientFactory {
    timeout: Duration,
    max_redirects: usize,
}

impl ReqwestClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_redirects: 3,
        }
    }
}

impl Default for ReqwestClientFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpClientFactory for ReqwestClientFactory {
    fn create(
        &self,
        proxy: &ProxyConfig,
        user_agent: &str,
    ) -> Result<Arc<dyn HttpFetcher>, FetchError> {
        proxy.validate()?;

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects));

        match proxy {
            ProxyConfig::Disabled => {
                builder = builder.no_proxy();
            }
            ProxyConfig::Http {
                url,
                username,
                password,
            } => {
                let mut reqwest_proxy =
                    reqwest::Proxy::all(url.as_str()).map_err(|e| FetchError::InvalidProxy {
                        reason: e.to_string(),
                    })?;
                if let Some(username) = username {
                    reqwest_proxy =
                        reqwest_proxy.basic_auth(username, password.as_deref().unwrap_or(""));
                }
                builder = builder.proxy(reqwest_proxy);
            }
        }

        let client = builder.build().map_err(|e| FetchError::ClientBuild {
            reason: e.to_string(),
        })?;

        tracing::debug!(
            "Created HTTP fetcher (proxy: {}, user agent: {})",
            proxy.is_enabled(),
            user_agent
        );
        Ok(Arc::new(ReqwestFetcher { client }))
    }
}

/// Fetcher backed by a configured `reqwest::Client`.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;

        let response = self.client.get(parsed).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                "failed to connect".to_string()
            } else {
                e.to_string()
            };
            FetchError::Request {
                url: url.to_string(),
                reason,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(|e| FetchError::Request {
            url: url.to_string(),
            reason: format!("failed to read response body: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_validation() {
        assert!(ProxyConfig::Disabled.validate().is_ok());
        assert!(ProxyConfig::http("http://127.0.0.1:7890").validate().is_ok());
        assert!(ProxyConfig::http("https://proxy.example.com").validate().is_ok());

        assert!(matches!(
            ProxyConfig::http("ftp://127.0.0.1").validate(),
            Err(FetchError::InvalidProxy { .. })
        ));
        assert!(matches!(
            ProxyConfig::http("127.0.0.1:7890 with spaces").validate(),
            Err(FetchError::InvalidProxy { .. })
        ));
    }

    #[test]
    fn test_proxy_config_serde_shape() {
        let json = r#"{"kind":"http","url":"http://proxy:8080","username":"u","password":null}"#;
        let proxy: ProxyConfig = serde_json::from_str(json).unwrap();
        assert!(proxy.is_enabled());

        let disabled: ProxyConfig = serde_json::from_str(r#"{"kind":"disabled"}"#).unwrap();
        assert_eq!(disabled, ProxyConfig::Disabled);
    }

    #[test]
    fn test_factory_builds_with_and_without_proxy() {
        let factory = ReqwestClientFactory::default();
        assert!(factory.create(&ProxyConfig::Disabled, "tidal/0.1.0").is_ok());

        let proxy = ProxyConfig::Http {
            url: "http://127.0.0.1:7890".to_string(),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
        };
        assert!(factory.create(&proxy, "tidal/0.1.0").is_ok());
    }

    #[test]
    fn test_factory_rejects_bad_proxy() {
        let factory = ReqwestClientFactory::default();
        let result = factory.create(&ProxyConfig::http("gopher://nowhere"), "tidal/0.1.0");
        assert!(matches!(result, Err(FetchError::InvalidProxy { .. })));
    }

    #[tokio::test]
    async fn test_fetch_rejects_relative_url() {
        let fetcher = ReqwestClientFactory::default()
            .create(&ProxyConfig::Disabled, "tidal/0.1.0")
            .unwrap();
        let result = fetcher.fetch("/relative/path").await;
        assert!(matches!(result, Err(FetchError::InvalidUrl { .. })));
    }
}
