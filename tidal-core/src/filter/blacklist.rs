//! Remote IP blacklist refresh.
//!
//! The remote list changes slowly. Each successful refresh rebuilds the whole
//! chain from the current filter settings plus the fetched addresses and
//! swaps it in; a failed refresh keeps serving the previous chain.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{PeerFilterConfig, SharedFilterChain};
use crate::network::{FetchError, HttpFetcher};
use crate::setting::Setting;

/// Parses a newline-separated address list, skipping blanks and `#` comments.
pub fn parse_blacklist(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keeps a [`SharedFilterChain`] in sync with settings and a remote blacklist.
pub struct BlacklistUpdater {
    fetcher: Arc<dyn HttpFetcher>,
    config: Setting<PeerFilterConfig>,
    chain: SharedFilterChain,
    remote_addresses: Mutex<Vec<String>>,
}

impl BlacklistUpdater {
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        config: Setting<PeerFilterConfig>,
        chain: SharedFilterChain,
    ) -> Self {
        Self {
            fetcher,
            config,
            chain,
            remote_addresses: Mutex::new(Vec::new()),
        }
    }

    /// Rebuilds the chain from current settings and the last fetched list.
    pub fn rebuild(&self) {
        let config = self.config.sample();
        let remote = self.remote_addresses.lock().clone();
        self.chain.replace(config.build_chain(&remote));
    }

    /// Fetches the remote list and installs a rebuilt chain.
    ///
    /// Returns the number of remote addresses, 0 when no URL is configured.
    ///
    /// # Errors
    ///
    /// - `FetchError` - If the download failed; the current chain is kept
    pub async fn refresh(&self) -> Result<usize, FetchError> {
        let Some(url) = self.config.sample().blacklist_url else {
            self.remote_addresses.lock().clear();
            self.rebuild();
            return Ok(0);
        };

        let body = self.fetcher.fetch(&url).await?;
        let addresses = parse_blacklist(&String::from_utf8_lossy(&body));
        let count = addresses.len();

        *self.remote_addresses.lock() = addresses;
        self.rebuild();

        tracing::info!("Loaded {} blacklisted addresses from {}", count, url);
        Ok(count)
    }

    /// Refreshes periodically and rebuilds on settings changes until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut config_changes = self.config.subscribe();

        loop {
            if let Err(e) = self.refresh().await {
                tracing::warn!("Blacklist refresh failed, keeping previous list: {}", e);
            }

            let interval = self.config.sample().blacklist_refresh.max(Duration::from_secs(1));

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                changed = config_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Blacklist updater stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::filter::PeerInfo;

    struct StaticFetcher {
        body: Mutex<Result<&'static str, FetchError>>,
    }

    impl StaticFetcher {
        fn new(body: Result<&'static str, FetchError>) -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(body),
            })
        }
    }

    #[async_trait]
    impl HttpFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
            self.body
                .lock()
                .clone()
                .map(|body| Bytes::from_static(body.as_bytes()))
        }
    }

    fn peer(ip: &str) -> PeerInfo {
        PeerInfo::new(&b"-TR4050-abcdefghijkl"[..], "Transmission", ip, 51413)
    }

    fn config_with_url() -> PeerFilterConfig {
        PeerFilterConfig {
            blacklist_url: Some("https://lists.example.com/peers.txt".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_blacklist() {
        let text = "# header\n1.2.3.4\n\n  5.6.7.8  # trailing comment\n";
        assert_eq!(parse_blacklist(text), vec!["1.2.3.4", "5.6.7.8"]);
    }

    #[tokio::test]
    async fn test_refresh_installs_remote_addresses() {
        let chain = SharedFilterChain::default();
        let updater = BlacklistUpdater::new(
            StaticFetcher::new(Ok("1.2.3.4\n5.6.7.8\n")),
            Setting::new(config_with_url()),
            chain.clone(),
        );

        assert_eq!(updater.refresh().await.unwrap(), 2);
        assert!(chain.should_block(&peer("5.6.7.8")));
        assert!(!chain.should_block(&peer("9.9.9.9")));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_chain() {
        let chain = SharedFilterChain::default();
        let fetcher = StaticFetcher::new(Ok("1.2.3.4\n"));
        let updater =
            BlacklistUpdater::new(fetcher.clone(), Setting::new(config_with_url()), chain.clone());
        updater.refresh().await.unwrap();

        *fetcher.body.lock() = Err(FetchError::Status {
            url: "https://lists.example.com/peers.txt".to_string(),
            status: 503,
        });
        assert!(updater.refresh().await.is_err());
        assert!(chain.should_block(&peer("1.2.3.4")));
    }

    #[tokio::test]
    async fn test_rebuild_applies_new_settings() {
        let chain = SharedFilterChain::default();
        let config = Setting::new(config_with_url());
        let updater =
            BlacklistUpdater::new(StaticFetcher::new(Ok("1.2.3.4")), config.clone(), chain.clone());
        updater.refresh().await.unwrap();

        config.set(PeerFilterConfig::disabled());
        updater.rebuild();

        assert!(!chain.should_block(&peer("1.2.3.4")));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let chain = SharedFilterChain::default();
        let updater = Arc::new(BlacklistUpdater::new(
            StaticFetcher::new(Ok("1.2.3.4")),
            Setting::new(config_with_url()),
            chain.clone(),
        ));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(updater.run(shutdown.clone()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !chain.should_block(&peer("1.2.3.4")) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
