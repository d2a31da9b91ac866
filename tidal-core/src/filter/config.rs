//! User-facing peer filter settings and chain construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{FilterChain, PeerFilter};

/// Peer-id prefixes of clients known to download without uploading.
const DEFAULT_PEER_ID_FILTER: &str = "^-(XL|SD|XF|QD|BN|DL|TS|FG|TT|NX)";

/// Client names of the same leecher family.
const DEFAULT_CLIENT_FILTER: &str = "(?i)xunlei|thunder|xfplay|qq ?download|baidu ?netdisk|dandanplay";

/// Peer admission settings.
///
/// Each pattern becomes one filter, so a malformed entry disables only itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerFilterConfig {
    /// Master switch; a disabled config admits every peer
    pub enabled: bool,
    /// IP range patterns, see [`super::IpRange`]
    pub ip_filters: Vec<String>,
    /// Literal addresses to refuse
    pub ip_blacklist: Vec<String>,
    /// Regular expressions over the client name
    pub client_filters: Vec<String>,
    /// Regular expressions over the raw peer id
    pub peer_id_filters: Vec<String>,
    /// Refuse peers whose id lacks a `-XXnnnn-` style fingerprint
    pub block_invalid_peer_id: bool,
    /// Remote newline-separated blacklist merged into `ip_blacklist`
    pub blacklist_url: Option<String>,
    /// How often the remote blacklist is re-fetched
    #[serde(with = "crate::config::duration_secs")]
    pub blacklist_refresh: Duration,
}

impl Default for PeerFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_filters: Vec::new(),
            ip_blacklist: Vec::new(),
            client_filters: vec![DEFAULT_CLIENT_FILTER.to_string()],
            peer_id_filters: vec![DEFAULT_PEER_ID_FILTER.to_string()],
            block_invalid_peer_id: false,
            blacklist_url: None,
            blacklist_refresh: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl PeerFilterConfig {
    /// Config that admits every peer.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Builds the chain, merging `extra_blacklist` into the configured one.
    ///
    /// Cheap filters come first; order never changes the decision.
    pub fn build_chain(&self, extra_blacklist: &[String]) -> FilterChain {
        if !self.enabled {
            return FilterChain::allow_all();
        }

        let mut filters = Vec::new();

        let blacklist: Vec<&String> = self
            .ip_blacklist
            .iter()
            .chain(extra_blacklist)
            .filter(|address| !address.trim().is_empty())
            .collect();
        if !blacklist.is_empty() {
            filters.push(PeerFilter::ip_blacklist(blacklist.into_iter().cloned()));
        }

        if self.block_invalid_peer_id {
            filters.push(PeerFilter::InvalidFingerprint);
        }

        filters.extend(non_empty(&self.ip_filters).map(PeerFilter::ip_range));
        filters.extend(non_empty(&self.peer_id_filters).map(PeerFilter::peer_id));
        filters.extend(non_empty(&self.client_filters).map(PeerFilter::client_name));

        tracing::debug!("Built peer filter chain with {} filters", filters.len());
        FilterChain::new(filters)
    }
}

fn non_empty(patterns: &[String]) -> impl Iterator<Item = &str> {
    patterns
        .iter()
        .map(|pattern| pattern.trim())
        .filter(|pattern| !pattern.is_empty())
}
