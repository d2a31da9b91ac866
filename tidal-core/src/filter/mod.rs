//! Peer admission control.
//!
//! Every connection a download session opens or accepts is evaluated against
//! a [`FilterChain`] before the native layer is told to proceed. Evaluation is
//! synchronous and never fails: a filter whose pattern could not be parsed
//! degrades to a permanent no-op.

pub mod blacklist;
pub mod config;
pub mod ip_range;

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use regex::Regex;

pub use blacklist::{BlacklistUpdater, parse_blacklist};
pub use config::PeerFilterConfig;
pub use ip_range::{IpRange, IpRangeError};

/// Delimiter framing the client fingerprint in an Azureus-style peer id.
pub const FINGERPRINT_DELIMITER: u8 = b'-';

/// Protocol flag bits reported by the native layer for a peer connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerFlags(pub u32);

impl PeerFlags {
    pub const INCOMING: u32 = 1 << 0;
    pub const ENCRYPTED: u32 = 1 << 1;
    pub const UTP: u32 = 1 << 2;
    pub const SEED: u32 = 1 << 3;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }
}

/// Snapshot of a peer connection supplied by the native layer.
///
/// Filters only ever borrow it.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Raw 20-byte peer id as sent in the handshake
    pub peer_id: Bytes,
    /// Self-reported client name, e.g. "qBittorrent 4.6.0"
    pub client: String,
    /// Remote address in textual form
    pub ip: String,
    pub port: u16,
    /// Fraction of the torrent the peer has, 0.0 to 1.0
    pub progress: f32,
    pub total_download: u64,
    pub total_upload: u64,
    pub flags: PeerFlags,
}

impl PeerInfo {
    /// Creates a snapshot with zeroed transfer statistics.
    pub fn new(
        peer_id: impl Into<Bytes>,
        client: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            client: client.into(),
            ip: ip.into(),
            port,
            progress: 0.0,
            total_download: 0,
            total_upload: 0,
            flags: PeerFlags::default(),
        }
    }

    /// Parses the remote address, `None` if the native layer sent garbage.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }
}

/// Outcome of evaluating a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Blocked by the filter at `filter` in chain order
    Block { filter: usize },
}

impl Verdict {
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

/// A single admission rule.
///
/// Variants holding `None` failed to parse their pattern and never block.
#[derive(Debug, Clone)]
pub enum PeerFilter {
    IpRange {
        pattern: String,
        range: Option<IpRange>,
    },
    IpBlacklist {
        addresses: Arc<HashSet<String>>,
    },
    ClientName {
        pattern: String,
        regex: Option<Regex>,
    },
    PeerId {
        pattern: String,
        regex: Option<regex::bytes::Regex>,
    },
    InvalidFingerprint,
}

impl PeerFilter {
    /// Builds an IP range filter, degrading to a no-op on a malformed pattern.
    pub fn ip_range(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let range = match pattern.parse::<IpRange>() {
            Ok(range) => Some(range),
            Err(e) => {
                tracing::warn!("Ignoring IP range filter '{}': {}", pattern, e);
                None
            }
        };
        Self::IpRange { pattern, range }
    }

    /// Builds an exact-match blacklist.
    pub fn ip_blacklist<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses = addresses
            .into_iter()
            .map(|address| {
                let address: String = address.into();
                address.trim().to_string()
            })
            .filter(|address| !address.is_empty())
            .collect();
        Self::IpBlacklist {
            addresses: Arc::new(addresses),
        }
    }

    /// Builds a client-name filter, degrading to a no-op on a malformed regex.
    pub fn client_name(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let regex = match Regex::new(&pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!("Ignoring client filter '{}': {}", pattern, e);
                None
            }
        };
        Self::ClientName { pattern, regex }
    }

    /// Builds a peer-id filter, degrading to a no-op on a malformed regex.
    ///
    /// The regex runs over the raw id bytes with Unicode disabled so each byte
    /// is one character, matching the id decoded byte-for-byte as text.
    pub fn peer_id(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let regex = match regex::bytes::RegexBuilder::new(&pattern)
            .unicode(false)
            .build()
        {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!("Ignoring peer id filter '{}': {}", pattern, e);
                None
            }
        };
        Self::PeerId { pattern, regex }
    }

    /// Returns true if the peer must not exchange protocol data.
    pub fn should_block(&self, peer: &PeerInfo) -> bool {
        match self {
            Self::IpRange { range, .. } => match (range, peer.ip_addr()) {
                (Some(range), Some(addr)) => range.contains(addr),
                _ => false,
            },
            Self::IpBlacklist { addresses } => addresses.contains(peer.ip.as_str()),
            Self::ClientName { regex, .. } => regex
                .as_ref()
                .is_some_and(|regex| regex.is_match(&peer.client)),
            Self::PeerId { regex, .. } => regex
                .as_ref()
                .is_some_and(|regex| regex.is_match(&peer.peer_id)),
            Self::InvalidFingerprint => is_invalid_fingerprint(&peer.peer_id),
        }
    }

    /// Human-readable description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::IpRange { pattern, range } => match range {
                Some(range) => format!("IP range {range}"),
                None => format!("IP range '{pattern}' (invalid, disabled)"),
            },
            Self::IpBlacklist { addresses } => {
                format!("IP blacklist ({} addresses)", addresses.len())
            }
            Self::ClientName { pattern, regex } => match regex {
                Some(_) => format!("Client matches /{pattern}/"),
                None => format!("Client pattern '{pattern}' (invalid, disabled)"),
            },
            Self::PeerId { pattern, regex } => match regex {
                Some(_) => format!("Peer id matches /{pattern}/"),
                None => format!("Peer id pattern '{pattern}' (invalid, disabled)"),
            },
            Self::InvalidFingerprint => "Peer id without a well-formed fingerprint".to_string(),
        }
    }
}

impl fmt::Display for PeerFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// True unless the id starts with the delimiter and repeats it later on.
pub fn is_invalid_fingerprint(peer_id: &[u8]) -> bool {
    match peer_id.split_first() {
        Some((&first, rest)) if first == FINGERPRINT_DELIMITER => {
            !rest.contains(&FINGERPRINT_DELIMITER)
        }
        _ => true,
    }
}

/// Ordered set of filters combined by logical OR over "block".
///
/// Evaluation bumps a per-filter block counter; that counter is the only
/// state a chain mutates and it never influences a decision.
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<PeerFilter>,
    blocked: Vec<AtomicU64>,
    evaluated: AtomicU64,
}

impl FilterChain {
    pub fn new(filters: Vec<PeerFilter>) -> Self {
        let blocked = filters.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            filters,
            blocked,
            evaluated: AtomicU64::new(0),
        }
    }

    /// Chain with no filters; admits everyone.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Evaluates the peer, stopping at the first blocking filter.
    pub fn evaluate(&self, peer: &PeerInfo) -> Verdict {
        self.evaluated.fetch_add(1, Ordering::Relaxed);

        let position = self
            .filters
            .iter()
            .position(|filter| filter.should_block(peer));

        match position {
            Some(index) => {
                self.blocked[index].fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    "Blocking peer {}:{} ({}): {}",
                    peer.ip,
                    peer.port,
                    peer.client,
                    self.filters[index].describe()
                );
                Verdict::Block { filter: index }
            }
            None => Verdict::Allow,
        }
    }

    pub fn should_block(&self, peer: &PeerInfo) -> bool {
        self.evaluate(peer).is_blocked()
    }

    pub fn filters(&self) -> &[PeerFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Per-filter diagnostics in chain order.
    pub fn stats(&self) -> Vec<FilterStats> {
        self.filters
            .iter()
            .zip(&self.blocked)
            .map(|(filter, blocked)| FilterStats {
                description: filter.describe(),
                blocked: blocked.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Number of peers evaluated by this chain.
    pub fn evaluated(&self) -> u64 {
        self.evaluated.load(Ordering::Relaxed)
    }
}

/// Block count for one filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterStats {
    pub description: String,
    pub blocked: u64,
}

/// Atomically swappable chain shared between the session and config updates.
///
/// An evaluation observes either the old or the new chain in full.
#[derive(Debug, Clone)]
pub struct SharedFilterChain {
    current: Arc<RwLock<Arc<FilterChain>>>,
}

impl SharedFilterChain {
    pub fn new(chain: FilterChain) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(chain))),
        }
    }

    /// Returns the chain future evaluations will use.
    pub fn load(&self) -> Arc<FilterChain> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the chain, returning the previous one.
    pub fn replace(&self, chain: FilterChain) -> Arc<FilterChain> {
        tracing::debug!("Installing peer filter chain with {} filters", chain.len());
        std::mem::replace(&mut *self.current.write(), Arc::new(chain))
    }

    pub fn evaluate(&self, peer: &PeerInfo) -> Verdict {
        self.load().evaluate(peer)
    }

    pub fn should_block(&self, peer: &PeerInfo) -> bool {
        self.evaluate(peer).is_blocked()
    }
}

impl Default for SharedFilterChain {
    fn default() -> Self {
        Self::new(FilterChain::allow_all())
    }
}
