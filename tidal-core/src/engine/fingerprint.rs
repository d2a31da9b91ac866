//! Client identity presented to peers and HTTP servers.
//!
//! Peers recognise client software by the Azureus-style peer-id prefix
//! `-TTVVVV-`: a two-character client tag and a four-character version code
//! framed by the delimiter on both sides.

use std::fmt;

use rand::Rng;

use crate::config::{ClientConfig, ConfigError};
use crate::filter::FINGERPRINT_DELIMITER;

/// Length of the `-TTVVVV-` prefix
pub const FINGERPRINT_LEN: usize = 8;

const VERSION_CODE_LEN: usize = 4;

/// Deterministic peer-id prefix and user agent for one client version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFingerprint {
    prefix: [u8; FINGERPRINT_LEN],
    user_agent: String,
}

impl ClientFingerprint {
    /// Derives the fingerprint for `tag` (two ASCII alphanumerics) and
    /// `version`, e.g. `("TD", "tidal", "4.10.2-beta")` -> `-TD4A20-`.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - If `tag` is not two ASCII letters or digits
    pub fn derive(tag: &str, product: &str, version: &str) -> Result<Self, ConfigError> {
        let tag_bytes = tag.as_bytes();
        if tag_bytes.len() != 2 || !tag_bytes.iter().all(u8::is_ascii_alphanumeric) {
            return Err(ConfigError::Invalid {
                field: "fingerprint tag",
                reason: format!("expected two ASCII letters or digits, got '{tag}'"),
            });
        }

        let mut prefix = [FINGERPRINT_DELIMITER; FINGERPRINT_LEN];
        prefix[1..3].copy_from_slice(tag_bytes);
        prefix[3..7].copy_from_slice(&version_code(version));

        Ok(Self {
            prefix,
            user_agent: format!("{product}/{version}"),
        })
    }

    pub fn from_config(client: &ClientConfig) -> Result<Self, ConfigError> {
        Self::derive(&client.fingerprint_tag, &client.product, &client.version)
    }

    pub fn prefix(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.prefix
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

impl fmt::Display for ClientFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Prefix is ASCII by construction
        write!(f, "{}", String::from_utf8_lossy(&self.prefix))
    }
}

/// Encodes up to four numeric version components as one character each.
fn version_code(version: &str) -> [u8; VERSION_CODE_LEN] {
    let release = version.split(['-', '+']).next().unwrap_or_default();
    let mut code = [b'0'; VERSION_CODE_LEN];

    for (slot, component) in code.iter_mut().zip(release.split('.')) {
        let digits: String = component
            .trim()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        let value = digits.parse::<u32>().unwrap_or(0);
        *slot = version_char(value);
    }

    code
}

fn version_char(value: u32) -> u8 {
    match value {
        0..=9 => b'0' + value as u8,
        10..=35 => b'A' + (value - 10) as u8,
        _ => b'Z',
    }
}

/// 20-byte BitTorrent peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Fingerprint prefix followed by 12 random alphanumeric bytes.
    pub fn generate(fingerprint: &ClientFingerprint) -> Self {
        let mut id = [0u8; 20];
        id[..FINGERPRINT_LEN].copy_from_slice(fingerprint.prefix());

        let mut rng = rand::rng();
        for byte in &mut id[FINGERPRINT_LEN..] {
            *byte = rng.sample(rand::distr::Alphanumeric);
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::filter::is_invalid_fingerprint;

    #[test]
    fn test_derive_prefix_and_user_agent() {
        let fingerprint = ClientFingerprint::derive("TD", "tidal", "3.1.0").unwrap();

        assert_eq!(fingerprint.prefix(), b"-TD3100-");
        assert_eq!(fingerprint.user_agent(), "tidal/3.1.0");
        assert_eq!(fingerprint.to_string(), "-TD3100-");
    }

    #[test]
    fn test_version_code_encoding() {
        assert_eq!(&version_code("4.10.2-beta"), b"4A20");
        assert_eq!(&version_code("1.2.3.4.5"), b"1234");
        assert_eq!(&version_code("2"), b"2000");
        assert_eq!(&version_code("40.0.0+build7"), b"Z000");
        assert_eq!(&version_code("dev"), b"0000");
    }

    #[test]
    fn test_invalid_tag_rejected() {
        assert!(ClientFingerprint::derive("T", "tidal", "1.0").is_err());
        assert!(ClientFingerprint::derive("T-", "tidal", "1.0").is_err());
        assert!(ClientFingerprint::derive("TDX", "tidal", "1.0").is_err());
    }

    #[test]
    fn test_generated_peer_id() {
        let fingerprint = ClientFingerprint::derive("TD", "tidal", "0.1.0").unwrap();
        let first = PeerId::generate(&fingerprint);
        let second = PeerId::generate(&fingerprint);

        assert_eq!(&first.as_bytes()[..8], b"-TD0100-");
        assert!(first.as_bytes()[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(first, second);
        assert_eq!(first.to_string().len(), 40);
    }

    proptest! {
        #[test]
        fn prop_derived_fingerprint_passes_heuristic(
            major in 0u32..100,
            minor in 0u32..100,
            patch in 0u32..100,
        ) {
            let version = format!("{major}.{minor}.{patch}");
            let fingerprint = ClientFingerprint::derive("TD", "tidal", &version).unwrap();
            let id = PeerId::generate(&fingerprint);

            prop_assert_eq!(fingerprint.prefix().len(), FINGERPRINT_LEN);
            prop_assert!(!is_invalid_fingerprint(id.as_bytes()));
        }
    }
}
