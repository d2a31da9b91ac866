//! Numeric IP ranges parsed from user-supplied patterns.
//!
//! Accepted forms:
//! - single address: `1.2.3.4`, `::1`
//! - CIDR block: `10.0.0.0/8`, `fe80::/10`
//! - inclusive range: `1.2.3.4-1.2.3.9`, `2001:db8::1-2001:db8::ff`
//! - last-octet shorthand: `1.2.3.4-9`
//! - IPv4 wildcards: `1.2.*.*`, `1.2.3.*`

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Inclusive range of addresses within one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    V4 { start: u32, end: u32 },
    V6 { start: u128, end: u128 },
}

/// Reasons a range pattern is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpRangeError {
    #[error("Empty range pattern")]
    Empty,

    #[error("Invalid address '{text}'")]
    InvalidAddress { text: String },

    #[error("Invalid prefix length '{text}'")]
    InvalidPrefix { text: String },

    #[error("Range start {start} is after end {end}")]
    Inverted { start: String, end: String },

    #[error("Range mixes IPv4 and IPv6 addresses")]
    MixedFamilies,
}

impl IpRange {
    /// Range covering exactly one address.
    pub fn single(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => {
                let value = u32::from(v4);
                Self::V4 {
                    start: value,
                    end: value,
                }
            }
            IpAddr::V6(v6) => {
                let value = u128::from(v6);
                Self::V6 {
                    start: value,
                    end: value,
                }
            }
        }
    }

    /// Returns true if `addr` falls inside the range.
    ///
    /// Addresses of the other family never match, except IPv4-mapped IPv6
    /// addresses which are compared as IPv4.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, normalize(addr)) {
            (Self::V4 { start, end }, IpAddr::V4(v4)) => {
                let value = u32::from(v4);
                *start <= value && value <= *end
            }
            (Self::V6 { start, end }, IpAddr::V6(v6)) => {
                let value = u128::from(v6);
                *start <= value && value <= *end
            }
            _ => false,
        }
    }

    fn from_bounds(start: IpAddr, end: IpAddr) -> Result<Self, IpRangeError> {
        let range = match (normalize(start), normalize(end)) {
            (IpAddr::V4(a), IpAddr::V4(b)) => Self::V4 {
                start: u32::from(a),
                end: u32::from(b),
            },
            (IpAddr::V6(a), IpAddr::V6(b)) => Self::V6 {
                start: u128::from(a),
                end: u128::from(b),
            },
            _ => return Err(IpRangeError::MixedFamilies),
        };

        let inverted = match range {
            Self::V4 { start, end } => start > end,
            Self::V6 { start, end } => start > end,
        };
        if inverted {
            return Err(IpRangeError::Inverted {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(range)
    }
}

impl FromStr for IpRange {
    type Err = IpRangeError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(IpRangeError::Empty);
        }

        if let Some((addr, prefix)) = pattern.split_once('/') {
            return parse_cidr(addr.trim(), prefix.trim());
        }

        if let Some((start, end)) = pattern.split_once('-') {
            return parse_dash_range(start.trim(), end.trim());
        }

        if pattern.contains('*') {
            return parse_wildcard(pattern);
        }

        let addr = parse_addr(pattern)?;
        Ok(Self::single(addr))
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::V4 { start, end } => {
                write!(f, "{}-{}", Ipv4Addr::from(start), Ipv4Addr::from(end))
            }
            Self::V6 { start, end } => {
                write!(f, "{}-{}", Ipv6Addr::from(start), Ipv6Addr::from(end))
            }
        }
    }
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn parse_addr(text: &str) -> Result<IpAddr, IpRangeError> {
    text.parse::<IpAddr>()
        .map_err(|_| IpRangeError::InvalidAddress {
            text: text.to_string(),
        })
}

fn parse_cidr(addr: &str, prefix: &str) -> Result<IpRange, IpRangeError> {
    let base = normalize(parse_addr(addr)?);
    let bits: u32 = prefix.parse().map_err(|_| IpRangeError::InvalidPrefix {
        text: prefix.to_string(),
    })?;

    match base {
        IpAddr::V4(v4) => {
            if bits > 32 {
                return Err(IpRangeError::InvalidPrefix {
                    text: prefix.to_string(),
                });
            }
            let host_mask = u32::MAX.checked_shr(bits).unwrap_or(0);
            let start = u32::from(v4) & !host_mask;
            Ok(IpRange::V4 {
                start,
                end: start | host_mask,
            })
        }
        IpAddr::V6(v6) => {
            if bits > 128 {
                return Err(IpRangeError::InvalidPrefix {
                    text: prefix.to_string(),
                });
            }
            let host_mask = u128::MAX.checked_shr(bits).unwrap_or(0);
            let start = u128::from(v6) & !host_mask;
            Ok(IpRange::V6 {
                start,
                end: start | host_mask,
            })
        }
    }
}

fn parse_dash_range(start: &str, end: &str) -> Result<IpRange, IpRangeError> {
    let start_addr = parse_addr(start)?;

    // `1.2.3.4-9` replaces the last octet only
    let end_addr = match (start_addr, end.parse::<u8>()) {
        (IpAddr::V4(v4), Ok(last_octet)) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, last_octet))
        }
        _ => parse_addr(end)?,
    };

    IpRange::from_bounds(start_addr, end_addr)
}

fn parse_wildcard(pattern: &str) -> Result<IpRange, IpRangeError> {
    let invalid = || IpRangeError::InvalidAddress {
        text: pattern.to_string(),
    };

    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return Err(invalid());
    }

    let mut low = [0u8; 4];
    let mut high = [0u8; 4];
    let mut seen_wildcard = false;
    for (i, part) in parts.iter().enumerate() {
        if *part == "*" {
            seen_wildcard = true;
            low[i] = 0;
            high[i] = u8::MAX;
        } else if seen_wildcard {
            // `1.*.3.4` has no contiguous numeric meaning
            return Err(invalid());
        } else {
            let octet: u8 = part.parse().map_err(|_| invalid())?;
            low[i] = octet;
            high[i] = octet;
        }
    }

    Ok(IpRange::V4 {
        start: u32::from(Ipv4Addr::from(low)),
        end: u32::from(Ipv4Addr::from(high)),
    })
}
