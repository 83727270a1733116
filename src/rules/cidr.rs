//! CIDR network ranges for IPv4 and IPv6.
//!
//! Parsing masks the host bits off, so `10.1.2.3/8` and `10.0.0.0/8` denote
//! the same network and both display as `10.0.0.0/8`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::Error;

/// A contiguous address range: network address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cidr {
    /// IPv4 network (prefix 0..=32)
    V4 {
        /// Network address with host bits cleared
        network: Ipv4Addr,
        /// Prefix length
        prefix: u8,
    },
    /// IPv6 network (prefix 0..=128)
    V6 {
        /// Network address with host bits cleared
        network: Ipv6Addr,
        /// Prefix length
        prefix: u8,
    },
}

impl Cidr {
    /// Build a CIDR from any address in the range and a prefix length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the prefix exceeds the address width.
    pub fn new(addr: IpAddr, prefix: u8) -> crate::Result<Self> {
        match addr {
            IpAddr::V4(v4) if prefix <= 32 => Ok(Self::V4 {
                network: Ipv4Addr::from(u32::from(v4) & v4_mask(prefix)),
                prefix,
            }),
            IpAddr::V6(v6) if prefix <= 128 => Ok(Self::V6 {
                network: Ipv6Addr::from(u128::from(v6) & v6_mask(prefix)),
                prefix,
            }),
            _ => Err(Error::Config(format!("invalid prefix length /{prefix} for {addr}"))),
        }
    }

    /// Returns `true` when `addr` lies inside this range.
    ///
    /// An IPv4 address never matches an IPv6 range and vice versa; an
    /// IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) is compared as IPv4.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
            v4 @ IpAddr::V4(_) => v4,
        };
        match (self, addr) {
            (Self::V4 { network, prefix }, IpAddr::V4(ip)) => {
                u32::from(ip) & v4_mask(*prefix) == u32::from(*network)
            }
            (Self::V6 { network, prefix }, IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(*prefix) == u128::from(*network)
            }
            _ => false,
        }
    }

    /// Prefix length in bits.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        match self {
            Self::V4 { prefix, .. } | Self::V6 { prefix, .. } => *prefix,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("invalid cidr: {s} (missing prefix length)")))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid cidr: {s} ({e})")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| Error::Config(format!("invalid cidr: {s} ({e})")))?;
        Self::new(addr, prefix).map_err(|_| Error::Config(format!("invalid cidr: {s}")))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 { network, prefix } => write!(f, "{network}/{prefix}"),
            Self::V6 { network, prefix } => write!(f, "{network}/{prefix}"),
        }
    }
}
