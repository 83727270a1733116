//! Local network-interface range discovery.
//!
//! An IP-range rule with `addInterface: true` also admits the address ranges
//! of the host's default-route interface. On Linux these come from procfs:
//!
//! - `/proc/net/route` names the default-route interface (destination and
//!   mask both `00000000`) and lists its directly connected IPv4 networks.
//! - `/proc/net/if_inet6` lists the interface's IPv6 addresses with their
//!   prefix lengths.
//!
//! Other platforms report [`Error::Interface`].

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::rules::Cidr;
use crate::{Error, Result};

/// Source of the host's own address ranges.
pub trait InterfaceSource: Send + Sync {
    /// CIDR ranges of the default-route interface.
    fn local_cidrs(&self) -> Result<Vec<Cidr>>;
}

/// Reads interface ranges from Linux procfs.
#[derive(Debug, Clone)]
pub struct ProcNetInterfaces {
    route_path: String,
    inet6_path: String,
}

impl Default for ProcNetInterfaces {
    fn default() -> Self {
        Self {
            route_path: "/proc/net/route".to_string(),
            inet6_path: "/proc/net/if_inet6".to_string(),
        }
    }
}

impl ProcNetInterfaces {
    /// Read from alternative file locations (used by tests and containers
    /// that mount the host's procfs elsewhere).
    #[must_use]
    pub fn with_paths(route_path: impl Into<String>, inet6_path: impl Into<String>) -> Self {
        Self {
            route_path: route_path.into(),
            inet6_path: inet6_path.into(),
        }
    }
}

impl InterfaceSource for ProcNetInterfaces {
    fn local_cidrs(&self) -> Result<Vec<Cidr>> {
        if !cfg!(target_os = "linux") {
            return Err(Error::Interface(
                "interface discovery is only supported on Linux".to_string(),
            ));
        }

        let route = fs::read_to_string(&self.route_path)
            .map_err(|e| Error::Interface(format!("{}: {e}", self.route_path)))?;
        let iface = default_route_interface(&route)?;
        debug!(interface = %iface, "Default route interface");

        let mut cidrs = ipv4_ranges(&route, &iface)?;

        // A host without IPv6 has no if_inet6 file.
        match fs::read_to_string(&self.inet6_path) {
            Ok(inet6) => cidrs.extend(ipv6_ranges(&inet6, &iface)?),
            Err(e) => debug!(path = %self.inet6_path, error = %e, "No IPv6 interface table"),
        }

        debug!(interface = %iface, ranges = ?cidrs.iter().map(ToString::to_string).collect::<Vec<_>>(), "Interface ranges");
        Ok(cidrs)
    }
}

/// Static list of ranges; handy for tests and for pinning interface ranges
/// in environments without procfs.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<Cidr>);

impl InterfaceSource for StaticInterfaces {
    fn local_cidrs(&self) -> Result<Vec<Cidr>> {
        Ok(self.0.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// procfs parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Name of the interface carrying the default route.
fn default_route_interface(route_table: &str) -> Result<String> {
    route_table
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|f| f.len() > 7 && f[1] == "00000000" && f[7] == "00000000")
        .map(|f| f[0].to_string())
        .ok_or_else(|| Error::Interface("default gateway interface not found".to_string()))
}

/// Directly connected IPv4 networks of `iface` (non-default, no gateway).
fn ipv4_ranges(route_table: &str, iface: &str) -> Result<Vec<Cidr>> {
    let mut out = Vec::new();
    for line in route_table.lines().skip(1) {
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() <= 7 || f[0] != iface || f[7] == "00000000" || f[2] != "00000000" {
            continue;
        }
        let network = parse_le_ipv4(f[1])?;
        let mask = parse_le_ipv4(f[7])?;
        #[allow(clippy::cast_possible_truncation)] // count_ones() of a u32 is <= 32
        let prefix = u32::from(mask).count_ones() as u8;
        out.push(Cidr::new(IpAddr::V4(network), prefix)?);
    }
    Ok(out)
}

/// IPv6 address ranges of `iface`.
fn ipv6_ranges(if_inet6: &str, iface: &str) -> Result<Vec<Cidr>> {
    let mut out = Vec::new();
    for line in if_inet6.lines() {
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() < 6 || f[5] != iface {
            continue;
        }
        let addr = u128::from_str_radix(f[0], 16)
            .map_err(|e| Error::Interface(format!("malformed if_inet6 address {}: {e}", f[0])))?;
        let prefix = u8::from_str_radix(f[2], 16)
            .map_err(|e| Error::Interface(format!("malformed if_inet6 prefix {}: {e}", f[2])))?;
        out.push(Cidr::new(IpAddr::V6(Ipv6Addr::from(addr)), prefix)?);
    }
    Ok(out)
}

/// `/proc/net/route` stores addresses as little-endian hex words.
fn parse_le_ipv4(hex: &str) -> Result<Ipv4Addr> {
    let raw = u32::from_str_radix(hex, 16)
        .map_err(|e| Error::Interface(format!("malformed route address {hex}: {e}")))?;
    Ok(Ipv4Addr::from(raw.swap_bytes()))
}
