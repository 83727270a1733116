//! Client-address range matching.

use std::net::IpAddr;

use tracing::debug;

use super::Cidr;
use crate::context::{RequestContext, headers};
use crate::interfaces::InterfaceSource;
use crate::{Error, Result};

/// Matches when the client address lies in one of the configured ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRangeRule {
    cidrs: Vec<Cidr>,
}

impl IpRangeRule {
    /// Build from already-rendered range strings.
    ///
    /// With `add_interface`, the default interface's networks reported by
    /// `interfaces` are appended after the configured ranges.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a malformed CIDR or an empty final range set;
    /// interface discovery errors are passed through.
    pub fn new(
        ranges: &[String],
        add_interface: bool,
        interfaces: &dyn InterfaceSource,
    ) -> Result<Self> {
        let mut cidrs = ranges
            .iter()
            .map(|r| r.parse::<Cidr>())
            .collect::<Result<Vec<_>>>()?;

        if add_interface {
            cidrs.extend(interfaces.local_cidrs()?);
        }

        if cidrs.is_empty() {
            return Err(Error::Config("no ranges provided".to_string()));
        }

        debug!(
            cidrs = ?cidrs.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "IP range rule ready"
        );
        Ok(Self { cidrs })
    }

    /// Ranges in evaluation order.
    #[must_use]
    pub fn cidrs(&self) -> &[Cidr] {
        &self.cidrs
    }

    /// First range containing `addr`.
    #[must_use]
    pub fn find(&self, addr: IpAddr) -> Option<&Cidr> {
        self.cidrs.iter().find(|c| c.contains(addr))
    }

    /// Match the request's client address, annotating the matched range.
    pub fn matches(&self, ctx: &mut RequestContext) -> bool {
        let Some(addr) = ctx
            .client_ip_candidate()
            .and_then(|raw| raw.trim().parse::<IpAddr>().ok())
        else {
            return false;
        };

        match self.find(addr) {
            Some(cidr) => {
                let shown = cidr.to_string();
                ctx.set_header(headers::CIDR, &shown);
                true
            }
            None => false,
        }
    }
}

/// Turn one rendered range value into range entries.
///
/// A value containing commas yields every trimmed, non-empty piece; any
/// other value yields itself trimmed, or nothing when blank.
#[must_use]
pub fn split_range_entries(rendered: &str) -> Vec<String> {
    if rendered.contains(',') {
        rendered
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        let trimmed = rendered.trim();
        if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        }
    }
}
