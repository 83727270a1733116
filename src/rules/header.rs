//! Request-header pattern matching.

use axum::http::HeaderName;
use regex::Regex;

use crate::context::{RequestContext, headers};
use crate::{Error, Result};

/// Matches when every configured header is present, non-empty, and contains
/// a match for its pattern.
#[derive(Debug, Clone)]
pub struct HeaderRule {
    patterns: Vec<(HeaderName, Regex)>,
}

impl HeaderRule {
    /// Compile `(header name, pattern)` pairs.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid header name or regex.
    pub fn new<I, K, V>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|(name, pattern)| {
                let (name, pattern) = (name.as_ref(), pattern.as_ref());
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::Config(format!("invalid header name {name:?}: {e}")))?;
                let regex = Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("invalid pattern for header {name}: {e}"))
                })?;
                Ok((header, regex))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Number of header constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns `true` when the rule has no constraints (it always matches).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Match request headers; sets `X-TLSGuard-Header: true` on success.
    pub fn matches(&self, ctx: &mut RequestContext) -> bool {
        for (name, regex) in &self.patterns {
            let Some(value) = ctx.header(name.as_str()) else {
                return false;
            };
            if !regex.is_match(value) {
                return false;
            }
        }
        ctx.set_header(headers::HEADER, "true");
        true
    }
}

impl PartialEq for HeaderRule {
    fn eq(&self, other: &Self) -> bool {
        self.patterns.len() == other.patterns.len()
            && self
                .patterns
                .iter()
                .zip(&other.patterns)
                .all(|((na, ra), (nb, rb))| na == nb && ra.as_str() == rb.as_str())
    }
}
