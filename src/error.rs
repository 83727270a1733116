//! Error types for TLS Guard

use std::io;

use thiserror::Error;

/// Result type alias for TLS Guard
pub type Result<T> = std::result::Result<T, Error>;

/// TLS Guard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (malformed CIDR, regex, duration, rule type, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Template parse or render error
    #[error("Template error: {0}")]
    Template(String),

    /// External data could not be fetched or decoded
    #[error("External data error: {0}")]
    Fetch(String),

    /// Local interface discovery failed
    #[error("Interface discovery error: {0}")]
    Interface(String),

    /// A rule snapshot build exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` for errors caused by the configuration itself rather
    /// than by the environment (network, filesystem, clock).
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Template(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_template_errors_are_config_errors() {
        assert!(Error::Config("bad cidr".into()).is_config());
        assert!(Error::Template("unclosed action".into()).is_config());
    }

    #[test]
    fn runtime_errors_are_not_config_errors() {
        assert!(!Error::Fetch("connection refused".into()).is_config());
        assert!(!Error::Timeout("refresh".into()).is_config());
        assert!(!Error::Interface("no default route".into()).is_config());
    }

    #[test]
    fn display_includes_category_prefix() {
        let e = Error::Config("invalid cidr: 10.0.0.0/33".into());
        assert_eq!(e.to_string(), "Configuration error: invalid cidr: 10.0.0.0/33");
    }
}
