//! TLS Guard Library
//!
//! Inline HTTP access control combining mutual-TLS client identities with a
//! hot-reloadable boolean rule tree over client IP ranges and request headers.
//!
//! # Features
//!
//! - **Certificate identities**: CN, DNS and email SANs mapped to usernames
//! - **Rule tree**: `allOf` / `anyOf` / `noneOf` over `ipRange` and `header` rules
//! - **External data**: rule templates rendered from a fetched JSON document
//! - **Hot refresh**: periodic, single-flight snapshot rebuilds under live traffic
//! - **Proxy**: axum middleware plus a streaming forwarder to one upstream

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod external_data;
pub mod guard;
pub mod identity;
pub mod interfaces;
pub mod rules;
pub mod server;
pub mod snapshot;
pub mod template;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to set up tracing: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to set up tracing: {e}")))?,
    }

    Ok(())
}
