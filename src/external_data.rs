//! External JSON data for rule templates.
//!
//! Each snapshot build fetches one document, optionally projects it through
//! `dataKey`, and exposes the result to range and header templates as
//! `.data`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ExternalDataConfig;
use crate::template::render_str;
use crate::{Error, Result};

/// Source of the external JSON document.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch and decode the document described by `config`.
    async fn fetch(&self, config: &ExternalDataConfig) -> Result<Value>;
}

/// Fetches the document over HTTP(S) with `GET`.
///
/// Header values are templates with access to `env` and `file` only; they
/// are rendered on every fetch so rotated credentials are picked up.
pub struct HttpDataSource {
    client: Client,
    insecure_client: Client,
}

impl HttpDataSource {
    /// Create a source whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        let insecure_client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            insecure_client,
        })
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch(&self, config: &ExternalDataConfig) -> Result<Value> {
        let client = if config.skip_tls_verify {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut request = client.get(&config.url);
        let no_data = json!({});
        for (name, source) in &config.headers {
            let value = render_str(source, &no_data)?;
            request = request.header(name.as_str(), value);
        }

        debug!(url = %config.url, "Fetching external data");
        let response = request
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("{}: {e}", config.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("{}: HTTP {status}", config.url)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::Fetch(format!("{}: invalid JSON: {e}", config.url)))
    }
}

/// Select the part of `document` exposed as `data`.
///
/// An empty `data_key` selects the whole document; otherwise the document
/// must be an object holding that key.
pub fn project(document: Value, data_key: &str) -> Result<Value> {
    if data_key.is_empty() {
        return Ok(document);
    }
    match document {
        Value::Object(mut map) => map
            .remove(data_key)
            .ok_or_else(|| Error::Fetch(format!("data key {data_key:?} not found in document"))),
        other => Err(Error::Fetch(format!(
            "data key {data_key:?} requires an object document, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
