//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, http::HeaderMap, middleware, routing::any};
use rcgen::string::Ia5String;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use serde_json::{Value, json};

use tls_guard::config::{ExternalDataConfig, GuardConfig};
use tls_guard::external_data::DataSource;
use tls_guard::guard::{Guard, guard_middleware};
use tls_guard::interfaces::StaticInterfaces;
use tls_guard::{Error, Result};

/// External data source returning `{"cidr": <current>}`, counting fetches.
pub struct FakeSource {
    cidr: parking_lot::Mutex<String>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl FakeSource {
    pub fn new(cidr: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            cidr: parking_lot::Mutex::new(cidr.to_string()),
            fetches: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn set_cidr(&self, cidr: &str) {
        *self.cidr.lock() = cidr.to_string();
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for FakeSource {
    async fn fetch(&self, config: &ExternalDataConfig) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if config.url.is_empty() {
            return Err(Error::Fetch("no url".to_string()));
        }
        Ok(json!({ "cidr": self.cidr.lock().clone() }))
    }
}

/// Build a guard with a static (empty) interface list.
pub async fn guard_with(config: &GuardConfig, source: Arc<dyn DataSource>) -> Arc<Guard> {
    Arc::new(
        Guard::from_config(config, source, Arc::new(StaticInterfaces::default()))
            .await
            .expect("guard should build"),
    )
}

/// Parse a YAML guard section.
pub fn guard_config(yaml: &str) -> GuardConfig {
    serde_yaml::from_str(yaml).expect("valid guard yaml")
}

/// Echo app behind the guard: responds with the request headers it saw.
pub fn echo_app(guard: Arc<Guard>) -> Router {
    Router::new()
        .route("/", any(echo))
        .route("/{*path}", any(echo))
        .layer(middleware::from_fn_with_state(guard, guard_middleware))
}

async fn echo(headers: HeaderMap) -> Json<Value> {
    let seen: BTreeMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    Json(json!(seen))
}

/// A self-signed client certificate with the given CN and SANs.
pub struct TestCert {
    pub der: Vec<u8>,
    pub cert_pem: String,
    pub key_pem: String,
    pub key_der: Vec<u8>,
}

pub fn client_cert(cn: &str, dns: &[&str], emails: &[&str]) -> TestCert {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    for name in dns {
        params
            .subject_alt_names
            .push(SanType::DnsName(Ia5String::try_from(*name).unwrap()));
    }
    for email in emails {
        params
            .subject_alt_names
            .push(SanType::Rfc822Name(Ia5String::try_from(*email).unwrap()));
    }
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    TestCert {
        der: cert.der().to_vec(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        key_der: key.serialize_der(),
    }
}

/// Decode an echo response body.
pub async fn echoed(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
