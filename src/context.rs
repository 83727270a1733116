//! Per-request context seen by the rule tree and the decision pipeline.
//!
//! The context owns the request's header map while the guard runs; matchers
//! and the pipeline append annotation headers to it, and the middleware moves
//! it back into the outgoing request afterwards.

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, header};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::identity::ClientCert;

/// Annotation header names written by the guard.
pub mod headers {
    /// Decimal certificate serial number, or [`NO_CERT`] when absent.
    pub const CERT_SN: &str = "X-TLSGuard-Cert-SN";
    /// Certificate subject Common Name.
    pub const CERT_CN: &str = "X-TLSGuard-Cert-CN";
    /// The CIDR an IP-range rule matched.
    pub const CIDR: &str = "X-TLSGuard-Cidr";
    /// Set to `true` when a header rule matched.
    pub const HEADER: &str = "X-TLSGuard-Header";
    /// Marker value for [`CERT_SN`] when no client certificate was presented.
    pub const NO_CERT: &str = "NoCert";
    /// Preferred client address header.
    pub const REAL_IP: &str = "X-Real-Ip";
    /// Fallback client address header.
    pub const FORWARDED_FOR: &str = "X-Forwarded-For";
}

/// DER certificate chain the peer presented during the TLS handshake, leaf
/// first. The TLS acceptor inserts it into every request's extensions; an
/// empty chain means the connection is TLS but the client sent no
/// certificate.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(pub Vec<Vec<u8>>);

impl PeerCertificates {
    /// The end-entity certificate, if any.
    #[must_use]
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }
}

/// Mutable view of one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method.
    pub method: Method,
    /// Request target.
    pub uri: Uri,
    /// Request headers; the guard appends annotations here.
    pub headers: HeaderMap,
    /// Peer socket address, when known.
    pub remote_addr: Option<SocketAddr>,
    /// Whether the request arrived over TLS.
    pub tls: bool,
    /// Verified client certificate (leaf), if one was presented.
    pub cert: Option<ClientCert>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(Method::GET, Uri::from_static("/"))
    }
}

impl RequestContext {
    /// Create an empty context for `method` and `uri`.
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            remote_addr: None,
            tls: false,
            cert: None,
        }
    }

    /// Builder: add a request header. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Builder: attach a client certificate (implies TLS).
    #[must_use]
    pub fn with_cert(mut self, cert: ClientCert) -> Self {
        self.tls = true;
        self.cert = Some(cert);
        self
    }

    /// Non-empty UTF-8 value of a header, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    /// Set (replace) a header. Returns `false` if the name or value cannot be
    /// represented as an HTTP header.
    pub fn set_header(&mut self, name: &str, value: &str) -> bool {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!(header = %name, "Skipping header with invalid name or value");
            return false;
        };
        self.headers.insert(name, value);
        true
    }

    /// The raw client address candidate: `X-Real-Ip` when non-empty,
    /// otherwise the whole `X-Forwarded-For` value.
    #[must_use]
    pub fn client_ip_candidate(&self) -> Option<&str> {
        self.header(headers::REAL_IP)
            .or_else(|| self.header(headers::FORWARDED_FOR))
    }

    /// The `Req` object exposed to request-header templates.
    #[must_use]
    pub fn template_view(&self) -> Value {
        let mut header_map = Map::new();
        for name in self.headers.keys() {
            let joined = self
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            header_map.insert(canonical_header_name(name.as_str()), Value::String(joined));
        }

        let host = self
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| self.uri.authority().map(ToString::to_string))
            .unwrap_or_default();

        json!({
            "Method": self.method.as_str(),
            "Host": host,
            "URL": {
                "Path": self.uri.path(),
                "RawQuery": self.uri.query().unwrap_or_default(),
            },
            "Header": header_map,
            "RemoteAddr": self.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            "TLS": self.tls,
        })
    }
}

/// Canonical MIME header form: `x-api-key` → `X-Api-Key`.
#[must_use]
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
            })
        })
        .collect::<Vec<_>>()
        .join("-")
}
