//! The access decision pipeline and its axum middleware.
//!
//! For each request:
//!
//! 1. A client certificate that resolves to a user is allowed outright. The
//!    username header, certificate headers and certificate-aware request
//!    headers are set.
//! 2. An unresolved certificate still contributes its headers. A request
//!    without one is marked `X-TLSGuard-Cert-SN: NoCert`.
//! 3. Without rules, a certificate is required. With rules, the current
//!    snapshot decides; a deny from a stale snapshot triggers one synchronous
//!    refresh and re-evaluation.
//! 4. Allowed requests get request headers rendered from `Req` and kick off a
//!    background refresh when the snapshot is stale.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::GuardConfig;
use crate::context::{PeerCertificates, RequestContext, headers};
use crate::external_data::DataSource;
use crate::identity::{ClientCert, IdentityDirectory};
use crate::interfaces::InterfaceSource;
use crate::snapshot::{RefreshOutcome, SnapshotBuilder, SnapshotStore};
use crate::template::Template;
use crate::{Error, Result};

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The rule tree did not match
    Forbidden,
    /// No rules are configured and no client certificate was presented
    CertificateRequired,
}

impl DenyReason {
    /// Plain-text response body.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Forbidden => "Forbidden",
            Self::CertificateRequired => "TLS client certificate is required for authentication",
        }
    }
}

/// Outcome of [`Guard::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request
    Allow,
    /// Respond 403 with the reason's message
    Deny(DenyReason),
}

impl Decision {
    /// Returns `true` for [`Decision::Allow`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// The access guard.
pub struct Guard {
    directory: IdentityDirectory,
    username_header: String,
    request_headers: Vec<(String, Template)>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl Guard {
    /// Build the guard from configuration.
    ///
    /// The identity directory, request-header templates and (when rules are
    /// configured) the first rule snapshot are all built here; any failure is
    /// returned and should abort startup.
    pub async fn from_config(
        config: &GuardConfig,
        data_source: Arc<dyn DataSource>,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Result<Self> {
        let request_headers = compile_request_headers(&config.request_headers)?;

        let snapshots = if config.rules.is_empty() {
            None
        } else {
            let builder = SnapshotBuilder::new(config, data_source, interfaces);
            Some(Arc::new(
                SnapshotStore::initialize(builder, config.refresh_timeout).await?,
            ))
        };

        Ok(Self::new(
            IdentityDirectory::new(config.users.clone()),
            config.username_header.clone(),
            request_headers,
            snapshots,
        ))
    }

    /// Assemble a guard from prepared parts.
    #[must_use]
    pub fn new(
        directory: IdentityDirectory,
        username_header: String,
        request_headers: Vec<(String, Template)>,
        snapshots: Option<Arc<SnapshotStore>>,
    ) -> Self {
        Self {
            directory,
            username_header,
            request_headers,
            snapshots,
        }
    }

    /// The snapshot store, when rules are configured.
    #[must_use]
    pub fn snapshots(&self) -> Option<&Arc<SnapshotStore>> {
        self.snapshots.as_ref()
    }

    /// The identity directory.
    #[must_use]
    pub fn directory(&self) -> &IdentityDirectory {
        &self.directory
    }

    /// Decide on a request, annotating `ctx.headers` along the way.
    ///
    /// Client-sent copies of every header the guard sets are dropped first,
    /// so the upstream only ever sees values written here.
    pub async fn evaluate(&self, ctx: &mut RequestContext) -> Decision {
        self.strip_owned_headers(ctx);

        if let Some(cert) = ctx.cert.clone() {
            if let Some(username) = self.directory.resolve(&cert) {
                if !self.username_header.is_empty() {
                    ctx.set_header(&self.username_header, &username);
                }
                self.apply_cert_headers(ctx, &cert);
                debug!(user = %username, "Allowed by client certificate");
                record("allow_identity");
                return Decision::Allow;
            }
            self.apply_cert_headers(ctx, &cert);
        } else {
            ctx.set_header(headers::CERT_SN, headers::NO_CERT);
        }

        let allowed = match &self.snapshots {
            Some(store) => evaluate_rules(store, ctx).await,
            None if ctx.cert.is_some() => true,
            None => {
                debug!("Denied: no rules and no client certificate");
                record("deny");
                return Decision::Deny(DenyReason::CertificateRequired);
            }
        };

        if !allowed {
            debug!(
                client_ip = ctx.client_ip_candidate().unwrap_or_default(),
                path = %ctx.uri.path(),
                "Denied by rules"
            );
            record("deny");
            return Decision::Deny(DenyReason::Forbidden);
        }

        let view = json!({ "Req": ctx.template_view() });
        self.render_request_headers(ctx, &view);

        if let Some(store) = &self.snapshots {
            store.trigger_background();
        }

        debug!(path = %ctx.uri.path(), "Allowed by rules");
        record("allow");
        Decision::Allow
    }

    fn strip_owned_headers(&self, ctx: &mut RequestContext) {
        let owned = [
            headers::CERT_SN,
            headers::CERT_CN,
            headers::CIDR,
            headers::HEADER,
        ];
        let configured = self.request_headers.iter().map(|(name, _)| name.as_str());
        for name in owned
            .into_iter()
            .chain(configured)
            .chain(Some(self.username_header.as_str()).filter(|h| !h.is_empty()))
        {
            if ctx.headers.remove(name).is_some() {
                debug!(header = name, "Dropped client-supplied header");
            }
        }
    }

    fn apply_cert_headers(&self, ctx: &mut RequestContext, cert: &ClientCert) {
        ctx.set_header(headers::CERT_SN, &cert.serial_number);
        ctx.set_header(headers::CERT_CN, &cert.common_name);
        let view = json!({ "Cert": cert.template_view(), "Req": ctx.template_view() });
        self.render_request_headers(ctx, &view);
    }

    fn render_request_headers(&self, ctx: &mut RequestContext, view: &Value) {
        for (name, template) in &self.request_headers {
            match template.render(view) {
                Ok(value) => {
                    ctx.set_header(name, &value);
                }
                Err(e) => {
                    warn!(header = %name, error = %e, "Skipping request header");
                }
            }
        }
    }
}

async fn evaluate_rules(store: &SnapshotStore, ctx: &mut RequestContext) -> bool {
    let snapshot = store.current();
    if snapshot.matches(ctx) {
        return true;
    }
    if !snapshot.is_stale() {
        return false;
    }

    match store.refresh_if_stale().await {
        Ok(RefreshOutcome::Refreshed | RefreshOutcome::NotNeeded) => {
            let latest = store.current();
            !Arc::ptr_eq(&latest, &snapshot) && latest.matches(ctx)
        }
        Err(e) => {
            warn!(error = %e, "Rule refresh failed; keeping current rules");
            false
        }
    }
}

fn record(outcome: &'static str) {
    telemetry_metrics::counter!("tls_guard_decisions_total", "outcome" => outcome).increment(1);
}

/// Parse the configured request-header templates, rejecting bad names and
/// template syntax.
pub fn compile_request_headers(
    sources: &BTreeMap<String, String>,
) -> Result<Vec<(String, Template)>> {
    sources
        .iter()
        .map(|(name, source)| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid request header name {name:?}: {e}")))?;
            let template = Template::parse(source)?;
            Ok((name.clone(), template))
        })
        .collect()
}

/// Axum middleware applying a [`Guard`] to every request.
///
/// The peer certificate chain is read from [`PeerCertificates`] and the peer
/// address from [`ConnectInfo`], when the server provides them.
pub async fn guard_middleware(
    State(guard): State<Arc<Guard>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();

    let peer = parts.extensions.get::<PeerCertificates>();
    let tls = peer.is_some();
    let cert = peer
        .and_then(PeerCertificates::leaf)
        .and_then(|der| match ClientCert::from_der(der) {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable client certificate");
                None
            }
        });
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let mut ctx = RequestContext {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        headers: std::mem::take(&mut parts.headers),
        remote_addr,
        tls,
        cert,
    };

    match guard.evaluate(&mut ctx).await {
        Decision::Allow => {
            parts.headers = ctx.headers;
            next.run(Request::from_parts(parts, body)).await
        }
        Decision::Deny(reason) => (StatusCode::FORBIDDEN, reason.message()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{ExternalDataConfig, RawRule, RuleKind};
    use crate::interfaces::StaticInterfaces;

    struct NoData;

    #[async_trait]
    impl DataSource for NoData {
        async fn fetch(&self, _config: &ExternalDataConfig) -> Result<Value> {
            Err(Error::Fetch("not configured".to_string()))
        }
    }

    async fn guard(config: GuardConfig) -> Guard {
        Guard::from_config(
            &config,
            Arc::new(NoData),
            Arc::new(StaticInterfaces::default()),
        )
        .await
        .unwrap()
    }

    fn office_rule() -> RawRule {
        RawRule {
            kind: RuleKind::IpRange,
            ranges: vec!["10.0.0.0/8".to_string()],
            headers: BTreeMap::new(),
            add_interface: false,
            rules: Vec::new(),
        }
    }

    fn cert(cn: &str) -> ClientCert {
        ClientCert {
            common_name: cn.to_string(),
            serial_number: "4660".to_string(),
            ..ClientCert::default()
        }
    }

    #[tokio::test]
    async fn no_rules_and_no_cert_requires_certificate() {
        let guard = guard(GuardConfig::default()).await;
        let mut ctx = RequestContext::default();

        let decision = guard.evaluate(&mut ctx).await;

        assert_eq!(decision, Decision::Deny(DenyReason::CertificateRequired));
        assert_eq!(ctx.header(headers::CERT_SN), Some(headers::NO_CERT));
    }

    #[tokio::test]
    async fn no_rules_with_unknown_cert_is_allowed() {
        let guard = guard(GuardConfig::default()).await;
        let mut ctx = RequestContext::default().with_cert(cert("stranger"));

        assert!(guard.evaluate(&mut ctx).await.is_allowed());
        assert_eq!(ctx.header(headers::CERT_SN), Some("4660"));
        assert_eq!(ctx.header(headers::CERT_CN), Some("stranger"));
    }

    #[tokio::test]
    async fn known_cert_bypasses_rules() {
        // GIVEN: rules that would deny, and a directory knowing the cert
        let guard = guard(GuardConfig {
            users: HashMap::from([("svc.internal".to_string(), String::new())]),
            username_header: "X-User".to_string(),
            rules: vec![office_rule()],
            ..GuardConfig::default()
        })
        .await;
        let mut ctx = RequestContext::default()
            .with_header(headers::REAL_IP, "8.8.8.8")
            .with_cert(cert("svc.internal"));

        // THEN: allowed, and the empty username falls back to the identifier
        assert!(guard.evaluate(&mut ctx).await.is_allowed());
        assert_eq!(ctx.header("X-User"), Some("svc.internal"));
        assert_eq!(ctx.header(headers::CIDR), None);
    }

    #[tokio::test]
    async fn unknown_cert_falls_through_to_rules() {
        let guard = guard(GuardConfig {
            users: HashMap::from([("alice".to_string(), "alice".to_string())]),
            username_header: "X-User".to_string(),
            rules: vec![office_rule()],
            ..GuardConfig::default()
        })
        .await;

        let mut denied = RequestContext::default()
            .with_header(headers::REAL_IP, "8.8.8.8")
            .with_cert(cert("mallory"));
        assert_eq!(
            guard.evaluate(&mut denied).await,
            Decision::Deny(DenyReason::Forbidden)
        );
        assert_eq!(denied.header("X-User"), None);
        assert_eq!(denied.header(headers::CERT_CN), Some("mallory"));

        let mut allowed = RequestContext::default()
            .with_header(headers::REAL_IP, "10.2.3.4")
            .with_cert(cert("mallory"));
        assert!(guard.evaluate(&mut allowed).await.is_allowed());
    }

    #[tokio::test]
    async fn request_headers_render_from_req_on_rule_allow() {
        let guard = guard(GuardConfig {
            rules: vec![office_rule()],
            request_headers: BTreeMap::from([
                ("X-Path".to_string(), "[[ .Req.URL.Path ]]".to_string()),
                ("X-Cert".to_string(), "[[ .Cert.Subject.CommonName ]]".to_string()),
            ]),
            ..GuardConfig::default()
        })
        .await;
        let mut ctx = RequestContext::new(
            axum::http::Method::GET,
            axum::http::Uri::from_static("/reports?q=1"),
        )
        .with_header(headers::REAL_IP, "10.0.0.9");

        assert!(guard.evaluate(&mut ctx).await.is_allowed());
        assert_eq!(ctx.header("X-Path"), Some("/reports"));
        // Cert is not available without a certificate: that header is skipped.
        assert_eq!(ctx.header("X-Cert"), None);
    }

    #[tokio::test]
    async fn cert_headers_render_for_resolved_identity() {
        let guard = guard(GuardConfig {
            users: HashMap::from([("alice".to_string(), "alice".to_string())]),
            request_headers: BTreeMap::from([(
                "X-Cert-Name".to_string(),
                "cn=[[ .Cert.Subject.CommonName ]] sn=[[ .Cert.SerialNumber ]]".to_string(),
            )]),
            ..GuardConfig::default()
        })
        .await;
        let mut ctx = RequestContext::default().with_cert(cert("alice"));

        assert!(guard.evaluate(&mut ctx).await.is_allowed());
        assert_eq!(ctx.header("X-Cert-Name"), Some("cn=alice sn=4660"));
    }

    #[tokio::test]
    async fn request_header_syntax_error_is_fatal() {
        let result = Guard::from_config(
            &GuardConfig {
                request_headers: BTreeMap::from([(
                    "X-Broken".to_string(),
                    "[[ .Req.Method".to_string(),
                )]),
                ..GuardConfig::default()
            },
            Arc::new(NoData),
            Arc::new(StaticInterfaces::default()),
        )
        .await;
        assert!(result.is_err_and(|e| e.is_config()));
    }

    #[tokio::test]
    async fn startup_fetch_failure_is_fatal() {
        let result = Guard::from_config(
            &GuardConfig {
                rules: vec![office_rule()],
                external_data: ExternalDataConfig {
                    url: "http://ranges.test/".to_string(),
                    ..ExternalDataConfig::default()
                },
                refresh_interval: Some(Duration::from_secs(60)),
                ..GuardConfig::default()
            },
            Arc::new(NoData),
            Arc::new(StaticInterfaces::default()),
        )
        .await;
        assert!(matches!(result, Err(Error::Fetch(_))));
    }

    #[tokio::test]
    async fn client_supplied_guard_headers_are_dropped() {
        // GIVEN: a request allowed by IP that forges every guard-owned header
        let guard = guard(GuardConfig {
            username_header: "X-User".to_string(),
            rules: vec![office_rule()],
            request_headers: BTreeMap::from([(
                "X-Original-Method".to_string(),
                "[[ .Req.Method ]]".to_string(),
            )]),
            ..GuardConfig::default()
        })
        .await;
        let mut ctx = RequestContext::default()
            .with_header(headers::REAL_IP, "10.1.1.1")
            .with_header("X-User", "admin")
            .with_header(headers::CERT_CN, "alice")
            .with_header(headers::CIDR, "0.0.0.0/0")
            .with_header(headers::HEADER, "true")
            .with_header("X-Original-Method", "DELETE");

        // WHEN
        assert!(guard.evaluate(&mut ctx).await.is_allowed());

        // THEN: only values written by the guard survive
        assert_eq!(ctx.header("X-User"), None);
        assert_eq!(ctx.header(headers::CERT_CN), None);
        assert_eq!(ctx.header(headers::HEADER), None);
        assert_eq!(ctx.header(headers::CERT_SN), Some(headers::NO_CERT));
        assert_eq!(ctx.header(headers::CIDR), Some("10.0.0.0/8"));
        assert_eq!(ctx.header("X-Original-Method"), Some("GET"));
        assert_eq!(ctx.header(headers::REAL_IP), Some("10.1.1.1"));
    }

    #[test]
    fn deny_messages() {
        assert_eq!(DenyReason::Forbidden.message(), "Forbidden");
        assert_eq!(
            DenyReason::CertificateRequired.message(),
            "TLS client certificate is required for authentication"
        );
    }
}
