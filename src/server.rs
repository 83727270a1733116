//! HTTP(S) front end: guard middleware plus upstream forwarding.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::{self, AddExtension},
    response::{IntoResponse, Response},
};
use axum_server::{
    Handle,
    accept::Accept,
    tls_rustls::{RustlsAcceptor, RustlsConfig},
};
use futures::future::BoxFuture;
use reqwest::Client;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use rustls::server::WebPkiClientVerifier;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, TlsConfig};
use crate::context::PeerCertificates;
use crate::guard::{Guard, guard_middleware};
use crate::{Error, Result};

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding target for allowed requests.
#[derive(Clone)]
pub struct Upstream {
    base: String,
    client: Client,
}

impl Upstream {
    /// Forward to `base` (scheme, host and optional path prefix).
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(Error::Config(format!(
                "upstream must be an http(s) URL, got {base:?}"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn target(&self, request: &Request<Body>) -> String {
        let path = request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        format!("{}{path}", self.base)
    }
}

/// Assemble the router: every request passes the guard, then is forwarded.
pub fn router(guard: Arc<Guard>, upstream: Upstream) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(Arc::new(upstream))
        .layer(middleware::from_fn_with_state(guard, guard_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn forward(State(upstream): State<Arc<Upstream>>, request: Request<Body>) -> Response {
    let url = upstream.target(&request);
    let (parts, body) = request.into_parts();

    let outgoing = upstream
        .client
        .request(parts.method, &url)
        .headers(strip_hop_by_hop(parts.headers, true))
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    match outgoing.send().await {
        Ok(response) => {
            let status = response.status();
            let headers = strip_hop_by_hop(response.headers().clone(), false);
            let mut out = Response::new(Body::from_stream(response.bytes_stream()));
            *out.status_mut() = status;
            *out.headers_mut() = headers;
            out
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Upstream request failed");
            let status = if e.is_timeout() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            (status, status.canonical_reason().unwrap_or("Bad Gateway")).into_response()
        }
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap, request: bool) -> HeaderMap {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    if request {
        // reqwest derives Host from the target URL.
        headers.remove(header::HOST);
    } else {
        // The body is re-framed by this server.
        headers.remove(header::CONTENT_LENGTH);
    }
    headers
}

// ─────────────────────────────────────────────────────────────────────────────
// TLS
// ─────────────────────────────────────────────────────────────────────────────

/// Build the rustls server configuration.
///
/// With a client CA bundle, client certificates are requested and verified
/// against it; `require_client_cert` decides whether a handshake without one
/// is rejected. Without a bundle no client certificate is requested.
pub fn build_tls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    // Fails only when a provider is already installed.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let server_certs = load_certs(&tls.cert)?;
    let server_key = load_private_key(&tls.key)?;

    let builder = rustls::ServerConfig::builder();
    let builder = if tls.client_ca.is_empty() {
        builder.with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(&tls.client_ca)? {
            roots
                .add(cert)
                .map_err(|e| Error::Config(format!("Failed to add CA cert to trust store: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
        let verifier = if tls.require_client_cert {
            verifier
        } else {
            verifier.allow_unauthenticated()
        };
        let verifier = verifier
            .build()
            .map_err(|e| Error::Config(format!("Failed to build client verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    };

    let mut config = builder
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(
        cert = %tls.cert,
        client_ca = %tls.client_ca,
        require_client_cert = tls.require_client_cert,
        "TLS config built"
    );
    Ok(config)
}

/// Load all certificates from a PEM file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path)
        .map_err(|e| Error::Config(format!("Failed to load private key from '{path}': {e}")))
}

/// Rustls acceptor that exposes the peer certificate chain to handlers as a
/// [`PeerCertificates`] request extension.
#[derive(Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    /// Wrap a rustls configuration.
    #[must_use]
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let chain = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default();
            let service = Extension(PeerCertificates(chain)).layer(service);
            Ok((stream, service))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serving
// ─────────────────────────────────────────────────────────────────────────────

/// Serve until Ctrl-C or SIGTERM.
pub async fn run(config: &ServerConfig, guard: Arc<Guard>) -> Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address {:?}: {e}", config.listen)))?;
    let upstream = Upstream::new(&config.upstream, config.request_timeout)?;
    let app = router(guard, upstream).into_make_service_with_connect_info::<SocketAddr>();

    if let Some(tls) = &config.tls {
        let rustls_config = RustlsConfig::from_config(Arc::new(build_tls_config(tls)?));
        let handle = Handle::new();

        let shutdown = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        info!(%addr, upstream = %config.upstream, "Listening (TLS)");
        axum_server::bind(addr)
            .acceptor(PeerCertAcceptor::new(rustls_config))
            .handle(handle)
            .serve(app)
            .await?;
    } else {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, upstream = %config.upstream, "Listening (plain HTTP)");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
