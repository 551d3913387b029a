//! HTTPS listener.
//!
//! The listener trusts client certificates signed by the server CA but also
//! admits clients without one, so that a fresh client can fetch its bundle
//! from `/certs/{pin}`. Each connection is tagged with a [`PeerIdentity`]
//! request extension and build routes refuse connections that did not
//! present a certificate.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Extension;
use axum::Router;
use axum::middleware::AddExtension;
use axum_server::Handle;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use remotebuild_certs::ServerCertPem;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::info;

/// In-flight requests get this long to finish after shutdown starts.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

/// TLS setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Invalid PEM data: {0}")]
    Pem(String),

    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Whether the connection presented a client certificate signed by the CA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub verified: bool,
}

/// Server config for the CA and server certificate in `pem`.
pub fn server_tls_config(pem: &ServerCertPem) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(pem.ca_cert_pem.as_bytes()) {
        let cert = cert.map_err(|e| TlsError::Pem(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| TlsError::Config(e.to_string()))?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .allow_unauthenticated()
        .build()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let chain = CertificateDer::pem_slice_iter(pem.server_cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(e.to_string()))?;
    let key = PrivateKeyDer::from_pem_slice(pem.server_key_pem.as_bytes())
        .map_err(|e| TlsError::Pem(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Rustls acceptor that records the peer's [`PeerIdentity`].
#[derive(Clone)]
pub struct ClientCertAcceptor {
    inner: RustlsAcceptor,
}

impl ClientCertAcceptor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(config)),
        }
    }
}

impl<I, S> Accept<I, S> for ClientCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerIdentity>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            // The verifier already rejected certificates not signed by the CA.
            let verified = stream
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty());
            Ok((stream, Extension(PeerIdentity { verified }).layer(service)))
        })
    }
}

/// Serve `app` on `addr` until `shutdown` flips to `true`. Plain HTTP when
/// `tls` is `None`.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    tls: Option<Arc<ServerConfig>>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let handle = Handle::new();
    let watcher = handle.clone();
    tokio::spawn(async move {
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        watcher.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
    });

    let service = app.into_make_service();
    match tls {
        Some(config) => {
            info!(%addr, "Listening with TLS");
            axum_server::bind(addr)
                .acceptor(ClientCertAcceptor::new(config))
                .handle(handle)
                .serve(service)
                .await
        }
        None => {
            info!(%addr, "Listening without TLS");
            axum_server::bind(addr).handle(handle).serve(service).await
        }
    }
}
