//! TLS client setup from a saved bundle.

use std::sync::Arc;

use remotebuild_certs::ClientBundle;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::error::SecurityError;
use crate::store::BundleStore;

/// How to reach a build server.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Name the bundle was saved under, when it is not the host.
    pub cert_name: Option<String>,
    /// Password the bundle was sealed with. Empty when unset.
    pub cert_password: Option<String>,
}

impl ConnectionInfo {
    fn bundle_key(&self) -> &str {
        self.cert_name.as_deref().unwrap_or(&self.host)
    }
}

/// Saves issued bundles and turns them into TLS client configurations.
#[derive(Debug, Clone)]
pub struct ConnectionSecurity {
    store: BundleStore,
}

impl ConnectionSecurity {
    pub const fn new(store: BundleStore) -> Self {
        Self { store }
    }

    /// Security backed by this platform's bundle store. Fails on platforms
    /// without one.
    pub fn platform_default() -> Result<Self, SecurityError> {
        BundleStore::platform_default().map(Self::new)
    }

    pub const fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Persist a bundle downloaded from `/certs/{pin}`.
    pub fn save_certificate(&self, data: &[u8], host: &str) -> Result<(), SecurityError> {
        self.store.save(data, host).map(|_| ())
    }

    /// TLS configuration for `info`, or `None` for a plain HTTP server.
    ///
    /// The server is verified against the CA carried in the bundle and the
    /// bundle's certificate is presented for client authentication. A missing
    /// or unreadable bundle is an error, never a fallback to plain HTTP.
    pub fn tls_client_config(
        &self,
        info: &ConnectionInfo,
    ) -> Result<Option<Arc<ClientConfig>>, SecurityError> {
        if !info.secure {
            return Ok(None);
        }
        let sealed = self.store.load(info.bundle_key())?;
        let bundle = ClientBundle::open(&sealed, info.cert_password.as_deref().unwrap_or(""))?;
        let config = client_config(&bundle)?;
        debug!(host = %info.host, port = info.port, "TLS client configured");
        Ok(Some(Arc::new(config)))
    }
}

fn client_config(bundle: &ClientBundle) -> Result<ClientConfig, SecurityError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(bundle.ca_cert_pem.as_bytes()) {
        let cert = cert.map_err(|e| SecurityError::Tls(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| SecurityError::Tls(e.to_string()))?;
    }

    let chain = CertificateDer::pem_slice_iter(bundle.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SecurityError::Tls(e.to_string()))?;
    let key = PrivateKeyDer::from_pem_slice(bundle.key_pem.as_bytes())
        .map_err(|e| SecurityError::Tls(e.to_string()))?;

    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SecurityError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| SecurityError::Tls(e.to_string()))
}
