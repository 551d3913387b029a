#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
//! Mutual TLS handshakes between the server's listener configuration and a
//! client configured from a PIN-downloaded bundle. Pairing has to survive a
//! server restart and a server certificate reset.

use std::path::Path;
use std::sync::Arc;

use remotebuild_certs::{CertificateStore, ClientBundle};
use remotebuild_client::{BundleStore, ConnectionInfo, ConnectionSecurity};
use remotebuild_server::tls::server_tls_config;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const HOST: &str = "build.local";

/// One handshake over an in-memory pipe. Returns whether the server saw a
/// client certificate, or the first error either side hit.
async fn handshake(server: Arc<ServerConfig>, client: Arc<ClientConfig>) -> std::io::Result<bool> {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let serve = async move {
        let mut tls = TlsAcceptor::from(server).accept(server_io).await?;
        let verified = tls
            .get_ref()
            .1
            .peer_certificates()
            .is_some_and(|chain| !chain.is_empty());
        tls.write_all(b"ok").await?;
        tls.shutdown().await?;
        Ok::<_, std::io::Error>(verified)
    };
    let connect = async move {
        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = TlsConnector::from(client).connect(name, client_io).await?;
        let mut reply = [0u8; 2];
        tls.read_exact(&mut reply).await?;
        assert_eq!(&reply, b"ok");
        Ok::<_, std::io::Error>(())
    };
    let (verified, connected) = tokio::join!(serve, connect);
    connected?;
    verified
}

fn listener(certs: &CertificateStore) -> Arc<ServerConfig> {
    server_tls_config(&certs.get_server_certs().unwrap()).unwrap()
}

fn issue(certs: &CertificateStore) -> Vec<u8> {
    let pin = certs.generate_client_cert().unwrap();
    certs.download_client_certs(pin, 10.0).unwrap()
}

/// Client configured the way a paired client is: bundle saved, then loaded.
fn paired_client(certs: &CertificateStore, client_dir: &Path) -> Arc<ClientConfig> {
    let security = ConnectionSecurity::new(BundleStore::at(client_dir));
    security.save_certificate(&issue(certs), HOST).unwrap();
    let info = ConnectionInfo {
        secure: true,
        host: HOST.to_string(),
        port: 3000,
        ..ConnectionInfo::default()
    };
    security.tls_client_config(&info).unwrap().unwrap()
}

fn roots(ca_pem: &str) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    roots
}

fn client_builder() -> rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier> {
    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
}

#[tokio::test]
async fn pairing_survives_restart_and_server_cert_reset() {
    let dir = tempfile::tempdir().unwrap();
    let server_dir = dir.path().join("server");
    let certs = CertificateStore::new(&server_dir, HOST);
    assert!(certs.initialize_server_certs().unwrap().new_certs);
    let client = paired_client(&certs, &dir.path().join("client"));

    assert!(handshake(listener(&certs), Arc::clone(&client)).await.unwrap());

    // A restart reuses what is on disk.
    let certs = CertificateStore::new(&server_dir, HOST);
    assert!(!certs.initialize_server_certs().unwrap().new_certs);
    assert!(handshake(listener(&certs), Arc::clone(&client)).await.unwrap());

    // A reset replaces the server certificate under the same CA.
    let before = certs.get_server_certs().unwrap().server_cert_pem;
    assert!(certs.reset_server_cert(&|_: &str| true).unwrap());
    assert_ne!(certs.get_server_certs().unwrap().server_cert_pem, before);
    assert!(handshake(listener(&certs), client).await.unwrap());
}

#[tokio::test]
async fn client_without_certificate_connects_unverified() {
    let dir = tempfile::tempdir().unwrap();
    let certs = CertificateStore::new(dir.path(), HOST);
    certs.initialize_server_certs().unwrap();

    let ca = certs.get_server_certs().unwrap().ca_cert_pem;
    let anonymous = Arc::new(
        client_builder()
            .with_root_certificates(roots(&ca))
            .with_no_client_auth(),
    );
    assert!(!handshake(listener(&certs), anonymous).await.unwrap());
}

#[tokio::test]
async fn certificate_from_another_authority_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let certs = CertificateStore::new(dir.path().join("server"), HOST);
    certs.initialize_server_certs().unwrap();
    let other = CertificateStore::new(dir.path().join("other"), HOST);
    other.initialize_server_certs().unwrap();

    // Trusts our server but presents a certificate signed by another CA.
    let foreign = ClientBundle::open(&issue(&other), "").unwrap();
    let chain = CertificateDer::pem_slice_iter(foreign.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = PrivateKeyDer::from_pem_slice(foreign.key_pem.as_bytes()).unwrap();
    let ca = certs.get_server_certs().unwrap().ca_cert_pem;
    let client = Arc::new(
        client_builder()
            .with_root_certificates(roots(&ca))
            .with_client_auth_cert(chain, key)
            .unwrap(),
    );

    assert!(handshake(listener(&certs), client).await.is_err());
}
