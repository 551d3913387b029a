//! CA, server and client certificate generation.
//!
//! The CA parameters are rebuilt deterministically from the organisation name
//! whenever the CA key is loaded from disk, so certificates signed after a
//! restart carry the same issuer name and key identifier as the stored CA
//! certificate.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use crate::error::CertError;

/// Organisation written into every certificate subject.
pub const ORG_NAME: &str = "remotebuild";

/// Default validity for all generated certificates: five years.
pub const DEFAULT_VALIDITY_DAYS: u32 = 5 * 365;

/// CA material used for signing.
pub struct CaBundle {
    /// CA certificate parameters (needed for signing).
    pub params: CertificateParams,
    /// CA key pair.
    pub key_pair: KeyPair,
    /// PEM-encoded CA certificate.
    pub ca_cert_pem: String,
}

/// A PEM certificate and its private key.
pub struct SignedPair {
    pub cert_pem: String,
    pub key_pem: String,
}

fn ca_params(validity_days: u32) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{ORG_NAME} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, ORG_NAME);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);
    set_validity(&mut params, validity_days);
    params
}

fn set_validity(params: &mut CertificateParams, validity_days: u32) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(i64::from(validity_days));
}

/// Generate a self-signed CA.
pub fn generate_ca(validity_days: u32) -> Result<CaBundle, CertError> {
    let params = ca_params(validity_days);
    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        params,
        key_pair,
    })
}

/// Rebuild a CA from its stored key and certificate.
pub fn load_ca(key_pem: &str, ca_cert_pem: String) -> Result<CaBundle, CertError> {
    let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CertError::Generation(e.to_string()))?;
    Ok(CaBundle {
        params: ca_params(DEFAULT_VALIDITY_DAYS),
        key_pair,
        ca_cert_pem,
    })
}

/// Generate a server certificate for `server_names`, signed by `ca`.
pub fn generate_server_cert(
    ca: &CaBundle,
    server_names: &[&str],
    validity_days: u32,
) -> Result<SignedPair, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::new(
        server_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    )
    .map_err(|e| CertError::Generation(e.to_string()))?;

    params
        .distinguished_name
        .push(DnType::CommonName, server_names.first().copied().unwrap_or("localhost"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, ORG_NAME);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    set_validity(&mut params, validity_days);

    let server_key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let server_cert = params
        .signed_by(&server_key, &issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SignedPair {
        cert_pem: server_cert.pem(),
        key_pem: server_key.serialize_pem(),
    })
}

/// Generate a client certificate with `common_name`, signed by `ca`.
pub fn generate_client_cert(
    ca: &CaBundle,
    common_name: &str,
    validity_days: u32,
) -> Result<SignedPair, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, ORG_NAME);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    set_validity(&mut params, validity_days);

    let client_key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let client_cert = params
        .signed_by(&client_key, &issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SignedPair {
        cert_pem: client_cert.pem(),
        key_pem: client_key.serialize_pem(),
    })
}
