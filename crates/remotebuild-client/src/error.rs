use remotebuild_certs::CertError;
use thiserror::Error;

/// Errors from storing or using a client certificate.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// No certificate store exists for this operating system.
    #[error("Unsupported host platform: {0}")]
    UnsupportedHostPlatform(&'static str),

    #[error("Cannot determine the home directory")]
    NoHomeDirectory,

    /// Nothing was saved for this host yet.
    #[error("No client certificate saved for {host}")]
    CertificateNotFound { host: String },

    /// The bundle could not be opened.
    #[error(transparent)]
    Bundle(#[from] CertError),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
