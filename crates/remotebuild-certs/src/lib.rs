//! Certificate authority and PIN-based client certificate issuance.
//!
//! The server owns a self-signed CA on disk. The CA signs one server
//! certificate and any number of short-lived client certificates, each handed
//! out exactly once against a six-digit PIN as a password-sealed bundle.

pub mod authority;
pub mod bundle;
pub mod error;
pub mod metadata;
pub mod store;

pub use bundle::ClientBundle;
pub use error::CertError;
pub use store::{CertificateStore, ConfirmationHandler, ServerCertPem, ServerCerts};
