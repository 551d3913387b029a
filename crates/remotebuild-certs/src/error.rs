//! Certificate error types.

use thiserror::Error;

/// Errors from certificate generation, storage and PIN redemption.
#[derive(Debug, Error)]
pub enum CertError {
    /// An error occurred during certificate generation or signing.
    #[error("Certificate generation error: {0}")]
    Generation(String),

    /// CA or server certificate files are absent.
    #[error("Server certificates have not been generated")]
    ServerCertsMissing,

    /// No bundle was issued under this PIN.
    #[error("PIN {0} is not valid")]
    PinNotFound(u32),

    /// The bundle exists but the PIN timed out.
    #[error("PIN {0} has expired")]
    PinExpired(u32),

    /// Every PIN attempt collided with a pending one.
    #[error("Unable to allocate a free PIN")]
    PinSpaceExhausted,

    /// Sealing or opening a client bundle failed.
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
