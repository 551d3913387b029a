//! remotebuild client library
//!
//! Client side of the PIN pairing:
//! - Per-platform storage of the sealed certificate bundle
//! - TLS client configuration for talking to a secure build server

pub mod error;
pub mod security;
pub mod store;

pub use error::SecurityError;
pub use security::{ConnectionInfo, ConnectionSecurity};
pub use store::BundleStore;
