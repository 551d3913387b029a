//! `remotebuild` Core Library
//!
//! Shared functionality for `remotebuild` components:
//! - Server configuration resolution and hierarchy
//! - The serializable build record and its status state machine
//! - Localisable status messages
//! - Common error types

pub mod build_info;
pub mod config;
pub mod error;
pub mod messages;
pub mod tracing_init;

pub use build_info::{BuildRecord, BuildStatus, ChangeList, LogLevel, StatusUpdate};
pub use config::ServerConf;
pub use error::{Error, Result};
pub use messages::{DefaultMessages, Localizer};
