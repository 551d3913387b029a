//! remotebuild server library
//!
//! Core functionality for the build server:
//! - Build submission, queueing and metrics
//! - Upload extraction
//! - Platform/version routing to out-of-process builders
//! - HTTP API and the client-certificate TLS listener

pub mod api;
pub mod build;
pub mod builder;
pub mod extract;
pub mod purge;
pub mod redirect;
pub mod tls;
