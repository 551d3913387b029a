//! Platform builders.
//!
//! A builder is the capability object the redirector hands back for a
//! request: it validates submissions, turns an extracted app into an
//! artifact, and drives the device actions on a finished build. The manager
//! keeps builders in a side table next to the serializable records.

pub mod process;
pub mod supervisor;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use remotebuild_core::config::ModuleConf;
use remotebuild_core::{BuildRecord, StatusUpdate};
use tokio::sync::mpsc;

use crate::build::BuildRequest;

pub use process::{ProcessBuilder, ProcessBuilderFactory};
pub use supervisor::{WorkerLease, WorkerSupervisor};

/// Free-form parameters of a device action (`target`, `device`, ...).
pub type ActionParams = BTreeMap<String, String>;

/// What to do with a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAction {
    Emulate,
    Deploy,
    Run,
    Debug,
}

impl DeviceAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Emulate => "emulate",
            Self::Deploy => "deploy",
            Self::Run => "run",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by builders.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Build {build_number} was started twice on the same worker")]
    InvokedTwice { build_number: u64 },

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Worker exited ({exit}) without reporting an outcome")]
    NoOutcome { exit: String },

    #[error("No artifact available for build {0}")]
    NoArtifact(u64),

    #[error("Builder {module} cannot be created: {reason}")]
    Create { module: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuilderError {
    /// Localisable message id and arguments.
    pub fn message(&self) -> (&'static str, Vec<String>) {
        match self {
            Self::InvokedTwice { build_number } => {
                ("BuildInvokedTwice", vec![build_number.to_string()])
            }
            Self::Create { module, reason } => {
                ("BuilderLoadFailed", vec![module.clone(), reason.clone()])
            }
            other => ("BuildFailedWithError", vec![other.to_string()]),
        }
    }
}

/// Capability set of a platform builder.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Name of the module this builder was created for.
    fn name(&self) -> &str;

    /// Reject submissions this builder cannot service. The messages are
    /// shown to the client.
    fn validate(&self, request: &BuildRequest) -> Result<(), Vec<String>> {
        let _ = request;
        Ok(())
    }

    /// Build `record`. Progress may be reported on `progress`; the returned
    /// update is the outcome and must be `Complete`, `Invalid` or `Error`.
    async fn build(
        &self,
        record: BuildRecord,
        progress: mpsc::Sender<StatusUpdate>,
    ) -> Result<StatusUpdate, BuilderError>;

    /// Emulate, deploy, run or debug a finished build.
    async fn device_action(
        &self,
        action: DeviceAction,
        record: &BuildRecord,
        params: &ActionParams,
    ) -> Result<StatusUpdate, BuilderError>;

    /// Path of the artifact to send to the client.
    async fn download(&self, record: &BuildRecord) -> Result<PathBuf, BuilderError> {
        record
            .artifact_path
            .as_ref()
            .map(|p| record.app_dir.join(p))
            .filter(|p| p.is_file())
            .ok_or(BuilderError::NoArtifact(record.build_number))
    }
}

/// Creates builders for one module `kind`.
pub trait BuilderFactory: Send + Sync {
    fn create(&self, name: &str, module: &ModuleConf) -> Result<Arc<dyn Builder>, BuilderError>;
}
