//! Build submission, queueing and bookkeeping.

pub mod manager;
pub mod metrics;
pub mod queue;
pub mod request;

pub use manager::{BuildError, BuildManager, BuildsOverview, ManagerConf};
pub use metrics::{Metrics, MetricsSnapshot};
pub use queue::BuildQueue;
pub use request::BuildRequest;
