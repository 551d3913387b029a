//! Worker lifecycle tracking.
//!
//! Each build gets at most one live worker per action, so a build can be run
//! and debugged at the same time. A second start of the same action on the
//! same build is refused and also kills the worker already running it, whose
//! outcome is then reported as `BuildInvokedTwice`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::BuilderError;

struct Worker {
    id: Uuid,
    kill: Arc<Notify>,
    poisoned: bool,
}

/// Build number and action a worker serves.
type WorkerKey = (u64, String);

/// Live workers keyed by build number and action.
#[derive(Default)]
pub struct WorkerSupervisor {
    workers: Mutex<HashMap<WorkerKey, Worker>>,
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<WorkerKey, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker running `action` for `build_number`.
    pub fn start(&self, build_number: u64, action: &str) -> Result<WorkerLease<'_>, BuilderError> {
        let key = (build_number, action.to_string());
        let mut workers = self.workers();
        if let Some(existing) = workers.get_mut(&key) {
            existing.poisoned = true;
            existing.kill.notify_one();
            warn!(
                build_number,
                worker_id = %existing.id,
                action,
                "Duplicate start for a running build, killing its worker"
            );
            return Err(BuilderError::InvokedTwice { build_number });
        }

        let id = Uuid::new_v4();
        let kill = Arc::new(Notify::new());
        workers.insert(
            key.clone(),
            Worker {
                id,
                kill: Arc::clone(&kill),
                poisoned: false,
            },
        );
        debug!(build_number, worker_id = %id, action, "Worker started");
        Ok(WorkerLease {
            supervisor: self,
            key,
            id,
            kill,
        })
    }

    /// Number of live workers.
    pub fn active(&self) -> usize {
        self.workers().len()
    }
}

/// A running worker's registration. Dropping it ends the worker's lifetime.
pub struct WorkerLease<'a> {
    supervisor: &'a WorkerSupervisor,
    key: WorkerKey,
    id: Uuid,
    kill: Arc<Notify>,
}

impl WorkerLease<'_> {
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Resolves once the supervisor decided this worker must die.
    pub async fn killed(&self) {
        self.kill.notified().await;
    }

    /// Whether a duplicate start was seen while this worker ran.
    pub fn is_poisoned(&self) -> bool {
        self.supervisor
            .workers()
            .get(&self.key)
            .is_some_and(|w| w.id == self.id && w.poisoned)
    }

    /// Fold a duplicate start into the worker's outcome.
    pub fn check<T>(&self, outcome: Result<T, BuilderError>) -> Result<T, BuilderError> {
        if self.is_poisoned() {
            return Err(BuilderError::InvokedTwice {
                build_number: self.key.0,
            });
        }
        outcome
    }
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        let mut workers = self.supervisor.workers();
        if workers.get(&self.key).is_some_and(|w| w.id == self.id) {
            workers.remove(&self.key);
        }
    }
}
