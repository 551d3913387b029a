//! Build lifecycle owner.
//!
//! The manager accepts uploads, extracts them, and runs at most one build at
//! a time. Everything else waits in a bounded FIFO. The serializable records
//! and the builders serving them live in separate tables keyed by build
//! number.
//!
//! Queue capacity is checked before any disk I/O. An admitted submission
//! holds a reservation until it is either queued, started or failed, so
//! concurrent uploads can never overfill the queue.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use remotebuild_core::{BuildRecord, BuildStatus, Localizer, ServerConf, StatusUpdate};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::metrics::{Metrics, MetricsSnapshot};
use super::queue::BuildQueue;
use super::request::BuildRequest;
use crate::builder::{ActionParams, Builder, BuilderError, DeviceAction, process::BUILD_LOG};
use crate::extract::{ExtractError, extract_upload};
use crate::redirect::{RedirectError, RequestRedirector};

/// Progress updates buffered per running build.
const PROGRESS_BUFFER: usize = 32;

/// Errors reported to callers of the manager.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Build queue is full ({queued} waiting)")]
    QueueFull { queued: usize },

    #[error(transparent)]
    Unroutable(#[from] RedirectError),

    #[error("Invalid build submission: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Build number {0} is already in use")]
    BuildNumberInUse(u64),

    #[error("Build {0} not found")]
    NotFound(u64),

    #[error("Build {0} has no builder attached")]
    Malformed(u64),

    #[error("Build {build_number} has not completed (status {status})")]
    NotComplete { build_number: u64, status: BuildStatus },

    #[error("Emulation is disabled on this server")]
    EmulateDisabled,

    #[error("Failed to store upload for build {build_number}: {reason}")]
    Upload { build_number: u64, reason: String },

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Transition(#[from] remotebuild_core::Error),
}

impl BuildError {
    /// Localisable message id and arguments.
    pub fn message(&self) -> (&'static str, Vec<String>) {
        match self {
            Self::QueueFull { queued } => ("BuildQueueFull", vec![queued.to_string()]),
            Self::Unroutable(e) => e.message(),
            Self::Invalid(errors) => ("InvalidBuildSubmission400", vec![errors.join("; ")]),
            Self::BuildNumberInUse(_) => ("InvalidBuildSubmission400", vec![self.to_string()]),
            Self::NotFound(n) => ("BuildNotFound", vec![n.to_string()]),
            Self::Malformed(n) => ("MalformedBuildInfo", vec![n.to_string()]),
            Self::NotComplete { build_number, .. } => {
                ("BuildNotComplete", vec![build_number.to_string()])
            }
            Self::EmulateDisabled => ("EmulateDisabled", Vec::new()),
            Self::Upload {
                build_number,
                reason,
            } => ("ErrorUploading", vec![build_number.to_string(), reason.clone()]),
            Self::Builder(e) => e.message(),
            Self::Transition(e) => ("InternalServerError", vec![e.to_string()]),
        }
    }
}

/// Snapshot of every known build.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildsOverview {
    pub metrics: MetricsSnapshot,
    pub queued: usize,
    pub current_build: Option<BuildRecord>,
    pub queued_builds: Vec<BuildRecord>,
    pub all_builds: Vec<BuildRecord>,
}

/// Manager settings taken from [`ServerConf`].
#[derive(Debug, Clone)]
pub struct ManagerConf {
    pub builds_dir: PathBuf,
    pub max_builds_in_queue: usize,
    pub allows_emulate: bool,
    pub delete_builds_on_shutdown: bool,
    pub lang: String,
}

impl From<&ServerConf> for ManagerConf {
    fn from(conf: &ServerConf) -> Self {
        Self {
            builds_dir: conf.builds_dir(),
            max_builds_in_queue: conf.max_builds_in_queue,
            allows_emulate: conf.allows_emulate,
            delete_builds_on_shutdown: conf.delete_builds_on_shutdown,
            lang: conf.lang.clone(),
        }
    }
}

struct State {
    builds: BTreeMap<u64, BuildRecord>,
    builders: HashMap<u64, Arc<dyn Builder>>,
    queue: BuildQueue,
    current: Option<u64>,
    /// Admitted submissions not yet queued, started or failed.
    pending: usize,
}

/// Owns every build record and the single build slot.
pub struct BuildManager {
    conf: ManagerConf,
    redirector: RequestRedirector,
    localizer: Arc<dyn Localizer>,
    metrics: Metrics,
    next_build_number: AtomicU64,
    state: Mutex<State>,
}

/// A submission's claim on queue space.
struct Admission {
    manager: Arc<BuildManager>,
    held: bool,
}

impl Admission {
    fn redeem(mut self, state: &mut State) {
        state.pending = state.pending.saturating_sub(1);
        self.held = false;
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.held {
            let mut state = self.manager.state();
            state.pending = state.pending.saturating_sub(1);
        }
    }
}

impl BuildManager {
    pub fn new(
        conf: ManagerConf,
        redirector: RequestRedirector,
        localizer: Arc<dyn Localizer>,
    ) -> Arc<Self> {
        let queue = BuildQueue::new(conf.max_builds_in_queue);
        Arc::new(Self {
            conf,
            redirector,
            localizer,
            metrics: Metrics::default(),
            // Seeded from the pid so restarts over a shared directory rarely collide.
            next_build_number: AtomicU64::new(u64::from(std::process::id())),
            state: Mutex::new(State {
                builds: BTreeMap::new(),
                builders: HashMap::new(),
                queue,
                current: None,
                pending: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn conf(&self) -> &ManagerConf {
        &self.conf
    }

    pub const fn redirector(&self) -> &RequestRedirector {
        &self.redirector
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Count a submission whose parameters could not be parsed. It never
    /// reaches admission, so it is rejected on arrival.
    pub fn reject_malformed(&self, errors: &[String]) {
        self.metrics.submitted();
        self.metrics.rejected();
        info!(?errors, "Malformed build submission");
    }

    /// Accept an upload. Returns once the archive is on disk; extraction and
    /// the build continue in the background.
    pub async fn submit<R>(
        self: &Arc<Self>,
        request: BuildRequest,
        mut body: R,
    ) -> Result<BuildRecord, BuildError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.metrics.submitted();
        let admission = self.admit()?;

        let builder = match self.redirector.select_builder(&request) {
            Ok(builder) => builder,
            Err(e) => {
                if e.is_client_error() {
                    self.metrics.rejected();
                } else {
                    self.metrics.failed();
                }
                warn!(platform = %request.platform, error = %e, "Unroutable build request");
                return Err(e.into());
            }
        };
        if let Err(errors) = builder.validate(&request) {
            self.metrics.rejected();
            info!(platform = %request.platform, ?errors, "Build request failed validation");
            return Err(BuildError::Invalid(errors));
        }

        let record = self.register(&request, &builder)?;
        let build_number = record.build_number;
        self.metrics.accepted();
        info!(build_number, platform = %record.build_platform, "Build accepted");

        if let Err(e) = store_upload(&record, &mut body).await {
            let reason = e.to_string();
            self.fail(
                build_number,
                StatusUpdate::new(BuildStatus::Error)
                    .with_message("ErrorUploading", vec![build_number.to_string(), reason.clone()]),
            );
            error!(build_number, error = %reason, "Failed to store upload");
            return Err(BuildError::Upload {
                build_number,
                reason,
            });
        }

        let uploaded = {
            let mut state = self.state();
            let record = state
                .builds
                .get_mut(&build_number)
                .ok_or(BuildError::NotFound(build_number))?;
            record.update_status(BuildStatus::Uploaded, None, Vec::new())?;
            record.clone()
        };
        debug!(build_number, archive = %uploaded.archive_path.display(), "Upload saved");

        let manager = Arc::clone(self);
        let archive = uploaded.archive_path.clone();
        let (source, app_dir, platform) = (
            uploaded.archive_path.clone(),
            uploaded.app_dir.clone(),
            uploaded.build_platform.clone(),
        );
        tokio::spawn(async move {
            let extracted = tokio::task::spawn_blocking(move || {
                extract_upload(&source, &app_dir, &platform)
            })
            .await
            .unwrap_or_else(|e| {
                Err(ExtractError {
                    archive,
                    reasons: vec![e.to_string()],
                })
            });
            manager.extracted(build_number, extracted, admission);
        });

        Ok(self.localized(uploaded))
    }

    /// Reserve queue space or refuse the submission.
    fn admit(self: &Arc<Self>) -> Result<Admission, BuildError> {
        let mut state = self.state();
        if !state.queue.has_room(state.pending, state.current.is_none()) {
            self.metrics.rejected();
            let queued = state.queue.len();
            warn!(queued, pending = state.pending, "Build queue full, rejecting submission");
            return Err(BuildError::QueueFull { queued });
        }
        state.pending += 1;
        Ok(Admission {
            manager: Arc::clone(self),
            held: true,
        })
    }

    /// Allocate a build number and record for an accepted request.
    fn register(
        &self,
        request: &BuildRequest,
        builder: &Arc<dyn Builder>,
    ) -> Result<BuildRecord, BuildError> {
        let mut state = self.state();
        let build_number = match request.build_number {
            Some(n) if state.builds.contains_key(&n) => {
                self.metrics.rejected();
                return Err(BuildError::BuildNumberInUse(n));
            }
            Some(n) => {
                self.next_build_number.fetch_max(n, Ordering::SeqCst);
                n
            }
            None => loop {
                let n = self.next_build_number.fetch_add(1, Ordering::SeqCst) + 1;
                if !state.builds.contains_key(&n) {
                    break n;
                }
            },
        };

        let mut record = BuildRecord::new(
            build_number,
            self.conf.builds_dir.join(build_number.to_string()),
        );
        record.build_command.clone_from(&request.command);
        record.configuration.clone_from(&request.configuration);
        record.options.clone_from(&request.options);
        record.build_platform.clone_from(&request.platform);
        record.build_lang.clone_from(&request.language);
        record.log_level = request.log_level;
        record.params.clone_from(&request.params);

        state.builds.insert(build_number, record.clone());
        state.builders.insert(build_number, Arc::clone(builder));
        Ok(record)
    }

    /// Continue after extraction finished.
    fn extracted(
        self: &Arc<Self>,
        build_number: u64,
        result: Result<Option<remotebuild_core::ChangeList>, ExtractError>,
        admission: Admission,
    ) {
        let change_list = match result {
            Ok(change_list) => change_list,
            Err(e) => {
                let (id, args) = e.message();
                error!(build_number, error = %e, "Extraction failed");
                drop(admission);
                self.fail(build_number, StatusUpdate::new(BuildStatus::Error).with_message(id, args));
                return;
            }
        };

        let mut state = self.state();
        admission.redeem(&mut state);
        let Some(record) = state.builds.get_mut(&build_number) else {
            return;
        };
        record.change_list = change_list;
        if let Err(e) = record.update_status(BuildStatus::Extracted, None, Vec::new()) {
            warn!(build_number, error = %e, "Unexpected status after extraction");
            return;
        }
        self.enqueue_or_run(&mut state, build_number);
    }

    /// Start `build_number` if the slot is free, otherwise queue it.
    fn enqueue_or_run(self: &Arc<Self>, state: &mut State, build_number: u64) {
        if let Some(current) = state.current {
            if state.queue.push(build_number).is_err() {
                // Admission reservations keep this from happening.
                error!(build_number, "Build queue overflow");
                let queued = state.queue.len().to_string();
                self.fail_locked(
                    state,
                    build_number,
                    StatusUpdate::new(BuildStatus::Error).with_message("BuildQueueFull", vec![queued]),
                );
                return;
            }
            info!(
                build_number,
                current,
                position = state.queue.len(),
                "Build queued"
            );
            return;
        }
        self.start(state, build_number);
        self.start_next(state);
    }

    /// Fill the free slot from the queue head.
    fn start_next(self: &Arc<Self>, state: &mut State) {
        while state.current.is_none() {
            let Some(next) = state.queue.pop() else {
                return;
            };
            self.start(state, next);
        }
    }

    fn start(self: &Arc<Self>, state: &mut State, build_number: u64) {
        let Some(builder) = state.builders.get(&build_number).cloned() else {
            self.fail_locked(
                state,
                build_number,
                StatusUpdate::new(BuildStatus::Error)
                    .with_message("MalformedBuildInfo", vec![build_number.to_string()]),
            );
            return;
        };
        let Some(record) = state.builds.get_mut(&build_number) else {
            return;
        };
        if let Err(e) = record.update_status(BuildStatus::Building, None, Vec::new()) {
            warn!(build_number, error = %e, "Cannot start build");
            return;
        }
        let record = record.clone();
        state.current = Some(build_number);
        info!(build_number, builder = builder.name(), "Build started");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = manager.run_build(builder, record).await;
            manager.finish(build_number, outcome);
        });
    }

    async fn run_build(
        &self,
        builder: Arc<dyn Builder>,
        record: BuildRecord,
    ) -> Result<StatusUpdate, BuilderError> {
        let build_number = record.build_number;
        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let mut build = tokio::spawn(async move { builder.build(record, tx).await });
        loop {
            tokio::select! {
                joined = &mut build => {
                    return joined.unwrap_or_else(|e| {
                        Err(BuilderError::Protocol(format!("builder task failed: {e}")))
                    });
                }
                Some(update) = rx.recv() => self.progress(build_number, update),
            }
        }
    }

    fn progress(&self, build_number: u64, update: StatusUpdate) {
        if update.status != BuildStatus::Building {
            return;
        }
        let mut state = self.state();
        if let Some(record) = state.builds.get_mut(&build_number)
            && let Err(e) = record.apply(update)
        {
            debug!(build_number, error = %e, "Ignoring progress update");
        }
    }

    /// Record the outcome of a build and hand the slot to the next one.
    fn finish(self: &Arc<Self>, build_number: u64, outcome: Result<StatusUpdate, BuilderError>) {
        let update = match outcome {
            Ok(update)
                if matches!(
                    update.status,
                    BuildStatus::Complete | BuildStatus::Invalid | BuildStatus::Error
                ) =>
            {
                update
            }
            Ok(update) => StatusUpdate::new(BuildStatus::Error).with_message(
                "BuildFailedWithError",
                vec![format!("unexpected build outcome {}", update.status)],
            ),
            Err(e) => {
                let (id, args) = e.message();
                StatusUpdate::new(BuildStatus::Error).with_message(id, args)
            }
        };

        let mut state = self.state();
        if state.current == Some(build_number) {
            state.current = None;
        }
        if let Some(record) = state.builds.get_mut(&build_number) {
            if let Err(e) = record.apply(update) {
                warn!(build_number, error = %e, "Builder reported an impossible outcome");
                if let Err(mark) = record.update_status(
                    BuildStatus::Error,
                    Some("BuildFailedWithError".to_string()),
                    vec![e.to_string()],
                ) {
                    // Already settled and counted elsewhere.
                    warn!(
                        build_number,
                        status = %record.status,
                        error = %mark,
                        "Cannot mark build as failed"
                    );
                    self.start_next(&mut state);
                    return;
                }
            }
            match record.status {
                BuildStatus::Complete => {
                    record.build_successful = true;
                    self.metrics.succeeded();
                }
                BuildStatus::Invalid => self.metrics.rejected(),
                _ => self.metrics.failed(),
            }
            info!(build_number, status = %record.status, "Build finished");
        }
        self.start_next(&mut state);
    }

    fn fail(&self, build_number: u64, update: StatusUpdate) {
        let mut state = self.state();
        self.fail_locked(&mut state, build_number, update);
    }

    /// Move a record to `Error` and count it once.
    fn fail_locked(&self, state: &mut State, build_number: u64, update: StatusUpdate) {
        if let Some(record) = state.builds.get_mut(&build_number)
            && let Err(e) = record.apply(update)
        {
            warn!(build_number, error = %e, "Cannot mark build as failed");
            return;
        }
        self.metrics.failed();
    }

    fn localized(&self, mut record: BuildRecord) -> BuildRecord {
        record.localize(&self.conf.lang, self.localizer.as_ref());
        record
    }

    /// Record for `build_number`, messages resolved.
    pub fn get_build_info(&self, build_number: u64) -> Option<BuildRecord> {
        let record = self.state().builds.get(&build_number).cloned()?;
        Some(self.localized(record))
    }

    /// Every record plus queue state and metrics.
    pub fn get_all_build_info(&self) -> BuildsOverview {
        let state = self.state();
        let lookup = |n: &u64| state.builds.get(n).cloned().map(|r| self.localized(r));
        let queued_builds = state.queue.iter().filter_map(|n| lookup(&n)).collect();
        BuildsOverview {
            metrics: self.metrics.snapshot(),
            queued: state.queue.len(),
            current_build: state.current.as_ref().and_then(lookup),
            queued_builds,
            all_builds: state
                .builds
                .values()
                .cloned()
                .map(|r| self.localized(r))
                .collect(),
        }
    }

    /// Bytes of the build log from `offset`. Unknown builds and missing logs
    /// read as empty.
    pub async fn download_build_log(&self, build_number: u64, offset: u64) -> Vec<u8> {
        let Some(build_dir) = self
            .state()
            .builds
            .get(&build_number)
            .map(|r| r.build_dir.clone())
        else {
            return Vec::new();
        };
        read_from(&build_dir.join(BUILD_LOG), offset)
            .await
            .unwrap_or_else(|e| {
                debug!(build_number, error = %e, "Build log unavailable");
                Vec::new()
            })
    }

    /// Record and builder for a finished build.
    fn finished_build(
        &self,
        build_number: u64,
    ) -> Result<(BuildRecord, Arc<dyn Builder>), BuildError> {
        let state = self.state();
        let record = state
            .builds
            .get(&build_number)
            .ok_or(BuildError::NotFound(build_number))?;
        let builder = state
            .builders
            .get(&build_number)
            .ok_or(BuildError::Malformed(build_number))?;
        if !record.status.has_artifact() {
            return Err(BuildError::NotComplete {
                build_number,
                status: record.status,
            });
        }
        Ok((record.clone(), Arc::clone(builder)))
    }

    /// Path of the artifact to send. Marks the build `Downloaded`.
    pub async fn download_build(&self, build_number: u64) -> Result<PathBuf, BuildError> {
        let (record, builder) = self.finished_build(build_number)?;
        let path = builder.download(&record).await?;

        let mut state = self.state();
        if let Some(record) = state.builds.get_mut(&build_number) {
            record.update_status(BuildStatus::Downloaded, None, Vec::new())?;
        }
        self.metrics.downloaded();
        info!(build_number, artifact = %path.display(), "Build downloaded");
        Ok(path)
    }

    /// Emulate, deploy, run or debug a finished build.
    pub async fn device_action(
        &self,
        build_number: u64,
        action: DeviceAction,
        params: &ActionParams,
    ) -> Result<BuildRecord, BuildError> {
        if action == DeviceAction::Emulate && !self.conf.allows_emulate {
            return Err(BuildError::EmulateDisabled);
        }
        let (record, builder) = self.finished_build(build_number)?;
        info!(build_number, %action, "Device action requested");
        let update = builder.device_action(action, &record, params).await?;

        let mut state = self.state();
        let record = state
            .builds
            .get_mut(&build_number)
            .ok_or(BuildError::NotFound(build_number))?;
        record.apply(update)?;
        let record = record.clone();
        drop(state);
        Ok(self.localized(record))
    }

    /// Remove build directories when configured to.
    pub async fn shutdown(&self) {
        if !self.conf.delete_builds_on_shutdown {
            return;
        }
        match tokio::fs::remove_dir_all(&self.conf.builds_dir).await {
            Ok(()) => info!(dir = %self.conf.builds_dir.display(), "Removed build directories"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.conf.builds_dir.display(), error = %e, "Failed to remove builds"),
        }
    }
}

/// Stream the request body into the record's archive path.
async fn store_upload<R>(record: &BuildRecord, body: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    tokio::fs::create_dir_all(&record.build_dir).await?;
    let mut file = tokio::fs::File::create(&record.archive_path).await?;
    let written = tokio::io::copy(body, &mut file).await?;
    file.flush().await?;
    Ok(written)
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}
