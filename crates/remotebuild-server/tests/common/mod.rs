//! Shared fixtures: an in-process builder and real upload tarballs.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::sync::{Semaphore, mpsc};

use remotebuild_core::config::ModuleConf;
use remotebuild_core::{BuildRecord, BuildStatus, DefaultMessages, StatusUpdate};
use remotebuild_server::build::{BuildManager, BuildRequest, ManagerConf};
use remotebuild_server::builder::{ActionParams, Builder, BuilderError, BuilderFactory, DeviceAction};
use remotebuild_server::redirect::RequestRedirector;

/// Artifact the fake builder writes, relative to the app dir.
pub const ARTIFACT: &str = "bin/app.ipa";

/// Builder that runs in-process. Builds block until the test hands out a
/// permit on `gate`. Request params steer the outcome: `fail` ends in
/// `Error`, `invalid` in `Invalid`, `reject` fails validation.
pub struct FakeBuilder {
    pub gate: Semaphore,
    pub started: Mutex<Vec<u64>>,
    building: AtomicUsize,
    pub max_building: AtomicUsize,
}

impl FakeBuilder {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            started: Mutex::new(Vec::new()),
            building: AtomicUsize::new(0),
            max_building: AtomicUsize::new(0),
        })
    }

    pub fn started(&self) -> Vec<u64> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    fn name(&self) -> &str {
        "fake"
    }

    fn validate(&self, request: &BuildRequest) -> Result<(), Vec<String>> {
        if request.params.contains_key("reject") {
            return Err(vec!["rejected by builder".to_string()]);
        }
        Ok(())
    }

    async fn build(
        &self,
        record: BuildRecord,
        progress: mpsc::Sender<StatusUpdate>,
    ) -> Result<StatusUpdate, BuilderError> {
        let now = self.building.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_building.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(record.build_number);
        let _ = progress
            .send(StatusUpdate::new(BuildStatus::Building).with_message("Compiling", Vec::new()))
            .await;

        self.gate.acquire().await.expect("gate closed").forget();
        self.building.fetch_sub(1, Ordering::SeqCst);

        if !record.app_dir.join("config.xml").is_file() {
            return Err(BuilderError::Protocol("app was not extracted".to_string()));
        }
        if record.params.contains_key("fail") {
            return Err(BuilderError::Protocol("toolchain exploded".to_string()));
        }
        if record.params.contains_key("invalid") {
            return Ok(StatusUpdate::new(BuildStatus::Invalid));
        }
        let artifact = record.app_dir.join(ARTIFACT);
        tokio::fs::create_dir_all(artifact.parent().unwrap()).await?;
        tokio::fs::write(&artifact, b"ipa").await?;
        Ok(StatusUpdate {
            artifact_path: Some(ARTIFACT.into()),
            ..StatusUpdate::new(BuildStatus::Complete)
        })
    }

    async fn device_action(
        &self,
        action: DeviceAction,
        _record: &BuildRecord,
        _params: &ActionParams,
    ) -> Result<StatusUpdate, BuilderError> {
        let status = match action {
            DeviceAction::Emulate => BuildStatus::Emulated,
            DeviceAction::Deploy => BuildStatus::Installed,
            DeviceAction::Run => BuildStatus::Running,
            DeviceAction::Debug => BuildStatus::Debugging,
        };
        Ok(StatusUpdate::new(status))
    }
}

struct FakeFactory(Arc<FakeBuilder>);

impl BuilderFactory for FakeFactory {
    fn create(&self, _name: &str, _module: &ModuleConf) -> Result<Arc<dyn Builder>, BuilderError> {
        Ok(Arc::clone(&self.0) as Arc<dyn Builder>)
    }
}

pub fn manager_conf(root: &Path, max_builds_in_queue: usize) -> ManagerConf {
    ManagerConf {
        builds_dir: root.join("remotebuild").join("builds"),
        max_builds_in_queue,
        allows_emulate: true,
        delete_builds_on_shutdown: true,
        lang: "en".to_string(),
    }
}

/// Manager with one `ios` module served by `builder`.
pub fn manager(conf: ManagerConf, builder: &Arc<FakeBuilder>) -> Arc<BuildManager> {
    let mut modules = BTreeMap::new();
    modules.insert(
        "ios".to_string(),
        ModuleConf {
            kind: "fake".to_string(),
            ..ModuleConf::process("cordova")
        },
    );
    let redirector = RequestRedirector::new(&modules)
        .unwrap()
        .with_factory("fake", Arc::new(FakeFactory(Arc::clone(builder))));
    BuildManager::new(conf, redirector, Arc::new(DefaultMessages))
}

/// A gzip tarball shaped like a client upload.
pub fn upload() -> Vec<u8> {
    tarball(&[
        ("app/config.xml", "<widget id=\"io.example\"/>"),
        ("app/www/index.html", "<html/>"),
        ("app/plugins/cordova-plugin-device/plugin.xml", "<plugin/>"),
    ])
}

pub fn tarball(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn request(params: &[&str]) -> BuildRequest {
    BuildRequest {
        params: params
            .iter()
            .map(|k| ((*k).to_string(), "1".to_string()))
            .collect(),
        ..BuildRequest::default()
    }
}

/// Poll until build `n` satisfies `done`.
pub async fn wait_for(
    manager: &BuildManager,
    n: u64,
    done: impl Fn(BuildStatus) -> bool,
) -> BuildRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(record) = manager.get_build_info(n)
                && done(record.status)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("build {n} never reached the expected state"))
}

pub async fn wait_finished(manager: &BuildManager, n: u64) -> BuildRecord {
    wait_for(manager, n, BuildStatus::is_finished).await
}
