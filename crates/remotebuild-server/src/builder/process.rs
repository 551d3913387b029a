//! Out-of-process builder.
//!
//! Every action spawns `<command> [args..] <action>` in the build directory.
//! The worker receives one JSON line on stdin:
//!
//! ```json
//! {"action":"build","buildInfo":{...},"params":{...}}
//! ```
//!
//! and answers with JSON status lines on stdout. The last status line is the
//! outcome; `Building` lines seen before it are forwarded as progress. Any
//! other output, stderr included, is appended to `<buildDir>/build.log`.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use remotebuild_core::config::ModuleConf;
use remotebuild_core::{BuildRecord, BuildStatus, StatusUpdate};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ActionParams, Builder, BuilderError, BuilderFactory, DeviceAction, WorkerSupervisor};
use crate::build::BuildRequest;

/// Log file every worker appends to, relative to the build directory.
pub const BUILD_LOG: &str = "build.log";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRequest<'a> {
    action: &'a str,
    build_info: &'a BuildRecord,
    params: &'a ActionParams,
}

/// Builder backed by an external worker executable.
pub struct ProcessBuilder {
    name: String,
    platform: String,
    command: PathBuf,
    args: Vec<String>,
    supervisor: WorkerSupervisor,
}

impl ProcessBuilder {
    pub fn new(
        name: impl Into<String>,
        platform: impl Into<String>,
        command: impl Into<PathBuf>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            command: command.into(),
            args,
            supervisor: WorkerSupervisor::new(),
        }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    async fn open_log(record: &BuildRecord) -> Result<File, BuilderError> {
        tokio::fs::create_dir_all(&record.build_dir).await?;
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(record.build_dir.join(BUILD_LOG))
            .await?)
    }

    async fn invoke(
        &self,
        action: &str,
        record: &BuildRecord,
        params: &ActionParams,
        progress: Option<&mpsc::Sender<StatusUpdate>>,
    ) -> Result<StatusUpdate, BuilderError> {
        let lease = self.supervisor.start(record.build_number, action)?;
        let mut log = Self::open_log(record).await?;
        log.write_all(format!("==> {action} (worker {})\n", lease.id()).as_bytes())
            .await?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(action)
            .current_dir(&record.build_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuilderError::SpawnFailed {
                reason: format!("{}: {e}", self.command.display()),
            })?;
        info!(
            build_number = record.build_number,
            worker_id = %lease.id(),
            action,
            command = %self.command.display(),
            "Spawned builder worker"
        );

        let request = serde_json::to_string(&WorkerRequest {
            action,
            build_info: record,
            params,
        })
        .map_err(|e| BuilderError::Protocol(e.to_string()))?;
        let mut stdin = child.stdin.take().ok_or_else(|| BuilderError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        // A worker may exit without reading its request.
        if let Err(e) = write_request(&mut stdin, &request).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e.into());
        }
        drop(stdin);

        let stderr_task = child.stderr.take().map(|stderr| {
            let log_path = record.build_dir.join(BUILD_LOG);
            let build_number = record.build_number;
            tokio::spawn(async move {
                let Ok(mut log) = OpenOptions::new().append(true).open(&log_path).await else {
                    return;
                };
                let mut stderr = BufReader::new(stderr);
                let mut buf = Vec::new();
                loop {
                    match next_line(&mut stderr, &mut buf).await {
                        Ok(Some(line)) => {
                            if log.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                                warn!(build_number, "Failed to append worker stderr to log");
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(build_number, error = %e, "Failed to read worker stderr");
                            break;
                        }
                    }
                }
            })
        });

        let pumped = tokio::select! {
            result = pump(&mut child, &mut log, progress) => Some(result),
            () = lease.killed() => None,
        };
        let Some(result) = pumped else {
            let _ = child.kill().await;
            return Err(BuilderError::InvokedTwice {
                build_number: record.build_number,
            });
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let (exit, last) = result?;
        debug!(build_number = record.build_number, %exit, "Builder worker exited");
        let outcome = last.ok_or_else(|| BuilderError::NoOutcome {
            exit: exit.to_string(),
        });
        lease.check(outcome)
    }
}

async fn write_request(
    stdin: &mut tokio::process::ChildStdin,
    request: &str,
) -> std::io::Result<()> {
    stdin.write_all(request.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Next line of worker output without its terminator. Toolchains print
/// whatever encoding they like, so invalid UTF-8 is replaced, not fatal.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Read worker stdout until it closes, then reap the worker.
async fn pump(
    child: &mut Child,
    log: &mut File,
    progress: Option<&mpsc::Sender<StatusUpdate>>,
) -> Result<(ExitStatus, Option<StatusUpdate>), BuilderError> {
    let stdout = child.stdout.take().ok_or_else(|| BuilderError::SpawnFailed {
        reason: "Failed to capture stdout".to_string(),
    })?;
    let mut stdout = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut last = None;
    while let Some(line) = next_line(&mut stdout, &mut buf).await? {
        match serde_json::from_str::<StatusUpdate>(&line) {
            Ok(update) => {
                if let Some(tx) = progress
                    && update.status == BuildStatus::Building
                {
                    let _ = tx.send(update.clone()).await;
                }
                last = Some(update);
            }
            Err(_) => {
                log.write_all(line.as_bytes()).await?;
                log.write_all(b"\n").await?;
            }
        }
    }
    log.flush().await?;
    Ok((child.wait().await?, last))
}

#[async_trait]
impl Builder for ProcessBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, request: &BuildRequest) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !request.platform.eq_ignore_ascii_case(&self.platform) {
            errors.push(format!(
                "builder {} serves {}, not {}",
                self.name, self.platform, request.platform
            ));
        }
        if request.command != "build" {
            errors.push(format!("unsupported command '{}'", request.command));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    async fn build(
        &self,
        record: BuildRecord,
        progress: mpsc::Sender<StatusUpdate>,
    ) -> Result<StatusUpdate, BuilderError> {
        self.invoke("build", &record, &record.params, Some(&progress))
            .await
    }

    async fn device_action(
        &self,
        action: DeviceAction,
        record: &BuildRecord,
        params: &ActionParams,
    ) -> Result<StatusUpdate, BuilderError> {
        self.invoke(action.as_str(), record, params, None).await
    }
}

/// Creates [`ProcessBuilder`]s from `kind = "process"` modules. A module
/// without `command` runs `remotebuild-<name>-worker` from `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessBuilderFactory;

impl BuilderFactory for ProcessBuilderFactory {
    fn create(&self, name: &str, module: &ModuleConf) -> Result<Arc<dyn Builder>, BuilderError> {
        let command = module
            .command
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("remotebuild-{name}-worker")));
        if command.is_absolute() && !command.is_file() {
            return Err(BuilderError::Create {
                module: name.to_string(),
                reason: format!("{} does not exist", command.display()),
            });
        }
        let platform = module.platform.clone().unwrap_or_else(|| name.to_string());
        Ok(Arc::new(ProcessBuilder::new(
            name,
            platform,
            command,
            module.args.clone(),
        )))
    }
}
