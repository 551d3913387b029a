//! Upload extraction.
//!
//! An upload is a gzip tarball with a single wrapper directory. It is
//! decompressed once and fanned out to two tar readers running side by side:
//!
//! - the app reader writes everything except `plugins/` into the app dir,
//! - the plugin reader writes top-level files and `plugins/**` into
//!   `<appDir>/remote`.
//!
//! The wrapper directory is stripped by both. Every extracted entry is made
//! `0777`. After both succeed the optional `changeList.json` is applied.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

use flate2::read::GzDecoder;
use remotebuild_core::ChangeList;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

/// Size of the chunks handed to both readers.
const CHUNK_SIZE: usize = 64 * 1024;
/// Chunks buffered per reader before the decompressor waits.
const CHANNEL_DEPTH: usize = 16;
/// Directory the plugin reader writes into, relative to the app dir.
pub const PLUGIN_DIR: &str = "remote";
/// Change list shipped inside the app tree.
pub const CHANGE_LIST_FILE: &str = "changeList.json";

/// Everything that went wrong extracting one archive.
#[derive(Debug, thiserror::Error)]
#[error("Failed to extract {}: {}", archive.display(), reasons.join("; "))]
pub struct ExtractError {
    pub archive: PathBuf,
    pub reasons: Vec<String>,
}

impl ExtractError {
    fn new(archive: &Path, reason: impl Into<String>) -> Self {
        Self {
            archive: archive.to_path_buf(),
            reasons: vec![reason.into()],
        }
    }

    /// Localisable message id and arguments.
    pub fn message(&self) -> (&'static str, Vec<String>) {
        (
            "ErrorExtracting",
            vec![self.archive.display().to_string(), self.reasons.join("; ")],
        )
    }
}

type Chunk = io::Result<Arc<[u8]>>;

/// `Read` over chunks fed by the decompressor thread.
struct ChannelReader {
    rx: Receiver<Chunk>,
    chunk: Arc<[u8]>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Chunk>) -> Self {
        Self {
            rx,
            chunk: Arc::from(Vec::new()),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                // Decompressor finished.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Which half of the upload a reader keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tree {
    App,
    Plugins,
}

impl Tree {
    const fn label(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Plugins => "plugins",
        }
    }

    /// Destination of `relative` (wrapper already stripped), if kept.
    fn keeps(self, relative: &Path, is_dir: bool) -> bool {
        let mut components = relative.components();
        let first = components.next();
        let in_plugins = first.is_some_and(|c| c.as_os_str() == "plugins");
        match self {
            Self::App => !in_plugins,
            Self::Plugins => in_plugins || (components.next().is_none() && !is_dir),
        }
    }
}

/// Drop the wrapper directory and refuse anything escaping the target.
fn strip_wrapper(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components().skip(1) {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

#[cfg(unix)]
fn open_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
}

#[cfg(not(unix))]
fn open_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn unpack_tree(reader: ChannelReader, tree: Tree, dest: &Path) -> Result<usize, String> {
    let fail = |e: io::Error| format!("{}: {e}", tree.label());
    fs::create_dir_all(dest).map_err(fail)?;
    let mut archive = Archive::new(reader);
    let mut written = 0;
    for entry in archive.entries().map_err(fail)? {
        let mut entry = entry.map_err(fail)?;
        let entry_type = entry.header().entry_type();
        let is_dir = match entry_type {
            EntryType::Directory => true,
            EntryType::Regular => false,
            other => {
                debug!(tree = tree.label(), ?other, "Skipping special archive entry");
                continue;
            }
        };
        let path = entry.path().map_err(fail)?.into_owned();
        let Some(relative) = strip_wrapper(&path) else {
            if path.components().count() > 1 {
                return Err(format!("{}: unsafe path {}", tree.label(), path.display()));
            }
            continue;
        };
        if !tree.keeps(&relative, is_dir) {
            continue;
        }

        let target = dest.join(&relative);
        if is_dir {
            fs::create_dir_all(&target).map_err(fail)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(fail)?;
            }
            entry.unpack(&target).map_err(fail)?;
        }
        open_permissions(&target).map_err(fail)?;
        written += 1;
    }
    Ok(written)
}

/// Decompress `archive` and send every chunk to all live readers.
fn decompress(archive: &Path, mut outputs: Vec<Option<SyncSender<Chunk>>>) -> Result<(), String> {
    let file = fs::File::open(archive).map_err(|e| format!("open: {e}"))?;
    let mut gz = GzDecoder::new(file);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match gz.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                for tx in outputs.iter().flatten() {
                    let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string())));
                }
                return Err(format!("decompress: {e}"));
            }
        };
        let chunk: Arc<[u8]> = Arc::from(&buf[..n]);
        for slot in &mut outputs {
            // A reader that stopped early no longer needs data.
            if slot.as_ref().is_some_and(|tx| tx.send(Ok(Arc::clone(&chunk))).is_err()) {
                *slot = None;
            }
        }
        if outputs.iter().all(Option::is_none) {
            return Ok(());
        }
    }
}

/// Extract `archive` into `app_dir` and `<app_dir>/remote`, then apply the
/// change list for `platform`. Blocking; run it off the async runtime.
pub fn extract_upload(
    archive: &Path,
    app_dir: &Path,
    platform: &str,
) -> Result<Option<ChangeList>, ExtractError> {
    if !archive.is_file() {
        return Err(ExtractError::new(archive, "archive not found"));
    }
    let plugin_dir = app_dir.join(PLUGIN_DIR);

    let (app_tx, app_rx) = sync_channel(CHANNEL_DEPTH);
    let (plugin_tx, plugin_rx) = sync_channel(CHANNEL_DEPTH);

    let (decompressed, app, plugins) = thread::scope(|scope| {
        let app = scope.spawn(|| unpack_tree(ChannelReader::new(app_rx), Tree::App, app_dir));
        let plugins = scope.spawn(|| {
            unpack_tree(ChannelReader::new(plugin_rx), Tree::Plugins, &plugin_dir)
        });
        let decompressed = decompress(archive, vec![Some(app_tx), Some(plugin_tx)]);
        let join = |r: thread::Result<Result<usize, String>>| {
            r.unwrap_or_else(|_| Err("extraction thread panicked".to_string()))
        };
        (decompressed, join(app.join()), join(plugins.join()))
    });

    let mut reasons = Vec::new();
    for result in [decompressed.map(|()| 0), app, plugins] {
        if let Err(reason) = result
            && !reasons.contains(&reason)
        {
            reasons.push(reason);
        }
    }
    if !reasons.is_empty() {
        return Err(ExtractError {
            archive: archive.to_path_buf(),
            reasons,
        });
    }
    info!(archive = %archive.display(), app_dir = %app_dir.display(), "Upload extracted");

    apply_change_list(app_dir, platform).map_err(|e| ExtractError::new(archive, e))
}

/// Delete the files the change list marks as removed. Plugin deletions are
/// left for the builder.
fn apply_change_list(app_dir: &Path, platform: &str) -> Result<Option<ChangeList>, String> {
    let path = app_dir.join(CHANGE_LIST_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("{CHANGE_LIST_FILE}: {e}")),
    };
    let list: ChangeList =
        serde_json::from_str(&raw).map_err(|e| format!("{CHANGE_LIST_FILE}: {e}"))?;

    for deleted in &list.for_platform(platform).deleted_files {
        let normalized = deleted.replace('\\', "/");
        if normalized.starts_with("plugins/") {
            continue;
        }
        let Some(relative) = safe_relative(&normalized) else {
            warn!(path = %deleted, "Ignoring unsafe change list entry");
            continue;
        };
        let target = app_dir.join(relative);
        if target.is_file() {
            fs::remove_file(&target).map_err(|e| format!("{}: {e}", target.display()))?;
            debug!(path = %target.display(), "Removed deleted file");
        }
    }
    Ok(Some(list))
}

fn safe_relative(raw: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}
