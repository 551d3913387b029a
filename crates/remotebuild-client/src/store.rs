//! On-disk bundle storage, one directory per server host.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{debug, info};

use crate::error::SecurityError;

const BUNDLE_FILENAME: &str = "cert.bundle";

/// Where sealed client bundles live.
///
/// Linux and macOS use `~/.remotebuild/certs`. Each host gets a
/// subdirectory named by its percent-encoded name, so `build.local:3000`
/// and `build.local` never share a file.
///
/// Bundles hold private keys, so saving is refused on platforms where the
/// file cannot be made owner-only.
#[derive(Debug, Clone)]
pub struct BundleStore {
    root: PathBuf,
}

impl BundleStore {
    /// Store rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store for the current operating system.
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    pub fn platform_default() -> Result<Self, SecurityError> {
        let home = dirs::home_dir().ok_or(SecurityError::NoHomeDirectory)?;
        Ok(Self::at(home.join(".remotebuild").join("certs")))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub const fn platform_default() -> Result<Self, SecurityError> {
        Err(SecurityError::UnsupportedHostPlatform(std::env::consts::OS))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bundle file for `host`.
    pub fn bundle_path(&self, host: &str) -> PathBuf {
        self.root
            .join(utf8_percent_encode(host, NON_ALPHANUMERIC).to_string())
            .join(BUNDLE_FILENAME)
    }

    /// Persist `data` for `host`, readable only by the owner. Replaces any
    /// earlier bundle.
    pub fn save(&self, data: &[u8], host: &str) -> Result<PathBuf, SecurityError> {
        ensure_private_files()?;
        let path = self.bundle_path(host);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
            restrict(dir, 0o700)?;
        }
        write_private(&path, data)?;
        info!(host, path = %path.display(), "Saved client certificate");
        Ok(path)
    }

    /// The sealed bundle saved for `host`.
    pub fn load(&self, host: &str) -> Result<Vec<u8>, SecurityError> {
        let path = self.bundle_path(host);
        match fs::read(&path) {
            Ok(data) => {
                debug!(host, path = %path.display(), "Loaded client certificate");
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SecurityError::CertificateNotFound {
                host: host.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Forget the bundle for `host`.
    pub fn remove(&self, host: &str) -> Result<(), SecurityError> {
        let path = self.bundle_path(host);
        match path.parent().map(fs::remove_dir_all) {
            Some(Err(e)) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_wraps)]
const fn ensure_private_files() -> Result<(), SecurityError> {
    Ok(())
}

#[cfg(not(unix))]
const fn ensure_private_files() -> Result<(), SecurityError> {
    Err(SecurityError::UnsupportedHostPlatform(std::env::consts::OS))
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<(), SecurityError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<(), SecurityError> {
    ensure_private_files()
}

/// Write `data` to a file that is owner-only from the moment it exists.
#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> Result<(), SecurityError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // An earlier bundle may predate the mode above.
    restrict(path, 0o600)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(_path: &Path, _data: &[u8]) -> Result<(), SecurityError> {
    ensure_private_files()
}
