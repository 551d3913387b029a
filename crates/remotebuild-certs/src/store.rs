//! File-system backed certificate store.
//!
//! Layout under the store root:
//!
//! ```text
//! ca-key.pem  ca-cert.pem  ca-meta.json
//! server-key.pem  server-cert.pem  server-meta.json
//! client/<pin>/client.bundle
//! client/<pin>/issued.json
//! ```
//!
//! Every mutating operation holds the store lock, so two concurrent PIN
//! requests can never be handed the same directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::authority::{self, CaBundle};
use crate::bundle::ClientBundle;
use crate::error::CertError;
use crate::metadata::CertMetadata;

const CA_KEY_FILENAME: &str = "ca-key.pem";
const CA_CERT_FILENAME: &str = "ca-cert.pem";
const CA_META_FILENAME: &str = "ca-meta.json";
const SERVER_KEY_FILENAME: &str = "server-key.pem";
const SERVER_CERT_FILENAME: &str = "server-cert.pem";
const SERVER_META_FILENAME: &str = "server-meta.json";
const CLIENT_SUBDIR: &str = "client";
const BUNDLE_FILENAME: &str = "client.bundle";
const ISSUED_FILENAME: &str = "issued.json";

/// Lowest and highest PIN handed out.
pub const PIN_RANGE: std::ops::RangeInclusive<u32> = 100_000..=999_999;
const PIN_ATTEMPTS: usize = 64;

/// Asks the operator whether a destructive operation should proceed.
pub trait ConfirmationHandler {
    fn confirm(&self, question: &str) -> bool;
}

impl<F: Fn(&str) -> bool> ConfirmationHandler for F {
    fn confirm(&self, question: &str) -> bool {
        self(question)
    }
}

/// Paths of the server TLS material and whether it was just created.
#[derive(Debug, Clone)]
pub struct ServerCerts {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub new_certs: bool,
}

/// PEM contents of the server TLS material.
pub struct ServerCertPem {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: Zeroizing<String>,
}

/// CA, server certificate and PIN-keyed client bundles on disk.
pub struct CertificateStore {
    root: PathBuf,
    server_names: Vec<String>,
    validity_days: u32,
    bundle_password: Zeroizing<String>,
    lock: Mutex<()>,
}

impl CertificateStore {
    /// Store rooted at `root`, issuing server certificates for `hostname`.
    pub fn new(root: impl Into<PathBuf>, hostname: &str) -> Self {
        let mut server_names = vec![hostname.to_string()];
        for extra in ["localhost", "127.0.0.1"] {
            if !server_names.iter().any(|n| n == extra) {
                server_names.push(extra.to_string());
            }
        }
        Self {
            root: root.into(),
            server_names,
            validity_days: authority::DEFAULT_VALIDITY_DAYS,
            bundle_password: Zeroizing::new(String::new()),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    #[must_use]
    pub fn with_bundle_password(mut self, password: impl Into<String>) -> Self {
        self.bundle_password = Zeroizing::new(password.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn client_dir(&self) -> PathBuf {
        self.root.join(CLIENT_SUBDIR)
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.client_dir().join(pin.to_string())
    }

    fn server_paths(&self, new_certs: bool) -> ServerCerts {
        ServerCerts {
            ca_cert: self.path(CA_CERT_FILENAME),
            server_cert: self.path(SERVER_CERT_FILENAME),
            server_key: self.path(SERVER_KEY_FILENAME),
            new_certs,
        }
    }

    fn valid(&self, pem: &str, meta: &str) -> bool {
        self.path(pem).exists()
            && CertMetadata::read(&self.path(meta)).is_some_and(|m| !m.is_expired())
    }

    /// Ensure a CA and server certificate exist and are unexpired, generating
    /// both when they are not.
    pub fn initialize_server_certs(&self) -> Result<ServerCerts, CertError> {
        let _guard = self.guard();
        let ca_ok = self.valid(CA_CERT_FILENAME, CA_META_FILENAME)
            && self.path(CA_KEY_FILENAME).exists();
        let server_ok = self.valid(SERVER_CERT_FILENAME, SERVER_META_FILENAME)
            && self.path(SERVER_KEY_FILENAME).exists();
        if ca_ok && server_ok {
            debug!(root = %self.root.display(), "Reusing existing server certificates");
            return Ok(self.server_paths(false));
        }

        fs::create_dir_all(&self.root)?;
        restrict_dir_permissions(&self.root)?;

        info!(root = %self.root.display(), "Generating certificate authority");
        let ca = authority::generate_ca(self.validity_days)?;
        write_key_file(&self.path(CA_KEY_FILENAME), &ca.key_pair.serialize_pem())?;
        fs::write(self.path(CA_CERT_FILENAME), &ca.ca_cert_pem)?;
        CertMetadata::now(format!("{} CA", authority::ORG_NAME), self.validity_days)
            .write(&self.path(CA_META_FILENAME))?;

        self.write_server_cert(&ca)?;
        Ok(self.server_paths(true))
    }

    fn write_server_cert(&self, ca: &CaBundle) -> Result<(), CertError> {
        let names: Vec<&str> = self.server_names.iter().map(String::as_str).collect();
        let pair = authority::generate_server_cert(ca, &names, self.validity_days)?;
        write_key_file(&self.path(SERVER_KEY_FILENAME), &pair.key_pem)?;
        fs::write(self.path(SERVER_CERT_FILENAME), &pair.cert_pem)?;
        CertMetadata::now(names.join(","), self.validity_days)
            .write(&self.path(SERVER_META_FILENAME))?;
        info!(
            server_cert = %self.path(SERVER_CERT_FILENAME).display(),
            names = ?names,
            "Server certificate written"
        );
        Ok(())
    }

    fn load_ca(&self) -> Result<CaBundle, CertError> {
        let key_pem = Zeroizing::new(read_existing(&self.path(CA_KEY_FILENAME))?);
        let cert_pem = read_existing(&self.path(CA_CERT_FILENAME))?;
        authority::load_ca(&key_pem, cert_pem)
    }

    /// Load the PEM material the TLS listener needs.
    pub fn get_server_certs(&self) -> Result<ServerCertPem, CertError> {
        let _guard = self.guard();
        Ok(ServerCertPem {
            ca_cert_pem: read_existing(&self.path(CA_CERT_FILENAME))?,
            server_cert_pem: read_existing(&self.path(SERVER_CERT_FILENAME))?,
            server_key_pem: Zeroizing::new(read_existing(&self.path(SERVER_KEY_FILENAME))?),
        })
    }

    /// Regenerate the server certificate, keeping the CA, if `handler`
    /// confirms. Returns whether the certificate was replaced.
    pub fn reset_server_cert(&self, handler: &dyn ConfirmationHandler) -> Result<bool, CertError> {
        if !handler.confirm(
            "Regenerate the server certificate? The CA is kept, so paired clients keep working.",
        ) {
            info!("Server certificate reset declined");
            return Ok(false);
        }
        let _guard = self.guard();
        let ca = self.load_ca()?;
        self.write_server_cert(&ca)?;
        Ok(true)
    }

    /// Issue a CA-signed client certificate and seal it under a fresh PIN.
    pub fn generate_client_cert(&self) -> Result<u32, CertError> {
        let _guard = self.guard();
        let ca = self.load_ca()?;
        fs::create_dir_all(self.client_dir())?;

        let (pin, dir) = self.reserve_pin()?;
        let result = self.write_client_bundle(&ca, pin, &dir);
        if result.is_err() {
            let _ = fs::remove_dir_all(&dir);
        }
        result?;
        info!(pin, "Client certificate issued");
        Ok(pin)
    }

    fn reserve_pin(&self) -> Result<(u32, PathBuf), CertError> {
        for _ in 0..PIN_ATTEMPTS {
            let pin = OsRng.gen_range(PIN_RANGE);
            let dir = self.pin_dir(pin);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((pin, dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(pin, "PIN collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CertError::PinSpaceExhausted)
    }

    fn write_client_bundle(&self, ca: &CaBundle, pin: u32, dir: &Path) -> Result<(), CertError> {
        let common_name = format!("{}-client-{pin}", authority::ORG_NAME);
        let pair = authority::generate_client_cert(ca, &common_name, self.validity_days)?;
        let bundle = ClientBundle {
            cert_pem: pair.cert_pem,
            key_pem: pair.key_pem,
            ca_cert_pem: ca.ca_cert_pem.clone(),
        };
        write_key_file(&dir.join(BUNDLE_FILENAME), &bundle.seal(&self.bundle_password)?)?;
        CertMetadata::now(common_name, self.validity_days).write(&dir.join(ISSUED_FILENAME))
    }

    /// Sealed bundle issued under `pin`. Fails with `PinNotFound` when no
    /// such PIN exists and `PinExpired` when it outlived `pin_timeout_minutes`.
    pub fn download_client_certs(
        &self,
        pin: u32,
        pin_timeout_minutes: f64,
    ) -> Result<Vec<u8>, CertError> {
        let _guard = self.guard();
        let dir = self.pin_dir(pin);
        let data = match fs::read(dir.join(BUNDLE_FILENAME)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(CertError::PinNotFound(pin)),
            Err(e) => return Err(e.into()),
        };
        if pin_age(&dir).is_none_or(|age| exceeds(age, pin_timeout_minutes)) {
            return Err(CertError::PinExpired(pin));
        }
        Ok(data)
    }

    /// Delete the bundle issued under `pin`, regardless of age.
    pub fn invalidate_pin(&self, pin: u32) -> Result<(), CertError> {
        let _guard = self.guard();
        match fs::remove_dir_all(self.pin_dir(pin)) {
            Ok(()) => {
                debug!(pin, "PIN invalidated");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every PIN older than `pin_timeout_minutes`. Returns the purged
    /// PINs.
    pub fn purge_expired_pin_based_client_certs_sync(
        &self,
        pin_timeout_minutes: f64,
    ) -> Result<Vec<u32>, CertError> {
        let _guard = self.guard();
        let entries = match fs::read_dir(self.client_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut purged = Vec::new();
        for entry in entries {
            let entry = entry?;
            let dir = entry.path();
            let Some(pin) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if pin_age(&dir).is_none_or(|age| exceeds(age, pin_timeout_minutes)) {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(pin, error = %e, "Failed to purge expired PIN");
                    continue;
                }
                purged.push(pin);
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "Purged expired client certificate PINs");
        }
        Ok(purged)
    }

    /// Delete the whole certificate tree.
    pub fn remove_all_certs_sync(&self) -> Result<(), CertError> {
        let _guard = self.guard();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                warn!(root = %self.root.display(), "All certificates removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn exceeds(age: Duration, timeout_minutes: f64) -> bool {
    age.as_secs_f64() >= timeout_minutes * 60.0
}

/// Age of a PIN from its issuance record, falling back to the directory
/// modification time.
fn pin_age(dir: &Path) -> Option<Duration> {
    if let Some(meta) = CertMetadata::read(&dir.join(ISSUED_FILENAME)) {
        return Some(meta.age());
    }
    fs::metadata(dir).ok()?.modified().ok()?.elapsed().ok()
}

fn read_existing(path: &Path) -> Result<String, CertError> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CertError::ServerCertsMissing,
        _ => CertError::Io(e),
    })
}

/// Write a secret file readable only by its owner.
fn write_key_file(path: &Path, content: impl AsRef<[u8]>) -> Result<(), CertError> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) -> Result<(), CertError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
const fn restrict_dir_permissions(_path: &Path) -> Result<(), CertError> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn store(dir: &tempfile::TempDir) -> CertificateStore {
        CertificateStore::new(dir.path().join("certs"), "build.example.test")
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.initialize_server_certs().unwrap().new_certs);
        let again = store.initialize_server_certs().unwrap();
        assert!(!again.new_certs);
        assert!(again.server_cert.exists());
        assert!(again.ca_cert.exists());
    }

    #[test]
    fn expired_server_cert_regenerates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        let meta_path = store.path(SERVER_META_FILENAME);
        let mut meta = CertMetadata::read(&meta_path).unwrap();
        meta.issued_at_ms = 0;
        meta.write(&meta_path).unwrap();
        assert!(store.initialize_server_certs().unwrap().new_certs);
    }

    #[test]
    fn server_cert_validity_is_five_years() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        let meta = CertMetadata::read(&store.path(SERVER_META_FILENAME)).unwrap();
        assert_eq!(meta.validity_days, 5 * 365);
        assert!(meta.subject.contains("build.example.test"));
    }

    #[test]
    fn client_cert_requires_server_certs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.generate_client_cert(),
            Err(CertError::ServerCertsMissing)
        ));
        assert!(matches!(
            store.get_server_certs(),
            Err(CertError::ServerCertsMissing)
        ));
    }

    #[test]
    fn issued_pin_downloads_an_openable_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).with_bundle_password("s3cret");
        store.initialize_server_certs().unwrap();

        let pin = store.generate_client_cert().unwrap();
        assert!(PIN_RANGE.contains(&pin));
        assert!(store.pin_dir(pin).join(BUNDLE_FILENAME).exists());

        let data = store.download_client_certs(pin, 10.0).unwrap();
        let bundle = ClientBundle::open(&data, "s3cret").unwrap();
        let server = store.get_server_certs().unwrap();
        assert_eq!(bundle.ca_cert_pem, server.ca_cert_pem);
        assert!(bundle.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[cfg(unix)]
    #[test]
    fn secrets_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        let pin = store.generate_client_cert().unwrap();
        for path in [
            store.path(CA_KEY_FILENAME),
            store.path(SERVER_KEY_FILENAME),
            store.pin_dir(pin).join(BUNDLE_FILENAME),
        ] {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }

    #[test]
    fn unknown_and_expired_pins_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        assert!(matches!(
            store.download_client_certs(123_456, 10.0),
            Err(CertError::PinNotFound(123_456))
        ));

        let pin = store.generate_client_cert().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            store.download_client_certs(pin, 0.0001),
            Err(CertError::PinExpired(p)) if p == pin
        ));
    }

    #[test]
    fn invalidated_pin_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        let pin = store.generate_client_cert().unwrap();
        store.invalidate_pin(pin).unwrap();
        assert!(matches!(
            store.download_client_certs(pin, 10.0),
            Err(CertError::PinNotFound(_))
        ));
        store.invalidate_pin(pin).unwrap();
    }

    #[test]
    fn purge_honours_fractional_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        let pin = store.generate_client_cert().unwrap();

        assert!(store.purge_expired_pin_based_client_certs_sync(10.0).unwrap().is_empty());
        assert!(store.pin_dir(pin).exists());

        std::thread::sleep(Duration::from_millis(20));
        let purged = store.purge_expired_pin_based_client_certs_sync(0.00002).unwrap();
        assert_eq!(purged, vec![pin]);
        assert!(!store.pin_dir(pin).exists());
    }

    #[test]
    fn purge_without_client_dir_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir)
            .purge_expired_pin_based_client_certs_sync(0.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reset_respects_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        let ca_before = fs::read_to_string(store.path(CA_CERT_FILENAME)).unwrap();
        let before = fs::read_to_string(store.path(SERVER_CERT_FILENAME)).unwrap();

        let asked = std::cell::RefCell::new(Vec::new());
        let decline = |q: &str| {
            asked.borrow_mut().push(q.to_string());
            false
        };
        assert!(!store.reset_server_cert(&decline).unwrap());
        let asked = asked.into_inner();
        assert_eq!(asked.len(), 1);
        assert!(asked[0].contains("CA is kept"));
        assert_eq!(
            fs::read_to_string(store.path(SERVER_CERT_FILENAME)).unwrap(),
            before
        );

        assert!(store.reset_server_cert(&|_: &str| true).unwrap());
        assert_ne!(
            fs::read_to_string(store.path(SERVER_CERT_FILENAME)).unwrap(),
            before
        );
        assert_eq!(
            fs::read_to_string(store.path(CA_CERT_FILENAME)).unwrap(),
            ca_before
        );
    }

    #[test]
    fn concurrent_issuance_never_reuses_a_pin() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir));
        store.initialize_server_certs().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.generate_client_cert().unwrap())
            })
            .collect();
        let pins: HashSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(pins.len(), 8);
    }

    #[test]
    fn remove_all_deletes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize_server_certs().unwrap();
        store.remove_all_certs_sync().unwrap();
        assert!(!store.root().exists());
        store.remove_all_certs_sync().unwrap();
        assert!(store.initialize_server_certs().unwrap().new_certs);
    }
}
