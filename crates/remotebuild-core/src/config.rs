//! Configuration resolution for remotebuild.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.remotebuild/config.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a file only needs to carry the settings it
//! changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the directory under `$HOME` holding remotebuild state.
pub const HOME_DIR_NAME: &str = ".remotebuild";

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConf {
    /// Root of all server state (certificates and builds).
    pub server_dir: PathBuf,
    pub port: u16,
    /// Serve HTTPS with client certificate authentication.
    pub secure: bool,
    /// Host name written into the server certificate.
    pub hostname: String,
    /// Minutes a PIN stays redeemable. Fractions are allowed.
    pub pin_timeout: f64,
    pub max_builds_in_queue: usize,
    pub delete_builds_on_shutdown: bool,
    pub allows_emulate: bool,
    pub cert_expiration_days: u32,
    /// Fallback language for status messages.
    pub lang: String,
    /// Passphrase sealing client certificate bundles.
    pub bundle_password: String,
    /// Builder routing table keyed by module name.
    pub modules: BTreeMap<String, ModuleConf>,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            server_dir: home_dir()
                .map(|h| h.join(HOME_DIR_NAME).join("remote-builds"))
                .unwrap_or_else(|| PathBuf::from("remote-builds")),
            port: 3000,
            secure: true,
            hostname: default_hostname(),
            pin_timeout: 10.0,
            max_builds_in_queue: 10,
            delete_builds_on_shutdown: true,
            allows_emulate: true,
            cert_expiration_days: 1825,
            lang: "en".to_string(),
            bundle_password: String::new(),
            modules: BTreeMap::new(),
        }
    }
}

/// One entry of the builder routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConf {
    /// URL prefix the build routes are mounted under.
    pub mount_path: String,
    /// Platform served by this module. Defaults to the module name.
    #[serde(default)]
    pub platform: Option<String>,
    /// Semver requirement matched against the request's `version`.
    #[serde(default)]
    pub version: Option<String>,
    /// Builder factory name.
    #[serde(default = "default_module_kind")]
    pub kind: String,
    /// Worker executable for process builders.
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_module_kind() -> String {
    "process".to_string()
}

impl ModuleConf {
    /// Process-backed module mounted at `mount_path`.
    pub fn process(mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            platform: None,
            version: None,
            kind: default_module_kind(),
            command: None,
            args: Vec::new(),
        }
    }
}

impl ServerConf {
    /// Directory holding the CA, the server certificate and client bundles.
    pub fn certs_dir(&self) -> PathBuf {
        self.server_dir.join("certs")
    }

    /// Directory holding one subdirectory per build number.
    pub fn builds_dir(&self) -> PathBuf {
        self.server_dir.join("remotebuild").join("builds")
    }

    /// Expand `~/` in `server_dir` and fill in the default routing table.
    pub fn finalize(mut self) -> Self {
        self.server_dir = expand_home(&self.server_dir);
        if self.modules.is_empty() {
            tracing::warn!("No builder modules configured, using the default ios module");
            self.modules = default_modules();
        }
        self
    }
}

/// The routing table used when none is configured.
pub fn default_modules() -> BTreeMap<String, ModuleConf> {
    let mut modules = BTreeMap::new();
    modules.insert("ios".to_string(), ModuleConf::process("cordova"));
    modules
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<ServerConf> {
    let mut merged = serde_json::to_value(ServerConf::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_json(&mut merged, read_config_file(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, read_config_file(path)?);
    }

    let mut config: ServerConf = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config);
    Ok(config.finalize())
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    home_dir().map(|h| h.join(HOME_DIR_NAME).join("config.json"))
}

fn home_dir() -> Option<PathBuf> {
    dirs::home_dir()
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Replace a leading `~` component with the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn read_config_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) if key != "modules" => merge_json(slot, value),
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut ServerConf) {
    if let Ok(val) = std::env::var("REMOTEBUILD_PORT") {
        if let Ok(n) = val.parse() {
            config.port = n;
        }
    }
    if let Ok(val) = std::env::var("REMOTEBUILD_SERVER_DIR") {
        config.server_dir = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("REMOTEBUILD_SECURE") {
        if let Ok(b) = val.parse() {
            config.secure = b;
        }
    }
    if let Ok(val) = std::env::var("REMOTEBUILD_PIN_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.pin_timeout = n;
        }
    }
    if let Ok(val) = std::env::var("REMOTEBUILD_MAX_BUILDS_IN_QUEUE") {
        if let Ok(n) = val.parse() {
            config.max_builds_in_queue = n;
        }
    }
}
