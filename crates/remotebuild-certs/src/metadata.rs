//! Issuance metadata stored next to certificates.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CertError;

/// When a certificate was issued and for how long it is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertMetadata {
    /// Subject the certificate was issued to.
    pub subject: String,
    /// Issuance time, milliseconds since the Unix epoch.
    pub issued_at_ms: u64,
    pub validity_days: u32,
}

impl CertMetadata {
    /// Metadata for a certificate issued now.
    pub fn now(subject: impl Into<String>, validity_days: u32) -> Self {
        Self {
            subject: subject.into(),
            issued_at_ms: now_ms(),
            validity_days,
        }
    }

    /// Time elapsed since issuance.
    pub fn age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.issued_at_ms))
    }

    /// `true` once the certificate's validity window has passed.
    pub fn is_expired(&self) -> bool {
        self.age() >= Duration::from_secs(u64::from(self.validity_days) * 24 * 60 * 60)
    }

    /// Read metadata from `path`. Returns `None` if absent or unparseable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write(&self, path: &Path) -> Result<(), CertError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
