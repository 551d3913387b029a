//! The serializable build record and its status state machine.
//!
//! A record only moves forward:
//!
//! ```text
//! Uploading -> Uploaded -> Extracted -> Building -> Complete | Invalid | Error
//! Complete -> Emulated | Running | Installed | Debugging | Downloaded | Crashed | Terminated
//! ```
//!
//! `Error` is reachable from every stage before a terminal state. The
//! post-complete states describe what was last done with the finished
//! artifact, so they may follow each other.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::messages::Localizer;

/// Lifecycle status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    Uploading,
    Uploaded,
    Extracted,
    Building,
    Complete,
    Invalid,
    Error,
    Emulated,
    Running,
    Installed,
    Debugging,
    Downloaded,
    Crashed,
    Terminated,
}

impl BuildStatus {
    const fn stage(self) -> u8 {
        match self {
            Self::Uploading => 0,
            Self::Uploaded => 1,
            Self::Extracted => 2,
            Self::Building => 3,
            Self::Complete | Self::Invalid | Self::Error => 4,
            Self::Emulated
            | Self::Running
            | Self::Installed
            | Self::Debugging
            | Self::Downloaded
            | Self::Crashed
            | Self::Terminated => 5,
        }
    }

    /// States reachable only from a completed build.
    pub const fn is_post_complete(self) -> bool {
        self.stage() == 5
    }

    /// `true` once the build itself has finished, successfully or not.
    pub const fn is_finished(self) -> bool {
        self.stage() >= 4
    }

    /// `true` when the build produced an artifact.
    pub const fn has_artifact(self) -> bool {
        matches!(self, Self::Complete) || self.is_post_complete()
    }

    /// Whether a record in `self` may move to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Uploading, Self::Uploaded)
            | (Self::Uploaded, Self::Extracted)
            | (Self::Extracted, Self::Building)
            | (Self::Building, Self::Building | Self::Complete | Self::Invalid) => true,
            (_, Self::Error) => !self.is_finished(),
            (Self::Complete, _) => next.is_post_complete(),
            _ => self.is_post_complete() && next.is_post_complete(),
        }
    }

    /// Message id used when a record carries no explicit one.
    pub fn default_message_id(self) -> String {
        format!("Build{self}")
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Verbosity requested for the builder's log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Warn,
    #[default]
    Info,
    Verbose,
    Silly,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(Self::Silent),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "verbose" => Ok(Self::Verbose),
            "silly" => Ok(Self::Silly),
            other => Err(Error::Config(format!("unknown log level '{other}'"))),
        }
    }
}

/// One set of differential changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added_files: BTreeSet<String>,
    pub changed_files: BTreeSet<String>,
    pub deleted_files: BTreeSet<String>,
    pub added_plugins: BTreeSet<String>,
    pub deleted_plugins: BTreeSet<String>,
}

const CHANGE_KEYS: [&str; 5] = [
    "addedFiles",
    "changedFiles",
    "deletedFiles",
    "addedPlugins",
    "deletedPlugins",
];

impl ChangeSet {
    fn slot(&mut self, key: &str) -> Option<&mut BTreeSet<String>> {
        match key {
            "addedFiles" => Some(&mut self.added_files),
            "changedFiles" => Some(&mut self.changed_files),
            "deletedFiles" => Some(&mut self.deleted_files),
            "addedPlugins" => Some(&mut self.added_plugins),
            "deletedPlugins" => Some(&mut self.deleted_plugins),
            _ => None,
        }
    }

    fn get(&self, key: &str) -> &BTreeSet<String> {
        match key {
            "addedFiles" => &self.added_files,
            "changedFiles" => &self.changed_files,
            "deletedFiles" => &self.deleted_files,
            "addedPlugins" => &self.added_plugins,
            _ => &self.deleted_plugins,
        }
    }

    fn extend(&mut self, other: &Self) {
        self.added_files.extend(other.added_files.iter().cloned());
        self.changed_files.extend(other.changed_files.iter().cloned());
        self.deleted_files.extend(other.deleted_files.iter().cloned());
        self.added_plugins.extend(other.added_plugins.iter().cloned());
        self.deleted_plugins.extend(other.deleted_plugins.iter().cloned());
    }
}

/// Differential manifest relative to a prior upload.
///
/// On the wire it is a flat JSON object: `deletedFiles` applies to every
/// platform, `deletedFilesIos` only to `ios`, and so on for each list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "serde_json::Map<String, serde_json::Value>",
    into = "serde_json::Map<String, serde_json::Value>"
)]
pub struct ChangeList {
    pub common: ChangeSet,
    pub platforms: BTreeMap<String, ChangeSet>,
}

impl ChangeList {
    /// Common changes merged with those specific to `platform`.
    pub fn for_platform(&self, platform: &str) -> ChangeSet {
        let mut set = self.common.clone();
        if let Some(specific) = self.platforms.get(&platform.to_ascii_lowercase()) {
            set.extend(specific);
        }
        set
    }
}

impl TryFrom<serde_json::Map<String, serde_json::Value>> for ChangeList {
    type Error = Error;

    fn try_from(map: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut list = Self::default();
        for (key, value) in map {
            let Some(base) = CHANGE_KEYS.iter().find(|base| key.starts_with(**base)) else {
                continue;
            };
            let suffix = &key[base.len()..];
            let set = if suffix.is_empty() {
                &mut list.common
            } else {
                list.platforms.entry(suffix.to_ascii_lowercase()).or_default()
            };
            let entries: Vec<String> = serde_json::from_value(value)
                .map_err(|e| Error::ChangeList(format!("{key}: {e}")))?;
            if let Some(slot) = set.slot(base) {
                slot.extend(entries);
            }
        }
        Ok(list)
    }
}

impl From<ChangeList> for serde_json::Map<String, serde_json::Value> {
    fn from(list: ChangeList) -> Self {
        let mut map = Self::new();
        let mut put = |suffix: &str, set: &ChangeSet| {
            for base in CHANGE_KEYS {
                let entries = set.get(base);
                if !entries.is_empty() {
                    map.insert(format!("{base}{suffix}"), entries.iter().cloned().collect());
                }
            }
        };
        put("", &list.common);
        for (platform, set) in &list.platforms {
            put(&capitalize(platform), set);
        }
        map
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// A status report emitted by a builder, either as progress or as the final
/// outcome of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: BuildStatus,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message_args: Vec<String>,
    /// Artifact produced by a successful build, relative to the app directory.
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
}

impl StatusUpdate {
    pub const fn new(status: BuildStatus) -> Self {
        Self {
            status,
            message_id: None,
            message_args: Vec::new(),
            artifact_path: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, id: impl Into<String>, args: Vec<String>) -> Self {
        self.message_id = Some(id.into());
        self.message_args = args;
        self
    }
}

/// One submitted build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub build_number: u64,
    pub status: BuildStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub submission_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub status_time: OffsetDateTime,
    pub build_command: String,
    pub configuration: String,
    pub options: String,
    pub build_platform: String,
    pub build_lang: Option<String>,
    pub log_level: LogLevel,
    pub build_dir: PathBuf,
    pub app_dir: PathBuf,
    pub archive_path: PathBuf,
    pub change_list: Option<ChangeList>,
    pub build_successful: bool,
    pub message_id: Option<String>,
    pub message_args: Vec<String>,
    /// Resolved text of `message_id`, filled in at response time.
    pub message: Option<String>,
    pub artifact_path: Option<PathBuf>,
    /// Extra request parameters passed through to the builder.
    pub params: BTreeMap<String, String>,
}

impl BuildRecord {
    /// A fresh record in `Uploading` rooted at `build_dir`.
    pub fn new(build_number: u64, build_dir: PathBuf) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            build_number,
            status: BuildStatus::Uploading,
            submission_time: now,
            status_time: now,
            build_command: "build".to_string(),
            configuration: "release".to_string(),
            options: String::new(),
            build_platform: "ios".to_string(),
            build_lang: None,
            log_level: LogLevel::default(),
            app_dir: build_dir.join("cordovaApp"),
            archive_path: build_dir.join(format!("upload_{build_number}.tgz")),
            build_dir,
            change_list: None,
            build_successful: false,
            message_id: None,
            message_args: Vec::new(),
            message: None,
            artifact_path: None,
            params: BTreeMap::new(),
        }
    }

    /// Move to `status`, rejecting anything the state machine forbids.
    pub fn update_status(
        &mut self,
        status: BuildStatus,
        message_id: Option<String>,
        message_args: Vec<String>,
    ) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::Transition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.status_time = OffsetDateTime::now_utc().max(self.submission_time);
        self.message_id = message_id;
        self.message_args = message_args;
        self.message = None;
        Ok(())
    }

    /// Apply a builder-reported update.
    pub fn apply(&mut self, update: StatusUpdate) -> Result<()> {
        self.update_status(update.status, update.message_id, update.message_args)?;
        if update.artifact_path.is_some() {
            self.artifact_path = update.artifact_path;
        }
        Ok(())
    }

    /// Resolve `message` in the record's language, or `fallback_lang`.
    pub fn localize(&mut self, fallback_lang: &str, localizer: &dyn Localizer) {
        let lang = self.build_lang.as_deref().unwrap_or(fallback_lang);
        let id = self
            .message_id
            .clone()
            .unwrap_or_else(|| self.status.default_message_id());
        self.message = Some(localizer.message(lang, &id, &self.message_args));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::messages::DefaultMessages;

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut record = BuildRecord::new(7, PathBuf::from("/tmp/7"));
        for status in [
            BuildStatus::Uploaded,
            BuildStatus::Extracted,
            BuildStatus::Building,
            BuildStatus::Building,
            BuildStatus::Complete,
            BuildStatus::Running,
            BuildStatus::Downloaded,
        ] {
            record.update_status(status, None, Vec::new()).unwrap();
        }
        assert_eq!(record.status, BuildStatus::Downloaded);
        assert!(record.status_time >= record.submission_time);
    }

    #[test]
    fn backward_and_skipping_transitions_are_rejected() {
        let mut record = BuildRecord::new(1, PathBuf::from("/tmp/1"));
        assert!(record.update_status(BuildStatus::Building, None, vec![]).is_err());
        record.update_status(BuildStatus::Uploaded, None, vec![]).unwrap();
        assert!(record.update_status(BuildStatus::Uploading, None, vec![]).is_err());
        assert!(record.update_status(BuildStatus::Downloaded, None, vec![]).is_err());
    }

    #[test]
    fn error_is_reachable_until_finished() {
        for status in [
            BuildStatus::Uploading,
            BuildStatus::Uploaded,
            BuildStatus::Extracted,
            BuildStatus::Building,
        ] {
            assert!(status.can_transition_to(BuildStatus::Error), "{status}");
        }
        for status in [BuildStatus::Complete, BuildStatus::Invalid, BuildStatus::Error] {
            assert!(!status.can_transition_to(BuildStatus::Error), "{status}");
        }
        assert!(!BuildStatus::Invalid.can_transition_to(BuildStatus::Running));
        assert!(!BuildStatus::Error.can_transition_to(BuildStatus::Downloaded));
    }

    #[test]
    fn status_serializes_as_pascal_case() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Downloaded).unwrap(),
            "\"Downloaded\""
        );
        assert_eq!(BuildStatus::Complete.default_message_id(), "BuildComplete");
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("Verbose".parse::<LogLevel>().unwrap(), LogLevel::Verbose);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn change_list_partitions_platform_suffixes() {
        let list: ChangeList = serde_json::from_value(serde_json::json!({
            "deletedFiles": ["www/old.js"],
            "deletedFilesIos": ["platforms/ios/x.m"],
            "addedPluginsIos": ["cordova-plugin-camera"],
            "deletedPlugins": ["cordova-plugin-old"],
            "unrelated": 3
        }))
        .unwrap();
        let ios = list.for_platform("ios");
        assert!(ios.deleted_files.contains("www/old.js"));
        assert!(ios.deleted_files.contains("platforms/ios/x.m"));
        assert!(ios.added_plugins.contains("cordova-plugin-camera"));
        let android = list.for_platform("android");
        assert_eq!(android.deleted_files.len(), 1);
        assert!(android.added_plugins.is_empty());

        let wire = serde_json::to_value(&list).unwrap();
        assert_eq!(wire["deletedFilesIos"][0], "platforms/ios/x.m");
    }

    #[test]
    fn change_list_rejects_non_list_values() {
        let result: std::result::Result<ChangeList, _> =
            serde_json::from_value(serde_json::json!({ "deletedFiles": "www" }));
        assert!(result.is_err());
    }

    #[test]
    fn localize_falls_back_to_status_message() {
        let mut record = BuildRecord::new(3, PathBuf::from("/tmp/3"));
        record.localize("en", &DefaultMessages);
        assert_eq!(record.message.as_deref(), Some("Uploading build"));

        record
            .update_status(BuildStatus::Error, Some("InvalidBuildSubmission400".into()), vec![])
            .unwrap();
        record.localize("en", &DefaultMessages);
        assert!(record.message.unwrap().contains("Invalid build submission"));
    }
}
