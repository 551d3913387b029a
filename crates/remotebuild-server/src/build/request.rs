//! Parsed build submission parameters.

use std::collections::{BTreeMap, HashMap};

use remotebuild_core::LogLevel;

/// Query keys consumed by [`BuildRequest::from_query`]. Everything else is
/// passed through to the builder in `params`.
const KNOWN_KEYS: [&str; 7] = [
    "command",
    "cfg",
    "options",
    "buildNumber",
    "platform",
    "logLevel",
    "version",
];

/// A build submission, before a record exists for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub command: String,
    /// `debug` or `release`.
    pub configuration: String,
    pub options: String,
    /// Caller-chosen build number.
    pub build_number: Option<u64>,
    pub platform: String,
    /// Builder version the client asked for.
    pub version: Option<String>,
    pub log_level: LogLevel,
    /// Preferred language from `Accept-Language`.
    pub language: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            command: "build".to_string(),
            configuration: "release".to_string(),
            options: String::new(),
            build_number: None,
            platform: "ios".to_string(),
            version: None,
            log_level: LogLevel::default(),
            language: None,
            params: BTreeMap::new(),
        }
    }
}

impl BuildRequest {
    /// Parse the upload query string. Returns every problem found.
    pub fn from_query(
        query: &HashMap<String, String>,
        accept_language: Option<&str>,
    ) -> Result<Self, Vec<String>> {
        let mut request = Self::default();
        let mut errors = Vec::new();
        let value = |key: &str| query.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(command) = value("command") {
            request.command = command.to_string();
        }
        if let Some(cfg) = value("cfg") {
            let cfg = cfg.to_ascii_lowercase();
            if cfg == "debug" || cfg == "release" {
                request.configuration = cfg;
            } else {
                errors.push(format!("cfg must be debug or release, got '{cfg}'"));
            }
        }
        if let Some(options) = value("options") {
            request.options = options.to_string();
        }
        if let Some(number) = value("buildNumber") {
            match number.parse() {
                Ok(n) => request.build_number = Some(n),
                Err(_) => errors.push(format!("buildNumber must be a number, got '{number}'")),
            }
        }
        if let Some(platform) = value("platform") {
            request.platform = platform.to_ascii_lowercase();
        }
        if let Some(level) = value("logLevel") {
            match level.parse() {
                Ok(level) => request.log_level = level,
                Err(e) => errors.push(e.to_string()),
            }
        }
        request.version = value("version").map(ToString::to_string);
        request.language = accept_language.and_then(primary_language);
        request.params = query
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if errors.is_empty() {
            Ok(request)
        } else {
            Err(errors)
        }
    }
}

/// First language tag of an `Accept-Language` header.
pub fn primary_language(header: &str) -> Option<String> {
    header
        .split(',')
        .next()
        .and_then(|tag| tag.split(';').next())
        .map(str::trim)
        .filter(|tag| !tag.is_empty() && *tag != "*")
        .map(ToString::to_string)
}
