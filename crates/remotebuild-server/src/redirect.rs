//! Platform/version routing of build requests to builders.
//!
//! Every configured module names a platform, an optional semver requirement
//! and a builder `kind`. The first request that routes to a module creates
//! its builder through the factory registered for that kind; later requests
//! reuse the cached instance.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use remotebuild_core::config::ModuleConf;
use semver::{Version, VersionReq};
use tracing::info;

use crate::build::BuildRequest;
use crate::builder::{Builder, BuilderError, BuilderFactory, ProcessBuilderFactory};

/// Routing errors.
#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    #[error("No builder available for platform {platform} version {version}")]
    NoMatchingModule { platform: String, version: String },

    #[error("Module {module} has an invalid version requirement: {reason}")]
    InvalidRequirement { module: String, reason: String },

    #[error("Module {module} uses unknown builder kind {kind}")]
    UnknownKind { module: String, kind: String },

    #[error(transparent)]
    Builder(#[from] BuilderError),
}

impl RedirectError {
    /// `true` when the request itself is at fault.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::NoMatchingModule { .. })
    }

    /// Localisable message id and arguments.
    pub fn message(&self) -> (&'static str, Vec<String>) {
        match self {
            Self::NoMatchingModule { platform, version } => {
                ("NoMatchingBuilder", vec![platform.clone(), version.clone()])
            }
            Self::Builder(e) => e.message(),
            other => ("InternalServerError", vec![other.to_string()]),
        }
    }
}

struct Route {
    name: String,
    module: ModuleConf,
    platform: String,
    requirement: Option<VersionReq>,
}

/// Selects and caches the builder serving each request.
pub struct RequestRedirector {
    routes: Vec<Route>,
    factories: HashMap<String, Arc<dyn BuilderFactory>>,
    loaded: Mutex<HashMap<String, Arc<dyn Builder>>>,
}

impl RequestRedirector {
    /// Redirector over `modules`, with the `process` factory registered.
    pub fn new(modules: &BTreeMap<String, ModuleConf>) -> Result<Self, RedirectError> {
        let mut routes = Vec::with_capacity(modules.len());
        for (name, module) in modules {
            let requirement = module
                .version
                .as_deref()
                .map(VersionReq::parse)
                .transpose()
                .map_err(|e| RedirectError::InvalidRequirement {
                    module: name.clone(),
                    reason: e.to_string(),
                })?;
            routes.push(Route {
                name: name.clone(),
                platform: module
                    .platform
                    .clone()
                    .unwrap_or_else(|| name.clone())
                    .to_ascii_lowercase(),
                module: module.clone(),
                requirement,
            });
        }
        // Modules pinned to a version win over catch-all ones.
        routes.sort_by_key(|r| r.requirement.is_none());

        let mut factories: HashMap<String, Arc<dyn BuilderFactory>> = HashMap::new();
        factories.insert("process".to_string(), Arc::new(ProcessBuilderFactory));
        Ok(Self {
            routes,
            factories,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    /// Register (or replace) the factory for `kind`.
    #[must_use]
    pub fn with_factory(mut self, kind: impl Into<String>, factory: Arc<dyn BuilderFactory>) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    /// Distinct URL prefixes the build API is mounted under.
    pub fn mount_paths(&self) -> BTreeSet<String> {
        self.routes
            .iter()
            .map(|r| r.module.mount_path.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    fn route_for(&self, request: &BuildRequest) -> Option<&Route> {
        let version = request.version.as_deref().and_then(parse_lenient);
        self.routes.iter().find(|route| {
            route.platform.eq_ignore_ascii_case(&request.platform)
                && match (&route.requirement, &version) {
                    (None, _) => true,
                    (Some(req), Some(v)) => req.matches(v),
                    // Pinned modules only serve requests that name a version.
                    (Some(_), None) => false,
                }
        })
    }

    /// Builder serving `request`, created on first use.
    pub fn select_builder(&self, request: &BuildRequest) -> Result<Arc<dyn Builder>, RedirectError> {
        let route = self
            .route_for(request)
            .ok_or_else(|| RedirectError::NoMatchingModule {
                platform: request.platform.clone(),
                version: request.version.clone().unwrap_or_else(|| "*".to_string()),
            })?;

        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(builder) = loaded.get(&route.name) {
            return Ok(Arc::clone(builder));
        }
        let factory = self
            .factories
            .get(&route.module.kind)
            .ok_or_else(|| RedirectError::UnknownKind {
                module: route.name.clone(),
                kind: route.module.kind.clone(),
            })?;
        let builder = factory.create(&route.name, &route.module)?;
        info!(module = %route.name, kind = %route.module.kind, "Builder loaded");
        loaded.insert(route.name.clone(), Arc::clone(&builder));
        Ok(builder)
    }
}

/// Parse `6`, `6.1` or `6.1.2` as a semver version.
fn parse_lenient(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let padded = match raw.matches('.').count() {
        0 => format!("{raw}.0.0"),
        1 => format!("{raw}.0"),
        _ => raw.to_string(),
    };
    Version::parse(&padded).ok()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::builder::{ActionParams, DeviceAction};
    use async_trait::async_trait;
    use remotebuild_core::{BuildRecord, StatusUpdate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Named(String);

    #[async_trait]
    impl Builder for Named {
        fn name(&self) -> &str {
            &self.0
        }

        async fn build(
            &self,
            _record: BuildRecord,
            _progress: mpsc::Sender<StatusUpdate>,
        ) -> Result<StatusUpdate, BuilderError> {
            unreachable!()
        }

        async fn device_action(
            &self,
            _action: DeviceAction,
            _record: &BuildRecord,
            _params: &ActionParams,
        ) -> Result<StatusUpdate, BuilderError> {
            unreachable!()
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl BuilderFactory for Counting {
        fn create(&self, name: &str, _module: &ModuleConf) -> Result<Arc<dyn Builder>, BuilderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Named(name.to_string())))
        }
    }

    fn module(platform: &str, version: Option<&str>) -> ModuleConf {
        ModuleConf {
            platform: Some(platform.to_string()),
            version: version.map(ToString::to_string),
            kind: "fake".to_string(),
            ..ModuleConf::process("cordova")
        }
    }

    fn request(platform: &str, version: Option<&str>) -> BuildRequest {
        BuildRequest {
            platform: platform.to_string(),
            version: version.map(ToString::to_string),
            ..BuildRequest::default()
        }
    }

    fn redirector(factory: Arc<Counting>) -> RequestRedirector {
        let mut modules = BTreeMap::new();
        modules.insert("ios-legacy".to_string(), module("ios", Some("<6")));
        modules.insert("ios".to_string(), module("ios", None));
        RequestRedirector::new(&modules)
            .unwrap()
            .with_factory("fake", factory)
    }

    #[test]
    fn version_pinned_module_wins() {
        let redirector = redirector(Arc::default());
        let legacy = redirector.select_builder(&request("ios", Some("5.4"))).unwrap();
        assert_eq!(legacy.name(), "ios-legacy");
        let current = redirector.select_builder(&request("ios", Some("7"))).unwrap();
        assert_eq!(current.name(), "ios");
    }

    #[test]
    fn unversioned_request_goes_to_catch_all() {
        let redirector = redirector(Arc::default());
        let builder = redirector.select_builder(&request("ios", None)).unwrap();
        assert_eq!(builder.name(), "ios");

        let mut modules = BTreeMap::new();
        modules.insert("ios-legacy".to_string(), module("ios", Some("<6")));
        let pinned_only = RequestRedirector::new(&modules)
            .unwrap()
            .with_factory("fake", Arc::new(Counting::default()));
        assert!(matches!(
            pinned_only.select_builder(&request("ios", None)),
            Err(RedirectError::NoMatchingModule { .. })
        ));
    }

    #[test]
    fn builders_are_created_once() {
        let factory = Arc::new(Counting::default());
        let redirector = redirector(Arc::clone(&factory));
        let a = redirector.select_builder(&request("ios", None)).unwrap();
        let b = redirector.select_builder(&request("IOS", None)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_platform_is_a_client_error() {
        let err = redirector(Arc::default())
            .select_builder(&request("android", None))
            .err()
            .unwrap();
        assert!(err.is_client_error());
        assert_eq!(err.message().0, "NoMatchingBuilder");
    }

    #[test]
    fn unknown_kind_is_a_server_error() {
        let mut modules = BTreeMap::new();
        modules.insert("ios".to_string(), module("ios", None));
        let err = RequestRedirector::new(&modules)
            .unwrap()
            .select_builder(&request("ios", None))
            .err()
            .unwrap();
        assert!(matches!(err, RedirectError::UnknownKind { .. }));
        assert!(!err.is_client_error());
    }

    #[test]
    fn invalid_requirement_is_rejected_up_front() {
        let mut modules = BTreeMap::new();
        modules.insert("ios".to_string(), module("ios", Some("not-a-range")));
        assert!(matches!(
            RequestRedirector::new(&modules),
            Err(RedirectError::InvalidRequirement { .. })
        ));
    }

    #[test]
    fn mount_paths_are_normalised() {
        let mut modules = BTreeMap::new();
        let mut a = module("ios", None);
        a.mount_path = "/cordova/".to_string();
        modules.insert("ios".to_string(), a);
        modules.insert("android".to_string(), module("android", None));
        let paths = RequestRedirector::new(&modules).unwrap().mount_paths();
        assert_eq!(paths.into_iter().collect::<Vec<_>>(), vec!["cordova".to_string()]);
    }

    #[test]
    fn lenient_versions() {
        assert_eq!(parse_lenient("6"), Some(Version::new(6, 0, 0)));
        assert_eq!(parse_lenient("v6.1"), Some(Version::new(6, 1, 0)));
        assert_eq!(parse_lenient("6.1.2"), Some(Version::new(6, 1, 2)));
        assert_eq!(parse_lenient("six"), None);
    }
}
