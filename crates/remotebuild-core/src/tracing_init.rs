//! Log setup for the `remotebuild` binary.
//!
//! Our own crates log at the level chosen on the command line while
//! dependencies stay at `warn`, so `--log-level debug` does not drown the
//! build log in hyper and rustls chatter. `REMOTEBUILD_LOG` replaces the
//! whole directive when set.

use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding a full filter directive.
pub const LOG_ENV: &str = "REMOTEBUILD_LOG";

const CRATES: &[&str] = &[
    "remotebuild",
    "remotebuild_server",
    "remotebuild_core",
    "remotebuild_certs",
    "remotebuild_client",
];

/// Directive that logs our crates at `level` and everything else at `warn`.
pub fn default_directive(level: &str) -> String {
    let mut directive = String::from("warn");
    for krate in CRATES {
        directive.push(',');
        directive.push_str(krate);
        directive.push('=');
        directive.push_str(level);
    }
    directive
}

/// Filter from an explicit `directive`, or the default for `level`.
pub fn filter(directive: Option<&str>, level: &str) -> Result<EnvFilter, ParseError> {
    match directive {
        Some(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(default_directive(level)),
    }
}

/// Install the global subscriber. JSON lines when `log_json`, plain text
/// otherwise. Fails on a malformed level or `REMOTEBUILD_LOG` value.
pub fn init_tracing(level: &str, log_json: bool) -> Result<(), ParseError> {
    let directive = std::env::var(LOG_ENV).ok();
    let registry = tracing_subscriber::registry().with(filter(directive.as_deref(), level)?);
    if log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}
