//! Shared tracing/logging initialization.
//!
//! Binaries built on `sbus` install one `tracing_subscriber` registry: an
//! env-filter (from `RUST_LOG`, falling back to the configured level for the
//! `sbus` crates) plus either a human-readable or a JSON fmt layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Crates whose level follows [`LogConfig::level`] when `RUST_LOG` is unset.
const SBUS_TARGETS: &[&str] = &["sbus_core", "sbus_client", "sbus_soak"];

/// Build the default filter directive for a level, e.g.
/// `sbus_core=debug,sbus_client=debug,sbus_soak=debug`.
pub fn default_filter(level: &str) -> String {
    SBUS_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber from the log configuration.
///
/// Returns an error when a subscriber is already installed (for example
/// when called twice from tests).
pub fn init_tracing(log: &LogConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(&log.level)),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if log.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
}
