//! Configuration resolution for sbus.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/sbus/settings.json`)
//! 3. Project config (`.sbus/settings.json`)
//! 4. Environment variables (`SBUS_*`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Complete sbus configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// How received messages are settled with the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Messages stay locked until explicitly settled.
    #[default]
    PeekLock,
    /// Messages are removed from the entity on delivery.
    ReceiveAndDelete,
}

/// Session receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on sessions serviced at once.
    pub max_concurrent_sessions: usize,
    /// Upper bound on concurrent accept calls. `None` derives it from
    /// `max_concurrent_sessions` and the host CPU count.
    pub max_concurrent_accept_requests: Option<usize>,
    /// Sleep after an accept finds no claimable session (seconds).
    pub no_active_session_backoff_secs: u64,
    /// Concurrent handler invocations within one session.
    pub max_concurrent_calls_per_session: usize,
    /// Complete messages the handler left unsettled.
    pub auto_complete: bool,
    /// Total time a session lock is kept alive by renewal (seconds, 0 = off).
    pub max_auto_renew_duration_secs: u64,
    /// How long a session may stay empty before its pump ends (seconds).
    pub max_message_wait_secs: u64,
    pub receive_mode: ReceiveMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 2000,
            max_concurrent_accept_requests: None,
            no_active_session_backoff_secs: 10,
            max_concurrent_calls_per_session: 1,
            auto_complete: true,
            max_auto_renew_duration_secs: 300,
            max_message_wait_secs: 60,
            receive_mode: ReceiveMode::PeekLock,
        }
    }
}

impl SessionConfig {
    /// Reject values the session runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(Error::Config(
                "sessions.max_concurrent_sessions must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_accept_requests == Some(0) {
            return Err(Error::Config(
                "sessions.max_concurrent_accept_requests must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_calls_per_session == 0 {
            return Err(Error::Config(
                "sessions.max_concurrent_calls_per_session must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|p| p.exists());
    let project = project_dir
        .map(|dir| dir.join(".sbus").join("settings.json"))
        .filter(|p| p.exists());
    load_config_from(global.as_deref(), project.as_deref())
}

/// Resolve configuration from explicit file locations, then the environment.
pub fn load_config_from(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();
    for path in [global, project].into_iter().flatten() {
        debug!(path = %path.display(), "Loading config file");
        merge_config(&mut config, load_config_value(path)?)?;
    }
    apply_env_overrides(&mut config);
    config.sessions.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sbus").join("settings.json"))
}

fn load_config_value(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay only the keys a file actually sets, so a project file that sets
/// one field does not reset the global file's other fields to defaults.
fn merge_config(base: &mut Config, overlay: serde_json::Value) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_json(&mut merged, overlay);
    *base = serde_json::from_value(merged)?;
    Ok(())
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_parse("SBUS_MAX_CONCURRENT_SESSIONS") {
        config.sessions.max_concurrent_sessions = n;
    }
    if let Some(n) = env_parse("SBUS_MAX_CONCURRENT_ACCEPT_REQUESTS") {
        config.sessions.max_concurrent_accept_requests = Some(n);
    }
    if let Some(n) = env_parse("SBUS_BACKOFF_SECS") {
        config.sessions.no_active_session_backoff_secs = n;
    }
    if let Ok(val) = std::env::var("SBUS_LOG_LEVEL") {
        config.log.level = val;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = raw.parse().ok();
    if parsed.is_none() {
        warn!(key, value = %raw, "Ignoring unparseable environment override");
    }
    parsed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_match_broker_client_defaults() {
        let config = Config::default();
        assert_eq!(config.sessions.max_concurrent_sessions, 2000);
        assert_eq!(config.sessions.no_active_session_backoff_secs, 10);
        assert_eq!(config.sessions.max_concurrent_calls_per_session, 1);
        assert!(config.sessions.auto_complete);
        assert_eq!(config.sessions.receive_mode, ReceiveMode::PeekLock);
        assert!(config.sessions.max_concurrent_accept_requests.is_none());
    }

    #[test]
    fn project_overrides_single_field_of_global() {
        let dir = tempfile::tempdir().unwrap();
        let global = write(
            dir.path(),
            "global.json",
            r#"{"sessions": {"max_concurrent_sessions": 8, "auto_complete": false}}"#,
        );
        let project = write(
            dir.path(),
            "project.json",
            r#"{"sessions": {"max_concurrent_sessions": 4}}"#,
        );

        let config = load_config_from(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.sessions.max_concurrent_sessions, 4);
        assert!(!config.sessions.auto_complete);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn receive_mode_uses_snake_case() {
        let dir = tempfile::tempdir().unwrap();
        let project = write(
            dir.path(),
            "project.json",
            r#"{"sessions": {"receive_mode": "receive_and_delete"}}"#,
        );
        let config = load_config_from(None, Some(&project)).unwrap();
        assert_eq!(config.sessions.receive_mode, ReceiveMode::ReceiveAndDelete);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write(dir.path(), "bad.json", "{ not json");
        let err = load_config_from(Some(&bad), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_sessions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let project = write(
            dir.path(),
            "project.json",
            r#"{"sessions": {"max_concurrent_sessions": 0}}"#,
        );
        let err = load_config_from(None, Some(&project)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_accept_requests_rejected() {
        let config = SessionConfig {
            max_concurrent_accept_requests: Some(0),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
