//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml`. Every section and
//! field has a default, so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the task engine.
///
/// Loaded from `~/.conveyor/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub debug: DebugSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub kubectl: KubectlSettings,
    #[serde(default)]
    pub notify: NotifySettings,
}

/// Controller timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Interval between execution backend status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval at which a blocked stage re-checks its gate deadline.
    #[serde(default = "default_approval_check_interval_ms")]
    pub approval_check_interval_ms: u64,
    /// Upper bound on a single remote probe/set/clear command.
    #[serde(default = "default_remote_exec_timeout_secs")]
    pub remote_exec_timeout_secs: u64,
    /// Applied to jobs whose definition carries no timeout.
    #[serde(default = "default_job_timeout_minutes")]
    pub default_job_timeout_minutes: u64,
    /// How long a cancelled or timed-out unit has to report a final status
    /// before the job is settled without one.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_approval_check_interval_ms() -> u64 {
    5_000
}

fn default_remote_exec_timeout_secs() -> u64 {
    10
}

fn default_job_timeout_minutes() -> u64 {
    60
}

fn default_stop_grace_secs() -> u64 {
    30
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            approval_check_interval_ms: default_approval_check_interval_ms(),
            remote_exec_timeout_secs: default_remote_exec_timeout_secs(),
            default_job_timeout_minutes: default_job_timeout_minutes(),
            stop_grace_secs: default_stop_grace_secs(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

/// Where debug markers live inside an execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSettings {
    #[serde(default = "default_marker_dir")]
    pub marker_dir: String,
}

fn default_marker_dir() -> String {
    "/conveyor/debug".to_string()
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            marker_dir: default_marker_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite URL. Defaults to `sqlite://{data_dir}/conveyor.db` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubectlSettings {
    #[serde(default = "default_kubectl_binary")]
    pub binary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Pod label holding the execution unit name.
    #[serde(default = "default_unit_label")]
    pub unit_label: String,
}

fn default_kubectl_binary() -> String {
    "kubectl".to_string()
}

fn default_unit_label() -> String {
    "job-name".to_string()
}

impl Default for KubectlSettings {
    fn default() -> Self {
        Self {
            binary: default_kubectl_binary(),
            context: None,
            unit_label: default_unit_label(),
        }
    }
}

/// Failure notification webhook. Disabled when `webhook_url` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Also notify on success.
    #[serde(default)]
    pub notify_success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_section() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.poll_interval_ms, 1_000);
        assert_eq!(config.engine.remote_exec_timeout_secs, 10);
        assert_eq!(config.engine.stop_grace_secs, 30);
        assert_eq!(config.debug.marker_dir, "/conveyor/debug");
        assert_eq!(config.kubectl.binary, "kubectl");
        assert!(config.database.url.is_none());
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[engine]
poll_interval_ms = 250

[notify]
webhook_url = "https://hooks.example.com/ci"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.poll_interval_ms, 250);
        assert_eq!(config.engine.default_job_timeout_minutes, 60);
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("https://hooks.example.com/ci")
        );
        assert_eq!(config.kubectl.unit_label, "job-name");
    }

    #[test]
    fn empty_toml_is_valid() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.event_bus_capacity, 1024);
    }
}
