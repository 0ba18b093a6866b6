//! Engine configuration loader for Conveyor.
//!
//! Reads `config.toml` from the data directory (`~/.conveyor/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;
use std::time::Duration;

use conveyor_types::config::EngineConfig;

/// Poll intervals below this are raised to it.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Backend poll interval with a floor applied.
pub fn resolve_poll_interval(config: &EngineConfig) -> Duration {
    Duration::from_millis(config.engine.poll_interval_ms).max(MIN_POLL_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.poll_interval_ms, 1_000);
        assert!(config.notify.webhook_url.is_none());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
remote_exec_timeout_secs = 3

[debug]
marker_dir = "/zadig/debug/"

[kubectl]
context = "staging"

[notify]
webhook_url = "https://hooks.example.com/ci"
token = "s3cret"
notify_success = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.remote_exec_timeout_secs, 3);
        assert_eq!(config.engine.poll_interval_ms, 1_000);
        assert_eq!(config.debug.marker_dir, "/zadig/debug/");
        assert_eq!(config.kubectl.context.as_deref(), Some("staging"));
        assert_eq!(config.kubectl.binary, "kubectl");
        assert!(config.notify.notify_success);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "[engine\npoll = ")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.poll_interval_ms, 1_000);
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let mut config = EngineConfig::default();
        config.engine.poll_interval_ms = 1;
        assert_eq!(resolve_poll_interval(&config), MIN_POLL_INTERVAL);

        config.engine.poll_interval_ms = 2_000;
        assert_eq!(resolve_poll_interval(&config), Duration::from_secs(2));
    }
}
