//! Engine configuration loader for Conductor.
//!
//! Reads `conductor.toml` from the data directory (`~/.conductor/` unless
//! `CONDUCTOR_DATA_DIR` is set) and deserializes it into [`EngineConfig`].
//! Falls back to defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use conductor_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CONDUCTOR_DATA_DIR";

/// Resolve the data directory: `CONDUCTOR_DATA_DIR`, else `~/.conductor`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conductor")
}

/// Load engine configuration from `{data_dir}/conductor.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("conductor.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No conductor.toml found at {}, using defaults", config_path.display());
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_nodes, 50);
        assert_eq!(config.backoff.cap_ms, 60_000);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("conductor.toml"),
            r#"
max_concurrent_nodes = 8
history_limit = 20

[backoff]
base_ms = 250

[logging]
level = "debug"
json = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_nodes, 8);
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.max_concurrent_workflows, 10);
        assert_eq!(config.backoff.base_ms, 250);
        assert_eq!(config.backoff.cap_ms, 60_000);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[tokio::test]
    async fn load_engine_config_malformed_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("conductor.toml"), "max_concurrent_nodes = [oops")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_nodes, 50);
    }

    #[test]
    fn default_data_dir_ends_with_conductor_or_env() {
        let dir = default_data_dir();
        match std::env::var_os(DATA_DIR_ENV) {
            Some(env) => assert_eq!(dir, PathBuf::from(env)),
            None => assert!(dir.ends_with(".conductor")),
        }
    }
}
