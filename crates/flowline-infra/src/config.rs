//! Engine configuration loader for Flowline.
//!
//! Reads `config.toml` from the data directory (`~/.flowline/` by default)
//! and deserializes it into [`EngineConfig`]. The lenient loader falls back
//! to defaults when the file is missing or malformed; the strict reader
//! reports why.

use std::path::{Path, PathBuf};

use flowline_types::config::EngineConfig;
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `FLOWLINE_DATA_DIR` environment variable
/// 2. `~/.flowline`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLOWLINE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".flowline");
    }

    PathBuf::from(".flowline")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Read `{data_dir}/config.toml`. `Ok(None)` if the file does not exist.
pub async fn read_engine_config(data_dir: &Path) -> Result<Option<EngineConfig>, ConfigError> {
    let path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    toml::from_str::<EngineConfig>(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse { path, source })
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file cannot be read or parsed, logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    match read_engine_config(data_dir).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::debug!(
                "No config.toml found at {}, using defaults",
                data_dir.display()
            );
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}

/// Value of the env var named `var`, if set and non-empty.
///
/// Used for the API token and trigger secret, whose config entries name an
/// environment variable rather than holding the secret.
pub fn secret_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.default_environment, "development");
        assert!(config.executors.is_empty());
        assert!(read_engine_config(tmp.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            config_path(tmp.path()),
            r#"
[engine]
default_environment = "production"
poll_interval_ms = 250

[dead_letter]
max_attempts = 2

[executors.slack_post]
url = "http://127.0.0.1:9100/slack"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.default_environment, "production");
        assert_eq!(config.engine.poll_interval_ms, 250);
        assert_eq!(config.dead_letter.max_attempts, 2);
        assert_eq!(config.executors["slack_post"].url, "http://127.0.0.1:9100/slack");
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(config_path(tmp.path()), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.default_environment, "development");

        let strict = read_engine_config(tmp.path()).await;
        assert!(matches!(strict, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("FLOWLINE_DATA_DIR", "/tmp/test-flowline");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-flowline"));
        unsafe {
            std::env::remove_var("FLOWLINE_DATA_DIR");
        }
    }

    #[test]
    fn test_secret_from_env_ignores_blank() {
        // SAFETY: Uses a variable name no other test touches.
        unsafe {
            std::env::set_var("FLOWLINE_TEST_BLANK_SECRET", "  ");
        }
        assert!(secret_from_env("FLOWLINE_TEST_BLANK_SECRET").is_none());
        assert!(secret_from_env("FLOWLINE_TEST_UNSET_SECRET").is_none());
        unsafe {
            std::env::remove_var("FLOWLINE_TEST_BLANK_SECRET");
        }
    }
}
