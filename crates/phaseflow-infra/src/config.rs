//! Project configuration loader.
//!
//! Reads `phaseflow.toml` from the project root and deserializes it into
//! [`EngineConfig`]. A missing file means defaults; a malformed one is an
//! error, since silently ignoring a typo'd `checkpoint_dir` would lose state.

use std::path::Path;

use anyhow::Context;
use phaseflow_types::config::EngineConfig;

pub const CONFIG_FILE_NAME: &str = "phaseflow.toml";

/// Load `{root}/phaseflow.toml`, or the defaults when it does not exist.
pub async fn load_engine_config(root: &Path) -> anyhow::Result<EngineConfig> {
    let config_path = root.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return Ok(EngineConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", config_path.display()));
        }
    };

    let config = toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    tracing::debug!(path = %config_path.display(), "loaded engine config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await.unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
project_dir = "flows"
default_step_timeout_ms = 60000
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await.unwrap();
        assert_eq!(config.project_dir, PathBuf::from("flows"));
        assert_eq!(config.default_step_timeout_ms, Some(60_000));
        assert_eq!(config.checkpoint_dir, PathBuf::from(".phaseflow/checkpoints"));
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "this is not { valid toml !!!")
            .await
            .unwrap();

        let err = load_engine_config(tmp.path()).await.unwrap_err();
        assert!(format!("{err}").contains("failed to parse"));
    }
}
