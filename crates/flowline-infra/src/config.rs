//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.flowline/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database URL. Defaults to the data-dir database.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Bound on concurrently executing workflow nodes.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    /// Per-attempt node timeout in seconds.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
    /// Deadline for tool-server protocol requests in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_concurrent_nodes() -> usize {
    5
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_concurrent_nodes: default_max_concurrent_nodes(),
            node_timeout_secs: default_node_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the
///   default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "No config.toml found at {}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "Failed to read {}: {err}, using defaults",
                config_path.display()
            );
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
    async fn missing_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_nodes, 5);
        assert_eq!(config.node_timeout_secs, 300);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.database_url.is_none());
    }

    #[tokio::test]
    async fn valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
database_url = "sqlite:///var/lib/flowline/flowline.db"
max_concurrent_nodes = 12
node_timeout_secs = 120
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_nodes, 12);
        assert_eq!(config.node_timeout_secs, 120);
        // Unspecified fields keep their defaults.
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.database_url.unwrap().contains("flowline.db"));
    }

    #[tokio::test]
    async fn invalid_toml_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_nodes, 5);
    }
}
