use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use replay_core::TableOptions;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub tables: Vec<TableSection>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("default server config to parse")
    }
}

impl ServerConfig {
    /// Load the built-in defaults, overlaid with `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            let user: Self = toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            config.merge(user);
        }
        Ok(config)
    }

    fn merge(&mut self, other: Self) {
        self.server = other.server;
        self.checkpoint.merge(other.checkpoint);
        if !other.tables.is_empty() {
            self.tables = other.tables;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub callback_executor_threads: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 50051,
            callback_executor_threads: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub root: String,
    pub fallback: String,
    pub keep_latest: usize,
}

impl CheckpointSection {
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.root.is_empty()
    }

    fn merge(&mut self, other: Self) {
        if !other.root.is_empty() {
            self.root = other.root;
        }
        if !other.fallback.is_empty() {
            self.fallback = other.fallback;
        }
        if other.keep_latest > 0 {
            self.keep_latest = other.keep_latest;
        }
    }
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            root: String::new(),
            fallback: String::new(),
            keep_latest: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSection {
    pub name: String,
    pub max_size: usize,
    pub max_times_sampled: i32,
    pub min_size_to_sample: usize,
    pub default_flexible_batch_size: i32,
    pub max_enqueued_inserts: usize,
}

impl TableSection {
    #[must_use]
    pub fn options(&self) -> TableOptions {
        TableOptions {
            max_size: self.max_size,
            max_times_sampled: self.max_times_sampled,
            min_size_to_sample: self.min_size_to_sample,
            default_flexible_batch_size: self.default_flexible_batch_size,
            max_enqueued_inserts: self.max_enqueued_inserts,
        }
    }
}

impl Default for TableSection {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_size: 100_000,
            max_times_sampled: 0,
            min_size_to_sample: 1,
            default_flexible_batch_size: 64,
            max_enqueued_inserts: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config = ServerConfig::default();
        assert_eq!(config.server.port, 50051);
        assert_eq!(config.server.callback_executor_threads, 32);
        assert!(!config.checkpoint.enabled());
        assert_eq!(config.tables.len(), 1);
        assert_eq!(config.tables[0].name, "default");
    }

    #[test]
    fn user_config_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9000
callback_executor_threads = 8

[checkpoint]
root = "/tmp/replay-ckpt"

[[tables]]
name = "experience"
max_size = 500
"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.callback_executor_threads, 8);
        assert!(config.checkpoint.enabled());
        assert_eq!(config.checkpoint.keep_latest, 1);
        assert_eq!(config.tables.len(), 1);
        assert_eq!(config.tables[0].name, "experience");
        assert_eq!(config.tables[0].max_size, 500);
        // Unspecified table fields keep their defaults.
        assert_eq!(config.tables[0].default_flexible_batch_size, 64);
    }

    #[test]
    fn missing_tables_section_keeps_default_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        fs::write(&path, "[server]\nport = 1234\n").unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.tables.len(), 1);
        assert_eq!(config.tables[0].name, "default");
    }
}
