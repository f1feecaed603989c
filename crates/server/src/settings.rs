//! Server settings
//!
//! Loaded from `.outreach/config.json`, then overridden by `OUTREACH_*`
//! environment variables (a `.outreach/.env` or `.env` file is loaded first),
//! then by CLI flags.

use outreach_core::config::PipelineConfig;
use outreach_core::swarm::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

pub const SETTINGS_PATH: &str = ".outreach/config.json";
pub const ENV_PATH: &str = ".outreach/.env";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct Settings {
    /// SQLite database file
    #[schema(value_type = String)]
    pub db_path: PathBuf,
    pub port: u16,
    /// Where batch deliverables are written
    #[schema(value_type = String)]
    pub output_dir: PathBuf,
    /// Event queue length per stream subscriber
    pub queue_capacity: usize,
    /// Overrides `max_workers` of every started run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Overrides `require_approval` of every started run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_approval: Option<bool>,
    /// `tracing` filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".outreach/outreach.db"),
            port: 8080,
            output_dir: PathBuf::from("output"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_workers: None,
            require_approval: None,
            log_filter: "info,outreach_core=debug".to_string(),
        }
    }
}

impl Settings {
    /// Settings file merged with the process environment
    pub async fn load() -> Self {
        if Path::new(ENV_PATH).exists() {
            let _ = dotenvy::from_path(ENV_PATH);
        }
        let _ = dotenvy::dotenv();

        let mut settings = Self::from_file(Path::new(SETTINGS_PATH)).await;
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    /// Read a settings file; a missing or malformed file yields the defaults
    pub async fn from_file(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                eprintln!("Ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Apply `OUTREACH_*` overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("OUTREACH_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("OUTREACH_PORT").and_then(|v| v.parse().ok()) {
            self.port = v;
        }
        if let Some(v) = var("OUTREACH_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = var("OUTREACH_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.queue_capacity = v;
        }
        if let Some(v) = var("OUTREACH_MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.max_workers = Some(v);
        }
        if let Some(v) = var("OUTREACH_REQUIRE_APPROVAL").and_then(|v| parse_bool(&v)) {
            self.require_approval = Some(v);
        }
        if let Some(v) = var("OUTREACH_LOG") {
            self.log_filter = v;
        }
    }

    /// Apply the run-wide overrides to a requested configuration
    pub fn pipeline_config(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if let Some(require) = self.require_approval {
            config.require_approval = require;
        }
        config
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000, "max_workers": 5}"#).unwrap();

        let settings = Settings::from_file(&path).await;
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.max_workers, Some(5));
        assert_eq!(settings.queue_capacity, DEFAULT_QUEUE_CAPACITY);

        let missing = Settings::from_file(&dir.path().join("nope.json")).await;
        assert_eq!(missing, Settings::default());
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("OUTREACH_PORT", "7000"),
            ("OUTREACH_REQUIRE_APPROVAL", "yes"),
            ("OUTREACH_QUEUE_CAPACITY", "not-a-number"),
        ]);
        let mut settings = Settings::default();
        settings.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.port, 7000);
        assert_eq!(settings.require_approval, Some(true));
        assert_eq!(settings.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_overrides_apply_to_pipeline_config() {
        let settings = Settings {
            max_workers: Some(7),
            require_approval: Some(true),
            ..Settings::default()
        };
        let config = settings.pipeline_config(PipelineConfig::default());
        assert_eq!(config.max_workers, 7);
        assert!(config.require_approval);
        assert_eq!(config.target_count, PipelineConfig::default().target_count);
    }
}
