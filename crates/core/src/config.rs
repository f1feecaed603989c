//! # Pipeline Configuration
//!
//! Typed, validated configuration for a single pipeline run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Outreach channel a draft is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Linkedin,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linkedin => "linkedin",
            Self::Email => "email",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "linkedin" => Some(Self::Linkedin),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

/// A prospect supplied up front for the extract phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prospect {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub persona_type: Option<String>,
}

/// Configuration for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of prospects the batch aims for (1-100)
    pub target_count: usize,
    /// Maximum concurrent tasks per dispatched phase (default: 3)
    pub max_workers: usize,
    /// Hard cap on tasks created for one run
    pub max_tasks_per_run: usize,
    /// Per-task timeout in seconds
    pub task_timeout_secs: u64,
    /// Retry budget per task; errored entities are re-dispatched up to this many times
    pub retry_max: u32,
    /// How long the approval gate waits for a decision
    pub approval_timeout_secs: u64,
    /// Pause at the approval gate for a human decision
    pub require_approval: bool,
    /// Generate missing research instead of only using cached research
    pub auto_research: bool,
    /// Draft messages through the dispatcher instead of using pre-supplied drafts
    pub auto_messages: bool,
    /// Refuse to draft for contacts without research
    pub require_research: bool,
    /// Channels to draft for
    pub channels: Vec<Channel>,
    /// Variable under experiment (e.g. "pain_hook")
    pub ab_variable: String,
    /// Experiment group label -> description
    pub ab_groups: BTreeMap<String, String>,
    /// Prospects to store during the extract phase
    pub prospects: Vec<Prospect>,
    /// Sales Navigator search the prospects came from
    pub saved_search_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_count: 25,
            max_workers: 3,
            max_tasks_per_run: 200,
            task_timeout_secs: 120,
            retry_max: 2,
            approval_timeout_secs: 24 * 60 * 60,
            require_approval: false,
            auto_research: false,
            auto_messages: false,
            require_research: true,
            channels: vec![Channel::Linkedin, Channel::Email],
            ab_variable: "pain_hook".to_string(),
            ab_groups: BTreeMap::from([
                ("A".to_string(), "Variant A".to_string()),
                ("B".to_string(), "Variant B".to_string()),
            ]),
            prospects: Vec::new(),
            saved_search_url: None,
        }
    }
}

impl PipelineConfig {
    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.target_count) {
            return Err(ConfigError::OutOfRange {
                field: "target_count",
                reason: format!("must be 1-100, got {}", self.target_count),
            });
        }
        if self.max_workers == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_workers",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_tasks_per_run == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_tasks_per_run",
                reason: "must be positive".to_string(),
            });
        }
        if self.task_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "task_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.approval_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "approval_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Missing("channels"));
        }
        if self.ab_variable.trim().is_empty() {
            return Err(ConfigError::Missing("ab_variable"));
        }
        if self.ab_groups.len() < 2 {
            return Err(ConfigError::OutOfRange {
                field: "ab_groups",
                reason: format!("need at least 2 groups, got {}", self.ab_groups.len()),
            });
        }
        for (i, prospect) in self.prospects.iter().enumerate() {
            if prospect.first_name.trim().is_empty() {
                return Err(ConfigError::InvalidProspect {
                    index: i,
                    reason: "first_name is empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.task_timeout(), Duration::from_secs(120));
        assert_eq!(config.approval_timeout(), Duration::from_secs(86_400));
        assert!(!config.require_approval);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = PipelineConfig {
            max_workers: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "max_workers", .. })
        ));

        let config = PipelineConfig {
            target_count: 101,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            channels: vec![],
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Missing("channels"))));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_workers": 5, "channels": ["email"]}"#).unwrap();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.channels, vec![Channel::Email]);
        assert_eq!(config.max_tasks_per_run, 200);
    }
}
