//! # Pipeline Events
//!
//! Lifecycle events published on the progress bus for one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phases::{Phase, RunSnapshot};

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Full run snapshot, always the first event a subscriber sees
    State,
    RunStarted,
    PhaseStarted,
    PhaseCompleted,
    /// Run paused at the approval gate
    ApprovalNeeded,
    ApprovalResolved,
    /// One dispatched task finished (completed or error)
    TaskCompleted,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl PipelineEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::State => "state",
            Self::RunStarted => "run_started",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::ApprovalNeeded => "approval_needed",
            Self::ApprovalResolved => "approval_resolved",
            Self::TaskCompleted => "task_completed",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
        }
    }

    /// Last event of a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted | Self::RunFailed | Self::RunCancelled
        )
    }
}

/// An event on the progress bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    pub run_id: String,
    /// Phase the event belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind, run_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            run_id: run_id.to_string(),
            phase: None,
            data: None,
        }
    }

    /// Snapshot event for a subscriber
    pub fn state(snapshot: &RunSnapshot) -> Self {
        let event = Self::new(PipelineEventKind::State, &snapshot.run_id);
        match serde_json::to_value(snapshot) {
            Ok(data) => event.with_data(data),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize run snapshot");
                event
            }
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::new(PipelineEventKind::PhaseStarted, "prun_1")
            .with_phase(Phase::Research)
            .with_data(serde_json::json!({ "entities": 3 }));

        assert_eq!(event.run_id, "prun_1");
        assert_eq!(event.phase, Some(Phase::Research));
        assert!(!event.kind.is_terminal());
        assert!(PipelineEventKind::RunCancelled.is_terminal());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "phase_started");
        assert_eq!(json["phase"], "research");
    }
}
