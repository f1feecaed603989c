//! # Pipeline Phases
//!
//! The fixed phase order of a run, the tagged result each phase records and
//! the run state machine the controller mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::supervisor::PhaseSummary;
use crate::error::RunError;
use crate::skills::{Deliverable, PreBrief, QcFlag};

/// Phase of a pipeline run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Create the batch record
    Initialize,
    /// Review the previous batch (skipped for batch 1)
    PreBrief,
    /// Store prospects and link them to the batch
    Extract,
    Research,
    Score,
    AbAssign,
    Messages,
    Qc,
    /// Human review gate
    Approval,
    GenerateDeliverable,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Initialize,
        Phase::PreBrief,
        Phase::Extract,
        Phase::Research,
        Phase::Score,
        Phase::AbAssign,
        Phase::Messages,
        Phase::Qc,
        Phase::Approval,
        Phase::GenerateDeliverable,
        Phase::Finalize,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::PreBrief => "pre_brief",
            Self::Extract => "extract",
            Self::Research => "research",
            Self::Score => "score",
            Self::AbAssign => "ab_assign",
            Self::Messages => "messages",
            Self::Qc => "qc",
            Self::Approval => "approval",
            Self::GenerateDeliverable => "generate_deliverable",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    ApprovalNeeded,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ApprovalNeeded => "approval_needed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A reviewer's decision for one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Edit,
}

/// Artifact id -> decision. Artifacts without an entry are approved.
pub type ApprovalDecisions = HashMap<String, Decision>;

/// How the approval gate was passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Manual review not required
    Auto,
    /// Reviewer submitted decisions
    Manual,
    /// Reviewer skipped the review
    Skipped,
}

/// Result of the approval gate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTally {
    pub approved: usize,
    pub rejected: usize,
    pub edit_requested: usize,
    /// Decisions naming artifacts outside this batch
    pub ignored: usize,
}

/// Tagged per-phase result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Initialized {
        batch_id: String,
    },
    Skipped {
        reason: String,
    },
    PreBriefed(PreBrief),
    Extracted {
        contact_count: usize,
    },
    Dispatched(PhaseSummary),
    Scored {
        scored: usize,
    },
    Assigned {
        groups: BTreeMap<String, usize>,
    },
    QualityChecked {
        summary: PhaseSummary,
        passed: usize,
        flagged: usize,
        flags: Vec<QcFlag>,
    },
    Approval {
        mode: ApprovalMode,
        tally: ApprovalTally,
        /// Contacts whose drafts were all held back; they get no follow-ups
        #[serde(default)]
        withheld: Vec<String>,
    },
    Deliverable(Deliverable),
    Finalized {
        contact_count: usize,
        /// Contacts with follow-ups scheduled
        sequenced: usize,
    },
}

/// Completed phase with its result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub completed_at: DateTime<Utc>,
}

/// Immutable view of a run, published after every mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub batch_number: u32,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub current_phase: Option<Phase>,
    pub current_phase_index: usize,
    pub total_phases: usize,
    pub phase_results: Vec<PhaseRecord>,
    /// Entity ids that survived each completed phase
    pub phase_entities: BTreeMap<String, Vec<String>>,
    /// Contacts currently flowing through the pipeline
    pub contact_ids: Vec<String>,
    /// Drafts put in front of the reviewer
    pub artifact_ids: Vec<String>,
    /// Decisions applied at the approval gate; empty means approve all
    #[serde(default)]
    pub approval_decisions: ApprovalDecisions,
    #[serde(default)]
    pub error: Option<RunError>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_pct: f64,
    pub elapsed_seconds: f64,
    pub cancel_requested: bool,
}

impl RunSnapshot {
    /// Result recorded for a phase, if it completed
    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phase_results
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }
}

/// Mutable run state owned by the controller task
#[derive(Debug, Clone)]
pub(crate) struct Run {
    pub run_id: String,
    pub batch_number: u32,
    pub batch_id: Option<String>,
    pub status: RunStatus,
    phase_index: usize,
    pub phase_results: Vec<PhaseRecord>,
    pub phase_entities: BTreeMap<String, Vec<String>>,
    pub contact_ids: Vec<String>,
    pub artifact_ids: Vec<String>,
    pub approval_decisions: ApprovalDecisions,
    pub error: Option<RunError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

impl Run {
    pub fn new(run_id: String, batch_number: u32) -> Self {
        Self {
            run_id,
            batch_number,
            batch_id: None,
            status: RunStatus::Pending,
            phase_index: 0,
            phase_results: Vec::new(),
            phase_entities: BTreeMap::new(),
            contact_ids: Vec::new(),
            artifact_ids: Vec::new(),
            approval_decisions: ApprovalDecisions::new(),
            error: None,
            started_at: None,
            completed_at: None,
            cancel_requested: false,
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move to a phase; the index never goes backwards
    pub fn enter(&mut self, phase: Phase) {
        self.phase_index = self.phase_index.max(phase.index());
    }

    pub fn record(&mut self, phase: Phase, outcome: PhaseOutcome) {
        self.phase_entities
            .insert(phase.as_str().to_string(), self.contact_ids.clone());
        self.phase_results.push(PhaseRecord {
            phase,
            outcome,
            completed_at: Utc::now(),
        });
    }

    /// Enter a terminal state. Returns false if the run already ended.
    pub fn finish(&mut self, status: RunStatus, error: Option<RunError>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if status == RunStatus::Completed {
            self.phase_index = Phase::ALL.len();
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let total = Phase::ALL.len();
        let end = self.completed_at.unwrap_or_else(Utc::now);
        let elapsed_seconds = self
            .started_at
            .map(|start| (end - start).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);

        RunSnapshot {
            run_id: self.run_id.clone(),
            batch_number: self.batch_number,
            batch_id: self.batch_id.clone(),
            status: self.status,
            current_phase: Phase::ALL.get(self.phase_index).copied(),
            current_phase_index: self.phase_index,
            total_phases: total,
            phase_results: self.phase_results.clone(),
            phase_entities: self.phase_entities.clone(),
            contact_ids: self.contact_ids.clone(),
            artifact_ids: self.artifact_ids.clone(),
            approval_decisions: self.approval_decisions.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress_pct: (self.phase_index as f64 / total as f64 * 1000.0).round() / 10.0,
            elapsed_seconds,
            cancel_requested: self.cancel_requested,
        }
    }
}
