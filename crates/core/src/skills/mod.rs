//! # Outreach Skills
//!
//! Collaborators the pipeline delegates to, plus the builtin implementations
//! backed by the outreach database.
//!
//! ## Architecture
//!
//! ```text
//! PipelineRun
//!   ├── PhaseFunctions       (single-shot phases: pre-brief, extract, score, A/B, finalize)
//!   ├── DeliverableGenerator (batch deliverable)
//!   └── SwarmSupervisor
//!         └── TaskExecutor   (per-contact research, draft, QA, sequence)
//! ```
//!
//! ## Builtin Skills
//!
//! - `researcher_skill` - Cached research lookup, optional generation
//! - `drafting_skill` - Placeholder drafts per channel and touch
//! - `qa_skill` - Rule-based draft checks
//! - `sequence_skill` - Follow-up scheduling
//! - `scoring_skill` - Readiness score
//! - `experiment_skill` - Alternating A/B assignment
//! - `pre_brief_skill` - Previous batch review
//! - `extract_skill` - Prospect import with LinkedIn dedupe
//! - `deliverable_skill` - JSON batch deliverable

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Channel, PipelineConfig};
use crate::state::TaskKind;

pub mod deliverable_skill;
pub mod drafting_skill;
pub mod experiment_skill;
pub mod extract_skill;
pub mod pre_brief_skill;
pub mod qa_skill;
pub mod researcher_skill;
pub mod scoring_skill;
pub mod sequence_skill;

mod builtin;

pub use builtin::BuiltinSkills;

/// What a collaborator knows about the run it works for
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: String,
    pub batch_number: u32,
    /// Set once the initialize phase created the batch
    pub batch_id: Option<String>,
    pub config: Arc<PipelineConfig>,
}

impl TaskContext {
    pub fn new(run_id: &str, batch_number: u32, config: Arc<PipelineConfig>) -> Self {
        Self {
            run_id: run_id.to_string(),
            batch_number,
            batch_id: None,
            config,
        }
    }

    pub fn require_batch(&self) -> Result<&str> {
        self.batch_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("run {} has no batch yet", self.run_id))
    }
}

// === Task outputs ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchSource {
    /// Stored research was found
    Cached,
    /// Research was generated for this run
    Generated,
    /// Nothing stored; contact flagged for manual research
    NeedsResearch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchOutput {
    pub contact_id: String,
    pub source: ResearchSource,
    #[serde(default)]
    pub research_id: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
}

/// Why a channel got no new drafts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSkip {
    pub channel: Channel,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftOutput {
    pub contact_id: String,
    pub draft_ids: Vec<String>,
    #[serde(default)]
    pub skipped_channels: Vec<ChannelSkip>,
}

/// One failed QA check on one draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcFlag {
    pub contact_id: String,
    #[serde(default)]
    pub draft_id: Option<String>,
    pub check: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaOutput {
    pub contact_id: String,
    pub passed: bool,
    pub drafts_checked: usize,
    #[serde(default)]
    pub flags: Vec<QcFlag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTouch {
    pub touch_number: u32,
    pub channel: Channel,
    pub due_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceOutput {
    pub contact_id: String,
    pub scheduled: Vec<ScheduledTouch>,
    /// Pending follow-ups were already in place
    pub already_scheduled: bool,
}

/// Tagged result of one dispatched task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    Research(ResearchOutput),
    Draft(DraftOutput),
    Qa(QaOutput),
    Sequence(SequenceOutput),
}

impl TaskOutput {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Research(_) => TaskKind::Research,
            Self::Draft(_) => TaskKind::Draft,
            Self::Qa(_) => TaskKind::Qa,
            Self::Sequence(_) => TaskKind::Sequence,
        }
    }

    /// False only for a QA result that flagged something
    pub fn passed(&self) -> bool {
        match self {
            Self::Qa(qa) => qa.passed,
            _ => true,
        }
    }
}

// === Phase outputs ===

/// Review of the previous batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreBrief {
    #[serde(default)]
    pub previous_batch_number: Option<u32>,
    #[serde(default)]
    pub previous_batch_id: Option<String>,
    pub drafts_total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub edit_requested: usize,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactScore {
    pub contact_id: String,
    pub score: u32,
}

/// Generated batch deliverable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    #[serde(default)]
    pub path: Option<String>,
    pub contact_count: usize,
    pub approved_drafts: usize,
}

/// Assignment of contacts to experiment groups
pub type ExperimentGroups = BTreeMap<String, Vec<String>>;

// === Collaborator traits ===

/// Runs one unit of work for one contact. Stateless between calls.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Output already produced by an earlier side effect, if any.
    /// A hit completes the task without calling [`TaskExecutor::execute`].
    async fn existing_output(
        &self,
        _kind: TaskKind,
        _entity_id: &str,
        _ctx: &TaskContext,
    ) -> Result<Option<TaskOutput>> {
        Ok(None)
    }

    async fn execute(
        &self,
        kind: TaskKind,
        entity_id: &str,
        ctx: &TaskContext,
    ) -> Result<TaskOutput>;
}

/// Single-shot phase bodies
#[async_trait]
pub trait PhaseFunctions: Send + Sync {
    async fn pre_brief(&self, ctx: &TaskContext) -> Result<PreBrief>;

    /// Contacts of the batch, in order
    async fn extract(&self, ctx: &TaskContext) -> Result<Vec<String>>;

    async fn score(&self, ctx: &TaskContext, contact_ids: &[String]) -> Result<Vec<ContactScore>>;

    async fn assign_experiments(
        &self,
        ctx: &TaskContext,
        contact_ids: &[String],
    ) -> Result<ExperimentGroups>;

    async fn finalize(&self, ctx: &TaskContext, contact_ids: &[String]) -> Result<()>;
}

/// Produces the batch deliverable after approval
#[async_trait]
pub trait DeliverableGenerator: Send + Sync {
    async fn generate(&self, ctx: &TaskContext) -> Result<Deliverable>;
}
