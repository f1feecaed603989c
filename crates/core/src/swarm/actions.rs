//! # Agent Actions
//!
//! One-off work on a single contact or batch outside any pipeline run.
//! Per-contact actions go through a [`SwarmSupervisor`] so they get the same
//! timeout and task audit trail as run work, under their own `act_` id.
//! Failures are reported in the [`ActionResult`], never raised.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::registry::PipelineServices;
use super::supervisor::{SwarmSupervisor, TaskOutcome};
use crate::config::PipelineConfig;
use crate::skills::TaskContext;
use crate::state::{generate_id, Batch, PipelineErrorRecord, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    /// Recompute one contact's readiness score
    ReScore,
    /// Look up research for one contact, generating it when missing
    ReResearch,
    /// Run QA over one contact's drafts
    RunQc,
    /// Score every contact in a batch
    ScoreBatch,
    /// Rewrite a batch's deliverable
    GenerateDeliverable,
    /// Review the batch before `batch_number`
    RunPreBrief,
}

impl AgentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReScore => "re_score",
            Self::ReResearch => "re_research",
            Self::RunQc => "run_qc",
            Self::ScoreBatch => "score_batch",
            Self::GenerateDeliverable => "generate_deliverable",
            Self::RunPreBrief => "run_pre_brief",
        }
    }
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to act on. Contact actions need `contact_id`, batch actions
/// `batch_id`, and `run_pre_brief` the upcoming `batch_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: AgentAction,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub batch_number: Option<u32>,
}

impl ActionRequest {
    pub fn for_contact(action: AgentAction, contact_id: &str) -> Self {
        Self {
            action,
            contact_id: Some(contact_id.to_string()),
            batch_id: None,
            batch_number: None,
        }
    }

    pub fn for_batch(action: AgentAction, batch_id: &str) -> Self {
        Self {
            action,
            contact_id: None,
            batch_id: Some(batch_id.to_string()),
            batch_number: None,
        }
    }

    fn contact(&self) -> Result<&str> {
        self.contact_id
            .as_deref()
            .ok_or_else(|| anyhow!("{} requires contact_id", self.action))
    }

    fn batch(&self) -> Result<&str> {
        self.batch_id
            .as_deref()
            .ok_or_else(|| anyhow!("{} requires batch_id", self.action))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Run id the action's tasks are recorded under
    pub action_id: String,
    pub action: AgentAction,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ActionResult {
    pub fn is_completed(&self) -> bool {
        self.status == ActionStatus::Completed
    }
}

/// Perform one action. Failures are logged to the error sink and returned
/// as a failed result.
#[tracing::instrument(skip_all, fields(action = %request.action))]
pub async fn run_action(services: &PipelineServices, request: &ActionRequest) -> ActionResult {
    let action_id = generate_id("act");
    let started_at = Utc::now();
    let outcome = perform(services, &action_id, request).await;
    let completed_at = Utc::now();

    match outcome {
        Ok(data) => {
            tracing::info!(action_id = %action_id, "agent action completed");
            ActionResult {
                action_id,
                action: request.action,
                status: ActionStatus::Completed,
                data: Some(data),
                error: None,
                started_at,
                completed_at,
            }
        }
        Err(e) => {
            let message = format!("{:#}", e);
            let mut record = PipelineErrorRecord::new(request.action.as_str(), message.clone())
                .with_agent("agent_action")
                .with_batch(request.batch_id.as_deref());
            if let Some(contact_id) = &request.contact_id {
                record = record.with_entity(contact_id);
            }
            services.errors.record(&record);
            ActionResult {
                action_id,
                action: request.action,
                status: ActionStatus::Failed,
                data: None,
                error: Some(message),
                started_at,
                completed_at,
            }
        }
    }
}

async fn perform(
    services: &PipelineServices,
    action_id: &str,
    request: &ActionRequest,
) -> Result<serde_json::Value> {
    let config = PipelineConfig {
        auto_research: request.action == AgentAction::ReResearch,
        ..PipelineConfig::default()
    };
    let mut ctx = TaskContext::new(action_id, 0, Arc::new(config));

    match request.action {
        AgentAction::ReScore => {
            let contact_id = request.contact()?;
            let scores = services
                .phases
                .score(&ctx, &[contact_id.to_string()])
                .await?;
            let score = scores
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("Contact not found: {}", contact_id))?;
            Ok(serde_json::to_value(score)?)
        }
        AgentAction::ReResearch => dispatch_one(services, ctx, TaskKind::Research, request).await,
        AgentAction::RunQc => dispatch_one(services, ctx, TaskKind::Qa, request).await,
        AgentAction::ScoreBatch => {
            let batch = load_batch(services, request.batch()?)?;
            let contacts = services.batches.list_contacts(&batch.id)?;
            ctx.batch_number = batch.batch_number;
            ctx.batch_id = Some(batch.id.clone());
            let scores = services.phases.score(&ctx, &contacts).await?;
            Ok(serde_json::json!({
                "batch_id": batch.id,
                "scored": scores.len(),
                "scores": scores,
            }))
        }
        AgentAction::GenerateDeliverable => {
            let batch = load_batch(services, request.batch()?)?;
            ctx.batch_number = batch.batch_number;
            ctx.batch_id = Some(batch.id);
            let deliverable = services.deliverables.generate(&ctx).await?;
            Ok(serde_json::to_value(deliverable)?)
        }
        AgentAction::RunPreBrief => {
            let batch_number = request
                .batch_number
                .ok_or_else(|| anyhow!("{} requires batch_number", request.action))?;
            if batch_number < 2 {
                bail!("batch {} has no predecessor to review", batch_number);
            }
            ctx.batch_number = batch_number;
            let brief = services.phases.pre_brief(&ctx).await?;
            Ok(serde_json::to_value(brief)?)
        }
    }
}

fn load_batch(services: &PipelineServices, batch_id: &str) -> Result<Batch> {
    services
        .batches
        .get_batch(batch_id)?
        .ok_or_else(|| anyhow!("Batch not found: {}", batch_id))
}

async fn dispatch_one(
    services: &PipelineServices,
    ctx: TaskContext,
    kind: TaskKind,
    request: &ActionRequest,
) -> Result<serde_json::Value> {
    let contact_id = request.contact()?;
    let supervisor = SwarmSupervisor::new(
        ctx,
        Arc::clone(&services.tasks),
        Arc::clone(&services.executor),
        Arc::clone(&services.errors),
    );
    let report = supervisor.run_phase(kind, &[contact_id.to_string()]).await?;

    let outcome = report
        .outcomes
        .get(contact_id)
        .ok_or_else(|| anyhow!("{} was not dispatched for {}", kind, contact_id))?;
    if let TaskOutcome::Error { error, .. } = outcome {
        bail!("{}", error);
    }
    let output = outcome
        .output()
        .ok_or_else(|| anyhow!("{} was skipped for {}", kind, contact_id))?;
    Ok(serde_json::to_value(output)?)
}
