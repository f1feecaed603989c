//! # Pipeline Run Controller
//!
//! Drives one batch through the fixed phase order. The controller task owns
//! the [`Run`] state; everyone else sees it through published snapshots and
//! reaches it only through the cancel and approval channels.
//!
//! ```text
//! initialize → pre_brief → extract → research → score → ab_assign
//!   → messages → qc → approval → generate_deliverable → finalize
//! ```

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::bus::EventBus;
use super::events::{PipelineEvent, PipelineEventKind};
use super::phases::{
    ApprovalDecisions, ApprovalMode, ApprovalTally, Decision, Phase, PhaseOutcome, Run,
    RunSnapshot, RunStatus,
};
use super::registry::PipelineServices;
use super::supervisor::{PhaseReport, SwarmSupervisor};
use crate::config::PipelineConfig;
use crate::error::RunError;
use crate::skills::{QcFlag, TaskContext, TaskOutput};
use crate::state::{
    ApprovalStatus, BatchStatus, Draft, PipelineErrorRecord, Severity, TaskKind,
};

/// Flagged QC items included in an `approval_needed` event
pub const APPROVAL_FLAG_SAMPLE: usize = 10;

/// What a reviewer sends to a run waiting at the approval gate
#[derive(Debug, Clone)]
pub enum ApprovalCommand {
    Decide(ApprovalDecisions),
    /// Approve everything without review
    Skip,
}

/// Why the phase loop stopped early
enum Interrupt {
    Failed(anyhow::Error),
    ApprovalTimedOut,
    Cancelled,
}

impl From<anyhow::Error> for Interrupt {
    fn from(e: anyhow::Error) -> Self {
        Interrupt::Failed(e)
    }
}

/// Channels the registry keeps for a spawned run
pub(crate) struct RunChannels {
    pub state: watch::Sender<RunSnapshot>,
    pub cancel: watch::Receiver<bool>,
    pub approvals: mpsc::Receiver<ApprovalCommand>,
}

/// Controller for a single pipeline run
pub(crate) struct PipelineRun {
    run: Run,
    ctx: TaskContext,
    services: PipelineServices,
    bus: Arc<EventBus>,
    state_tx: watch::Sender<RunSnapshot>,
    cancel_rx: watch::Receiver<bool>,
    approval_rx: mpsc::Receiver<ApprovalCommand>,
}

impl PipelineRun {
    pub fn new(
        run: Run,
        config: Arc<PipelineConfig>,
        services: PipelineServices,
        bus: Arc<EventBus>,
        channels: RunChannels,
    ) -> Self {
        let ctx = TaskContext::new(&run.run_id, run.batch_number, config);
        Self {
            run,
            ctx,
            services,
            bus,
            state_tx: channels.state,
            cancel_rx: channels.cancel,
            approval_rx: channels.approvals,
        }
    }

    /// Run every phase to a terminal state and return the final snapshot
    #[tracing::instrument(
        skip(self),
        fields(run_id = %self.run.run_id, batch = self.run.batch_number)
    )]
    pub async fn execute(mut self) -> RunSnapshot {
        self.run.start();
        self.publish();
        self.emit(
            PipelineEvent::new(PipelineEventKind::RunStarted, &self.run.run_id).with_data(
                serde_json::json!({ "batch_number": self.run.batch_number }),
            ),
        );
        tracing::info!("pipeline run started");

        let mut halted = None;
        for phase in Phase::ALL {
            if self.cancel_requested() {
                halted = Some((phase, Interrupt::Cancelled));
                break;
            }

            self.run.enter(phase);
            self.publish();
            self.emit(self.event(PipelineEventKind::PhaseStarted).with_phase(phase));
            tracing::info!(phase = %phase, "phase started");

            match self.run_phase(phase).await {
                Ok(outcome) => {
                    let data = serde_json::to_value(&outcome).ok();
                    self.run.record(phase, outcome);
                    self.publish();
                    let mut event = self
                        .event(PipelineEventKind::PhaseCompleted)
                        .with_phase(phase);
                    if let Some(data) = data {
                        event = event.with_data(data);
                    }
                    self.emit(event);
                    tracing::info!(
                        phase = %phase,
                        contacts = self.run.contact_ids.len(),
                        "phase completed"
                    );
                }
                Err(interrupt) => {
                    halted = Some((phase, interrupt));
                    break;
                }
            }
        }

        match halted {
            None => self.complete(),
            Some((phase, Interrupt::Cancelled)) => self.cancel(phase),
            Some((_, Interrupt::ApprovalTimedOut)) => self.fail(RunError::approval_timed_out()),
            Some((phase, Interrupt::Failed(e))) => self.fail(RunError::phase_failed(phase, &e)),
        }

        self.bus.close(&self.run.run_id);
        self.run.snapshot()
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<PhaseOutcome, Interrupt> {
        let outcome = match phase {
            Phase::Initialize => {
                let batch = self
                    .services
                    .batches
                    .create_batch(self.run.batch_number, &self.ctx.config)?;
                self.run.batch_id = Some(batch.id.clone());
                self.ctx.batch_id = Some(batch.id.clone());
                PhaseOutcome::Initialized { batch_id: batch.id }
            }
            Phase::PreBrief => {
                if self.run.batch_number <= 1 {
                    PhaseOutcome::Skipped {
                        reason: "first batch has no predecessor".to_string(),
                    }
                } else {
                    PhaseOutcome::PreBriefed(self.services.phases.pre_brief(&self.ctx).await?)
                }
            }
            Phase::Extract => {
                let ids = self.services.phases.extract(&self.ctx).await?;
                self.services
                    .batches
                    .add_contacts(self.ctx.require_batch()?, &ids)?;
                self.run.contact_ids = ids;
                PhaseOutcome::Extracted {
                    contact_count: self.run.contact_ids.len(),
                }
            }
            Phase::Research => {
                let report = self.dispatch(TaskKind::Research).await?;
                self.run.contact_ids = report.successful_ids();
                PhaseOutcome::Dispatched(report.summary)
            }
            Phase::Score => {
                let scores = self
                    .services
                    .phases
                    .score(&self.ctx, &self.run.contact_ids)
                    .await?;
                PhaseOutcome::Scored {
                    scored: scores.len(),
                }
            }
            Phase::AbAssign => {
                let groups = self
                    .services
                    .phases
                    .assign_experiments(&self.ctx, &self.run.contact_ids)
                    .await?;
                PhaseOutcome::Assigned {
                    groups: groups
                        .into_iter()
                        .map(|(group, members)| (group, members.len()))
                        .collect::<BTreeMap<_, _>>(),
                }
            }
            Phase::Messages => {
                if !self.ctx.config.auto_messages {
                    PhaseOutcome::Skipped {
                        reason: "messages are pre-supplied".to_string(),
                    }
                } else {
                    let report = self.dispatch(TaskKind::Draft).await?;
                    self.run.contact_ids = report.successful_ids();
                    PhaseOutcome::Dispatched(report.summary)
                }
            }
            Phase::Qc => {
                let report = self.dispatch(TaskKind::Qa).await?;
                let passing = report.passing_ids();
                let successful = report.successful_ids();
                let flags: Vec<QcFlag> = report
                    .outputs()
                    .filter_map(|output| match output {
                        TaskOutput::Qa(qa) => Some(qa.flags.clone()),
                        _ => None,
                    })
                    .flatten()
                    .collect();
                let outcome = PhaseOutcome::QualityChecked {
                    summary: report.summary,
                    passed: passing.len(),
                    flagged: successful.len() - passing.len(),
                    flags,
                };
                self.run.contact_ids = successful;
                outcome
            }
            Phase::Approval => self.approval_gate().await?,
            Phase::GenerateDeliverable => {
                PhaseOutcome::Deliverable(self.services.deliverables.generate(&self.ctx).await?)
            }
            Phase::Finalize => {
                let report = self.dispatch(TaskKind::Sequence).await?;
                self.services
                    .phases
                    .finalize(&self.ctx, &self.run.contact_ids)
                    .await?;
                self.services
                    .batches
                    .update_status(self.ctx.require_batch()?, BatchStatus::Complete)?;
                PhaseOutcome::Finalized {
                    contact_count: self.run.contact_ids.len(),
                    sequenced: report.summary.completed,
                }
            }
        };
        Ok(outcome)
    }

    /// Dispatch one kind of work over the current contacts, re-dispatching
    /// errored entities while the retry budget lasts
    async fn dispatch(&self, kind: TaskKind) -> Result<PhaseReport> {
        let supervisor = SwarmSupervisor::new(
            self.ctx.clone(),
            Arc::clone(&self.services.tasks),
            Arc::clone(&self.services.executor),
            Arc::clone(&self.services.errors),
        )
        .with_bus(Arc::clone(&self.bus));

        let mut report = supervisor.run_phase(kind, &self.run.contact_ids).await?;
        for attempt in 1..=self.ctx.config.retry_max {
            let errored = report.errored_ids();
            if errored.is_empty() {
                break;
            }
            tracing::info!(
                kind = %kind,
                attempt,
                retrying = errored.len(),
                "retrying errored entities"
            );
            let retry = supervisor.run_phase(kind, &errored).await?;
            report.merge(retry);
        }
        Ok(report)
    }

    // === Approval gate ===

    async fn approval_gate(&mut self) -> Result<PhaseOutcome, Interrupt> {
        let batch_id = self.ctx.require_batch()?.to_string();
        let artifacts = self.services.batches.list_artifacts(&batch_id)?;
        self.run.artifact_ids = artifacts.iter().map(|d| d.id.clone()).collect();

        if !self.ctx.config.require_approval {
            let (tally, withheld) = self.apply_decisions(&artifacts, &ApprovalDecisions::new())?;
            return Ok(PhaseOutcome::Approval {
                mode: ApprovalMode::Auto,
                tally,
                withheld,
            });
        }

        self.run.status = RunStatus::ApprovalNeeded;
        self.publish();
        self.emit(
            self.event(PipelineEventKind::ApprovalNeeded)
                .with_phase(Phase::Approval)
                .with_data(self.approval_summary()),
        );
        tracing::info!(
            artifacts = self.run.artifact_ids.len(),
            timeout_secs = self.ctx.config.approval_timeout_secs,
            "waiting for approval"
        );

        let command = self.await_decision().await?;
        let (mode, decisions) = match command {
            ApprovalCommand::Decide(decisions) => (ApprovalMode::Manual, decisions),
            ApprovalCommand::Skip => (ApprovalMode::Skipped, ApprovalDecisions::new()),
        };
        let (tally, withheld) = self.apply_decisions(&artifacts, &decisions)?;
        self.run.approval_decisions = decisions;

        self.run.status = RunStatus::Running;
        self.publish();
        self.emit(
            self.event(PipelineEventKind::ApprovalResolved)
                .with_phase(Phase::Approval)
                .with_data(serde_json::json!({
                    "mode": mode,
                    "tally": tally,
                    "withheld": withheld,
                })),
        );
        tracing::info!(
            approved = tally.approved,
            rejected = tally.rejected,
            edit_requested = tally.edit_requested,
            withheld = withheld.len(),
            "approval resolved"
        );

        Ok(PhaseOutcome::Approval {
            mode,
            tally,
            withheld,
        })
    }

    /// Block until a reviewer acts, the run is cancelled or the gate times out
    async fn await_decision(&mut self) -> Result<ApprovalCommand, Interrupt> {
        let deadline = tokio::time::sleep(self.ctx.config.approval_timeout());
        tokio::pin!(deadline);
        let mut approvals_open = true;
        let mut cancel_open = true;

        loop {
            if *self.cancel_rx.borrow_and_update() {
                self.run.cancel_requested = true;
                return Err(Interrupt::Cancelled);
            }

            tokio::select! {
                command = self.approval_rx.recv(), if approvals_open => match command {
                    Some(command) => return Ok(command),
                    None => approvals_open = false,
                },
                changed = self.cancel_rx.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
                _ = &mut deadline => {
                    tracing::warn!("approval timed out");
                    return Err(Interrupt::ApprovalTimedOut);
                }
            }
        }
    }

    /// Mark every artifact; artifacts without a decision are approved.
    /// Contacts with drafts under review but none approved leave the run and
    /// are returned.
    fn apply_decisions(
        &mut self,
        artifacts: &[Draft],
        decisions: &ApprovalDecisions,
    ) -> Result<(ApprovalTally, Vec<String>)> {
        let mut tally = ApprovalTally::default();
        let known: HashSet<&str> = artifacts.iter().map(|d| d.id.as_str()).collect();
        tally.ignored = decisions
            .keys()
            .filter(|id| !known.contains(id.as_str()))
            .count();
        if tally.ignored > 0 {
            tracing::warn!(ignored = tally.ignored, "decisions for unknown artifacts ignored");
        }

        let mut reviewed = HashSet::new();
        let mut approved = HashSet::new();
        for artifact in artifacts {
            let status = match decisions.get(&artifact.id) {
                None | Some(Decision::Approve) => {
                    tally.approved += 1;
                    ApprovalStatus::Approved
                }
                Some(Decision::Reject) => {
                    tally.rejected += 1;
                    ApprovalStatus::Rejected
                }
                Some(Decision::Edit) => {
                    tally.edit_requested += 1;
                    ApprovalStatus::EditRequested
                }
            };
            self.services
                .batches
                .set_artifact_status(&artifact.id, status)?;
            reviewed.insert(artifact.contact_id.as_str());
            if status == ApprovalStatus::Approved {
                approved.insert(artifact.contact_id.as_str());
            }
        }

        let withheld: Vec<String> = self
            .run
            .contact_ids
            .iter()
            .filter(|id| reviewed.contains(id.as_str()) && !approved.contains(id.as_str()))
            .cloned()
            .collect();
        if !withheld.is_empty() {
            self.run.contact_ids.retain(|id| !withheld.contains(id));
            tracing::info!(withheld = withheld.len(), "contacts held back at approval");
        }
        Ok((tally, withheld))
    }

    fn approval_summary(&self) -> serde_json::Value {
        let (passed, flagged, flags) = match self.recorded(Phase::Qc) {
            Some(PhaseOutcome::QualityChecked {
                passed,
                flagged,
                flags,
                ..
            }) => (*passed, *flagged, flags.as_slice()),
            _ => (0, 0, &[][..]),
        };
        serde_json::json!({
            "artifact_count": self.run.artifact_ids.len(),
            "qc_passed": passed,
            "qc_flagged": flagged,
            "flag_count": flags.len(),
            "flags": &flags[..flags.len().min(APPROVAL_FLAG_SAMPLE)],
            "timeout_secs": self.ctx.config.approval_timeout_secs,
        })
    }

    fn recorded(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.run
            .phase_results
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }

    // === Terminal transitions ===

    fn complete(&mut self) {
        if self.run.finish(RunStatus::Completed, None) {
            self.publish();
            self.emit(
                self.event(PipelineEventKind::RunCompleted).with_data(serde_json::json!({
                    "contact_count": self.run.contact_ids.len(),
                    "elapsed_seconds": self.run.snapshot().elapsed_seconds,
                })),
            );
            tracing::info!(contacts = self.run.contact_ids.len(), "pipeline run completed");
        }
    }

    fn fail(&mut self, error: RunError) {
        tracing::error!(phase = %error.phase, error = %error.message, "pipeline run failed");
        self.services.errors.record(
            &PipelineErrorRecord::new(error.phase.as_str(), &error.message)
                .with_batch(self.run.batch_id.as_deref())
                .with_severity(Severity::Critical)
                .with_context(serde_json::json!({
                    "run_id": self.run.run_id,
                    "kind": error.kind,
                })),
        );
        self.mark_batch(BatchStatus::Failed);

        let data = serde_json::to_value(&error).ok();
        if self.run.finish(RunStatus::Failed, Some(error)) {
            self.publish();
            let mut event = self.event(PipelineEventKind::RunFailed);
            if let Some(data) = data {
                event = event.with_data(data);
            }
            self.emit(event);
        }
    }

    fn cancel(&mut self, next: Phase) {
        self.run.cancel_requested = true;
        self.mark_batch(BatchStatus::Cancelled);
        if self.run.finish(RunStatus::Cancelled, None) {
            self.publish();
            self.emit(
                self.event(PipelineEventKind::RunCancelled)
                    .with_data(serde_json::json!({ "next_phase": next })),
            );
            tracing::info!(next_phase = %next, "pipeline run cancelled");
        }
    }

    fn mark_batch(&self, status: BatchStatus) {
        let Some(batch_id) = self.run.batch_id.as_deref() else {
            return;
        };
        if let Err(e) = self.services.batches.update_status(batch_id, status) {
            tracing::warn!(batch_id, error = %e, "failed to update batch status");
        }
    }

    // === Publishing ===

    fn cancel_requested(&mut self) -> bool {
        if *self.cancel_rx.borrow() {
            self.run.cancel_requested = true;
        }
        self.run.cancel_requested
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.run.snapshot());
    }

    fn event(&self, kind: PipelineEventKind) -> PipelineEvent {
        PipelineEvent::new(kind, &self.run.run_id)
    }

    fn emit(&self, event: PipelineEvent) {
        self.bus.emit(event);
    }
}
