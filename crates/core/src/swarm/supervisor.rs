//! # Swarm Supervisor
//!
//! Dispatches one kind of per-contact work across a set of contacts with
//! bounded parallelism. Every task is registered under its dedupe key first,
//! so re-running a phase never repeats completed work.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use super::bus::EventBus;
use super::events::{PipelineEvent, PipelineEventKind};
use super::phases::Phase;
use crate::skills::{TaskContext, TaskExecutor, TaskOutput};
use crate::state::{
    dedupe_key, ErrorSink, NewTask, PipelineErrorRecord, TaskKind, TaskRecord, TaskRegistration,
    TaskStatus, TaskStore,
};

/// Failures kept verbatim in a phase summary
pub const ERROR_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A task with the same dedupe key already exists in this run
    Duplicate,
    /// The run hit `max_tasks_per_run`
    TaskCap,
}

/// Per-entity result of a dispatched phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        task_id: String,
        output: TaskOutput,
        /// Satisfied by an earlier side effect without executing
        reused: bool,
    },
    Error {
        #[serde(default)]
        task_id: Option<String>,
        error: String,
    },
    Skipped {
        reason: SkipReason,
        #[serde(default)]
        task_id: Option<String>,
        /// Status of the task that owns the dedupe key
        #[serde(default)]
        previous: Option<TaskStatus>,
        #[serde(default)]
        output: Option<TaskOutput>,
    },
}

impl TaskOutcome {
    /// Completed now, or a duplicate of a completed task
    pub fn is_success(&self) -> bool {
        match self {
            Self::Completed { .. } => true,
            Self::Skipped {
                reason: SkipReason::Duplicate,
                previous: Some(TaskStatus::Completed),
                ..
            } => true,
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            Self::Completed { output, .. } => Some(output),
            Self::Skipped { output, .. } => output.as_ref(),
            Self::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityError {
    pub entity_id: String,
    pub error: String,
}

/// Counts for one dispatched phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub kind: TaskKind,
    pub total: usize,
    pub completed: usize,
    pub reused: usize,
    pub errors: usize,
    pub skipped: usize,
    /// Dispatcher invocations, including retries of errored entities
    pub attempts: u32,
    /// At most [`ERROR_SAMPLE_LIMIT`] failures
    pub error_sample: Vec<EntityError>,
}

impl PhaseSummary {
    fn from_outcomes(
        kind: TaskKind,
        entities: &[String],
        outcomes: &HashMap<String, TaskOutcome>,
        attempts: u32,
    ) -> Self {
        let mut summary = Self {
            kind,
            total: entities.len(),
            completed: 0,
            reused: 0,
            errors: 0,
            skipped: 0,
            attempts,
            error_sample: Vec::new(),
        };

        for entity in entities {
            match outcomes.get(entity) {
                Some(TaskOutcome::Completed { reused, .. }) => {
                    summary.completed += 1;
                    if *reused {
                        summary.reused += 1;
                    }
                }
                Some(TaskOutcome::Error { error, .. }) => {
                    summary.errors += 1;
                    if summary.error_sample.len() < ERROR_SAMPLE_LIMIT {
                        summary.error_sample.push(EntityError {
                            entity_id: entity.clone(),
                            error: error.clone(),
                        });
                    }
                }
                Some(TaskOutcome::Skipped { .. }) => summary.skipped += 1,
                None => {}
            }
        }
        summary
    }
}

/// Outcome map of one dispatched phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub kind: TaskKind,
    /// Submission order, duplicates removed
    pub entities: Vec<String>,
    pub outcomes: HashMap<String, TaskOutcome>,
    pub summary: PhaseSummary,
}

impl PhaseReport {
    /// Successful entities in submission order
    pub fn successful_ids(&self) -> Vec<String> {
        self.filter_ids(TaskOutcome::is_success)
    }

    /// Successful entities whose output passed its checks
    pub fn passing_ids(&self) -> Vec<String> {
        self.filter_ids(|o| o.is_success() && o.output().map_or(true, TaskOutput::passed))
    }

    pub fn errored_ids(&self) -> Vec<String> {
        self.filter_ids(TaskOutcome::is_error)
    }

    /// Outputs of successful entities in submission order
    pub fn outputs(&self) -> impl Iterator<Item = &TaskOutput> {
        self.entities
            .iter()
            .filter_map(|e| self.outcomes.get(e))
            .filter(|o| o.is_success())
            .filter_map(TaskOutcome::output)
    }

    fn filter_ids(&self, keep: impl Fn(&TaskOutcome) -> bool) -> Vec<String> {
        self.entities
            .iter()
            .filter(|e| self.outcomes.get(*e).is_some_and(&keep))
            .cloned()
            .collect()
    }

    /// Fold a retry pass into this report; later outcomes win
    pub fn merge(&mut self, retry: PhaseReport) {
        for (entity, outcome) in retry.outcomes {
            // A retried entity that is now a duplicate of its own errored task adds nothing
            if let Some(TaskOutcome::Error { .. }) = self.outcomes.get(&entity) {
                if matches!(outcome, TaskOutcome::Skipped { .. }) {
                    continue;
                }
            }
            self.outcomes.insert(entity, outcome);
        }
        self.summary = PhaseSummary::from_outcomes(
            self.kind,
            &self.entities,
            &self.outcomes,
            self.summary.attempts + 1,
        );
    }
}

/// Result of a research -> draft -> QA -> sequence pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub stages: Vec<PhaseReport>,
    /// Contacts that made it through every stage that ran
    pub survivors: Vec<String>,
    pub cancelled: bool,
}

enum Admission {
    Run(TaskRecord),
    Done(TaskOutcome),
}

/// Phase a task kind reports progress under
fn phase_of(kind: TaskKind) -> Option<Phase> {
    match kind {
        TaskKind::Research => Some(Phase::Research),
        TaskKind::Draft => Some(Phase::Messages),
        TaskKind::Qa => Some(Phase::Qc),
        TaskKind::Sequence => None,
    }
}

/// Bounded-concurrency task dispatcher for one run
pub struct SwarmSupervisor {
    ctx: TaskContext,
    tasks: Arc<dyn TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    errors: Arc<dyn ErrorSink>,
    bus: Option<Arc<EventBus>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl SwarmSupervisor {
    pub fn new(
        ctx: TaskContext,
        tasks: Arc<dyn TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            ctx,
            tasks,
            executor,
            errors,
            bus: None,
            cancel: None,
        }
    }

    /// Publish `task_completed` events on this bus
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Stop [`SwarmSupervisor::run_batch`] between stages once this flips to true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run one kind of work for every entity and wait for all of it.
    ///
    /// Entity failures never fail the call; they come back as
    /// [`TaskOutcome::Error`] and are recorded on the error sink.
    #[tracing::instrument(
        skip(self, entity_ids),
        fields(run_id = %self.ctx.run_id, kind = %kind, entities = entity_ids.len())
    )]
    pub async fn run_phase(&self, kind: TaskKind, entity_ids: &[String]) -> Result<PhaseReport> {
        let mut seen = HashSet::new();
        let entities: Vec<String> = entity_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let mut outcomes = HashMap::with_capacity(entities.len());
        let mut created = self.tasks.count_for_run(&self.ctx.run_id)?;
        let mut runnable = Vec::new();

        for entity in &entities {
            match self.admit(kind, entity, &mut created) {
                Ok(Admission::Run(task)) => runnable.push(task),
                Ok(Admission::Done(outcome)) => {
                    outcomes.insert(entity.clone(), outcome);
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    self.record_failure(kind, entity, &error);
                    outcomes.insert(
                        entity.clone(),
                        TaskOutcome::Error {
                            task_id: None,
                            error,
                        },
                    );
                }
            }
        }

        if !runnable.is_empty() {
            self.dispatch(kind, runnable, &mut outcomes).await?;
        }

        let summary = PhaseSummary::from_outcomes(kind, &entities, &outcomes, 1);
        tracing::info!(
            completed = summary.completed,
            reused = summary.reused,
            errors = summary.errors,
            skipped = summary.skipped,
            "phase dispatched"
        );

        Ok(PhaseReport {
            kind,
            entities,
            outcomes,
            summary,
        })
    }

    fn admit(&self, kind: TaskKind, entity: &str, created: &mut usize) -> Result<Admission> {
        let key = dedupe_key(kind, entity);
        let known = self.tasks.find_by_key(&self.ctx.run_id, &key)?;
        if known.is_none() && *created >= self.ctx.config.max_tasks_per_run {
            tracing::warn!(entity, cap = self.ctx.config.max_tasks_per_run, "task cap reached");
            return Ok(Admission::Done(TaskOutcome::Skipped {
                reason: SkipReason::TaskCap,
                task_id: None,
                previous: None,
                output: None,
            }));
        }

        let registration = self.tasks.register(NewTask {
            run_id: self.ctx.run_id.clone(),
            kind,
            entity_id: entity.to_string(),
            input: serde_json::json!({
                "entity_id": entity,
                "batch_id": self.ctx.batch_id,
            }),
            max_retries: self.ctx.config.retry_max,
        })?;

        Ok(match registration {
            TaskRegistration::Created(task) => {
                *created += 1;
                Admission::Run(task)
            }
            TaskRegistration::Retry(task) => {
                tracing::debug!(entity, retry = task.retry_count, "retrying errored task");
                Admission::Run(task)
            }
            TaskRegistration::Duplicate(task) => Admission::Done(TaskOutcome::Skipped {
                reason: SkipReason::Duplicate,
                task_id: Some(task.id),
                previous: Some(task.status),
                output: task.output.and_then(|v| serde_json::from_value(v).ok()),
            }),
        })
    }

    async fn dispatch(
        &self,
        kind: TaskKind,
        runnable: Vec<TaskRecord>,
        outcomes: &mut HashMap<String, TaskOutcome>,
    ) -> Result<()> {
        let workers = self.ctx.config.max_workers.min(runnable.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let limit = self.ctx.config.task_timeout();
        let pending: Vec<(String, String)> = runnable
            .iter()
            .map(|t| (t.entity_id.clone(), t.id.clone()))
            .collect();

        let mut join_set = JoinSet::new();

        // SCATTER: at most `workers` tasks in flight
        for task in runnable {
            let permit = semaphore.clone().acquire_owned().await?;
            let executor = Arc::clone(&self.executor);
            let tasks = Arc::clone(&self.tasks);
            let bus = self.bus.clone();
            let ctx = self.ctx.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let outcome =
                    execute_task(executor.as_ref(), tasks.as_ref(), &ctx, kind, &task, limit)
                        .await;
                if let Some(bus) = bus {
                    bus.emit(task_event(&ctx, kind, &task, &outcome));
                }
                (task.entity_id, outcome)
            });
        }

        // GATHER: full barrier before the next phase
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((entity, outcome)) => {
                    if let TaskOutcome::Error { error, .. } = &outcome {
                        self.record_failure(kind, &entity, error);
                    }
                    outcomes.insert(entity, outcome);
                }
                Err(e) => tracing::error!(error = %e, "task worker panicked"),
            }
        }

        for (entity, task_id) in pending {
            if outcomes.contains_key(&entity) {
                continue;
            }
            let error = "task worker aborted".to_string();
            if let Err(e) = self.tasks.fail(&task_id, &error) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to mark task as errored");
            }
            self.record_failure(kind, &entity, &error);
            outcomes.insert(
                entity,
                TaskOutcome::Error {
                    task_id: Some(task_id),
                    error,
                },
            );
        }

        Ok(())
    }

    fn record_failure(&self, kind: TaskKind, entity: &str, error: &str) {
        self.errors.record(
            &PipelineErrorRecord::new(kind.as_str(), error)
                .with_batch(self.ctx.batch_id.as_deref())
                .with_entity(entity)
                .with_agent(kind.agent_name())
                .with_context(serde_json::json!({ "run_id": self.ctx.run_id })),
        );
    }

    /// Research, draft, QA and sequence a set of contacts. Each stage only
    /// sees the previous stage's survivors; sequencing only sees contacts
    /// whose drafts passed QA.
    pub async fn run_batch(&self, contact_ids: &[String]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut survivors = contact_ids.to_vec();

        for kind in [
            TaskKind::Research,
            TaskKind::Draft,
            TaskKind::Qa,
            TaskKind::Sequence,
        ] {
            if self.is_cancelled() {
                tracing::info!(run_id = %self.ctx.run_id, next = %kind, "batch cancelled");
                report.cancelled = true;
                break;
            }
            if survivors.is_empty() {
                break;
            }

            let stage = self.run_phase(kind, &survivors).await?;
            survivors = match kind {
                TaskKind::Qa => stage.passing_ids(),
                _ => stage.successful_ids(),
            };
            report.stages.push(stage);
        }

        report.survivors = survivors;
        Ok(report)
    }
}

async fn execute_task(
    executor: &dyn TaskExecutor,
    tasks: &dyn TaskStore,
    ctx: &TaskContext,
    kind: TaskKind,
    task: &TaskRecord,
    limit: Duration,
) -> TaskOutcome {
    if let Err(e) = tasks.mark_running(&task.id) {
        tracing::warn!(task_id = %task.id, error = %e, "failed to mark task running");
    }

    let attempt = async {
        if let Some(output) = executor.existing_output(kind, &task.entity_id, ctx).await? {
            return Ok((output, true));
        }
        executor
            .execute(kind, &task.entity_id, ctx)
            .await
            .map(|output| (output, false))
    };

    let result = match tokio::time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("timed out after {}s", limit.as_secs())),
    };

    let stored = result.and_then(|(output, reused)| {
        let value = serde_json::to_value(&output)?;
        tasks.complete(&task.id, &value)?;
        Ok((output, reused))
    });

    match stored {
        Ok((output, reused)) => TaskOutcome::Completed {
            task_id: task.id.clone(),
            output,
            reused,
        },
        Err(e) => {
            let error = format!("{:#}", e);
            if let Err(store_err) = tasks.fail(&task.id, &error) {
                tracing::warn!(
                    task_id = %task.id,
                    error = %store_err,
                    "failed to mark task as errored"
                );
            }
            TaskOutcome::Error {
                task_id: Some(task.id.clone()),
                error,
            }
        }
    }
}

fn task_event(
    ctx: &TaskContext,
    kind: TaskKind,
    task: &TaskRecord,
    outcome: &TaskOutcome,
) -> PipelineEvent {
    let status = match outcome {
        TaskOutcome::Completed { .. } => "completed",
        TaskOutcome::Error { .. } => "error",
        TaskOutcome::Skipped { .. } => "skipped",
    };
    let mut event = PipelineEvent::new(PipelineEventKind::TaskCompleted, &ctx.run_id).with_data(
        serde_json::json!({
            "task_id": task.id,
            "task_kind": kind,
            "entity_id": task.entity_id,
            "status": status,
        }),
    );
    if let Some(phase) = phase_of(kind) {
        event = event.with_phase(phase);
    }
    event
}
