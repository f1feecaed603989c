//! # Run Registry
//!
//! Process-wide table of pipeline runs. Starting a run spawns its controller
//! on the tokio runtime; every other entry point only reads snapshots or
//! signals the run through its channels.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};

use super::actions::{self, ActionRequest, ActionResult};
use super::bus::{EventBus, Subscription};
use super::phases::{ApprovalDecisions, Run, RunSnapshot, RunStatus};
use super::runner::{ApprovalCommand, PipelineRun, RunChannels};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::skills::{BuiltinSkills, DeliverableGenerator, PhaseFunctions, TaskExecutor};
use crate::state::{
    generate_id, BatchManager, BatchStore, ErrorLog, ErrorSink, OutreachDb, TaskManager,
    TaskStore,
};

/// Collaborators shared by every run
#[derive(Clone)]
pub struct PipelineServices {
    pub batches: Arc<dyn BatchStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub errors: Arc<dyn ErrorSink>,
    pub executor: Arc<dyn TaskExecutor>,
    pub phases: Arc<dyn PhaseFunctions>,
    pub deliverables: Arc<dyn DeliverableGenerator>,
}

impl PipelineServices {
    /// Database-backed stores and the builtin skills
    pub fn builtin(db: &OutreachDb, output_dir: impl Into<PathBuf>) -> Self {
        let skills = Arc::new(BuiltinSkills::new(db, output_dir));
        Self {
            batches: Arc::new(BatchManager::new(db)),
            tasks: Arc::new(TaskManager::new(db)),
            errors: Arc::new(ErrorLog::new(db)),
            executor: skills.clone(),
            phases: skills.clone(),
            deliverables: skills,
        }
    }
}

/// Caller-side handle to a spawned run
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub batch_number: u32,
    state: watch::Receiver<RunSnapshot>,
    cancel: watch::Sender<bool>,
    approvals: mpsc::Sender<ApprovalCommand>,
}

impl RunHandle {
    /// Latest published snapshot. Never blocks.
    pub fn snapshot(&self) -> RunSnapshot {
        self.state.borrow().clone()
    }

    /// Resolve once the run reaches `completed`, `failed` or `cancelled`
    pub async fn wait_for_terminal(&self) -> RunSnapshot {
        let mut rx = self.state.clone();
        let result = rx.wait_for(|s| s.status.is_terminal()).await.map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }

    fn send_approval(&self, command: ApprovalCommand) -> bool {
        if self.snapshot().status != RunStatus::ApprovalNeeded {
            return false;
        }
        match self.approvals.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "approval not delivered");
                false
            }
        }
    }
}

/// Registry of pipeline runs
pub struct RunRegistry {
    runs: RwLock<HashMap<String, RunHandle>>,
    services: PipelineServices,
    bus: Arc<EventBus>,
}

impl RunRegistry {
    pub fn new(services: PipelineServices, bus: Arc<EventBus>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            services,
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RunHandle>> {
        self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RunHandle>> {
        self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate, register and spawn a run. Returns the initial snapshot;
    /// progress is observed through [`RunRegistry::subscribe`] or polling.
    #[tracing::instrument(skip(self, config), fields(batch = batch_number))]
    pub fn start_run(
        &self,
        batch_number: u32,
        config: PipelineConfig,
    ) -> Result<RunSnapshot, PipelineError> {
        if batch_number < 1 {
            return Err(PipelineError::InvalidBatchNumber(batch_number));
        }
        config.validate()?;

        let mut runs = self.write();
        let in_flight = runs
            .values()
            .any(|h| h.batch_number == batch_number && !h.snapshot().status.is_terminal());
        if in_flight || self.services.batches.batch_number_exists(batch_number)? {
            return Err(PipelineError::BatchExists(batch_number));
        }

        let run = Run::new(generate_id("prun"), batch_number);
        let initial = run.snapshot();
        let (state_tx, state_rx) = watch::channel(initial.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (approval_tx, approval_rx) = mpsc::channel(1);

        let handle = RunHandle {
            run_id: initial.run_id.clone(),
            batch_number,
            state: state_rx,
            cancel: cancel_tx,
            approvals: approval_tx,
        };
        runs.insert(initial.run_id.clone(), handle);
        drop(runs);

        let controller = PipelineRun::new(
            run,
            Arc::new(config),
            self.services.clone(),
            Arc::clone(&self.bus),
            RunChannels {
                state: state_tx,
                cancel: cancel_rx,
                approvals: approval_rx,
            },
        );
        tokio::spawn(controller.execute());

        tracing::info!(run_id = %initial.run_id, "pipeline run registered");
        Ok(initial)
    }

    pub fn handle(&self, run_id: &str) -> Option<RunHandle> {
        self.read().get(run_id).cloned()
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunSnapshot> {
        self.read().get(run_id).map(RunHandle::snapshot)
    }

    /// Every known run, newest first
    pub fn list_runs(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self.read().values().map(RunHandle::snapshot).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// Request cancellation. Idempotent; false for unknown or finished runs.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let Some(handle) = self.handle(run_id) else {
            return false;
        };
        if handle.snapshot().status.is_terminal() {
            return false;
        }
        handle.cancel.send_replace(true);
        tracing::info!(run_id, "cancellation requested");
        true
    }

    /// Resolve the approval gate with a decision map. False unless the run
    /// is waiting for approval.
    pub fn submit_approval(&self, run_id: &str, decisions: ApprovalDecisions) -> bool {
        self.handle(run_id)
            .is_some_and(|h| h.send_approval(ApprovalCommand::Decide(decisions)))
    }

    /// Approve everything at the gate without review
    pub fn skip_approval(&self, run_id: &str) -> bool {
        self.handle(run_id)
            .is_some_and(|h| h.send_approval(ApprovalCommand::Skip))
    }

    /// Subscribe to a run's events; the first event is its snapshot
    pub fn subscribe(&self, run_id: &str) -> Result<Subscription, PipelineError> {
        let handle = self
            .handle(run_id)
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;
        Ok(self.bus.subscribe(run_id, || handle.snapshot()))
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.bus.unsubscribe(&subscription.run_id, subscription.id);
    }

    /// One-off action on a contact or batch with the shared services
    pub async fn run_action(&self, request: &ActionRequest) -> ActionResult {
        actions::run_action(&self.services, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Prospect;
    use crate::error::RunErrorKind;
    use crate::state::{ApprovalStatus, DraftManager};
    use crate::swarm::events::PipelineEventKind;
    use crate::swarm::phases::{ApprovalMode, Decision, Phase, PhaseOutcome};
    use crate::testing::{seed_contacts, FakeDeliverables, FakeExecutor, FakePhases};
    use std::time::Duration;
    use tokio_test::assert_ok;

    struct Harness {
        db: OutreachDb,
        contacts: Vec<String>,
        phases: Arc<FakePhases>,
        registry: RunRegistry,
    }

    /// Seed `n` contacts and build the fakes around their ids
    fn harness<F>(n: usize, fakes: F) -> Harness
    where
        F: FnOnce(&OutreachDb, &[String]) -> (FakeExecutor, FakePhases),
    {
        let db = OutreachDb::open_in_memory().unwrap();
        let contacts = seed_contacts(&db, n);
        let (executor, phases) = fakes(&db, &contacts);

        let phases = Arc::new(phases);
        let services = PipelineServices {
            batches: Arc::new(BatchManager::new(&db)),
            tasks: Arc::new(TaskManager::new(&db)),
            errors: Arc::new(ErrorLog::new(&db)),
            executor: Arc::new(executor),
            phases: phases.clone(),
            deliverables: Arc::new(FakeDeliverables::default()),
        };
        Harness {
            db,
            contacts,
            phases,
            registry: RunRegistry::new(services, Arc::new(EventBus::default())),
        }
    }

    fn plain(n: usize) -> Harness {
        harness(n, |_, contacts| {
            (FakeExecutor::new(), FakePhases::new(contacts.to_vec()))
        })
    }

    fn manual() -> PipelineConfig {
        PipelineConfig {
            require_approval: true,
            ..PipelineConfig::default()
        }
    }

    async fn wait_for_status(handle: &RunHandle, status: RunStatus) -> RunSnapshot {
        let mut rx = handle.state.clone();
        let snapshot = rx
            .wait_for(|s| s.status == status || s.status.is_terminal())
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.status, status);
        snapshot
    }

    #[tokio::test]
    async fn test_run_completes_all_phases() {
        let h = plain(3);
        let started = h.registry.start_run(2, PipelineConfig::default()).unwrap();
        assert_eq!(started.status, RunStatus::Pending);

        let handle = h.registry.handle(&started.run_id).unwrap();
        let done = handle.wait_for_terminal().await;
        assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error);
        assert_eq!(done.phase_results.len(), Phase::ALL.len());
        assert_eq!(done.progress_pct, 100.0);
        assert_eq!(done.contact_ids, h.contacts);
        assert!(matches!(
            done.outcome(Phase::Approval),
            Some(PhaseOutcome::Approval {
                mode: ApprovalMode::Auto,
                ..
            })
        ));
        assert!(done.approval_decisions.is_empty());
        assert_eq!(h.phases.pre_briefs.load(std::sync::atomic::Ordering::SeqCst), 1);

        let batches = BatchManager::new(&h.db);
        let batch = batches.get_by_number(2).unwrap().unwrap();
        assert_eq!(batch.status, crate::state::BatchStatus::Complete);
        assert_eq!(batches.list_contacts(&batch.id).unwrap(), h.contacts);
    }

    #[tokio::test]
    async fn test_first_batch_skips_pre_brief() {
        let h = plain(1);
        let started = h.registry.start_run(1, PipelineConfig::default()).unwrap();
        let done = h.registry.handle(&started.run_id).unwrap().wait_for_terminal().await;

        assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error);
        assert!(matches!(
            done.outcome(Phase::PreBrief),
            Some(PhaseOutcome::Skipped { .. })
        ));
        assert_eq!(h.phases.pre_briefs.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_phase_index_is_monotonic() {
        let h = plain(4);
        let started = h.registry.start_run(1, PipelineConfig::default()).unwrap();
        let mut rx = h.registry.handle(&started.run_id).unwrap().state.clone();

        let mut seen = vec![rx.borrow_and_update().current_phase_index];
        let last = loop {
            if rx.changed().await.is_err() {
                break rx.borrow().clone();
            }
            let snap = rx.borrow_and_update().clone();
            seen.push(snap.current_phase_index);
            if snap.status.is_terminal() {
                break snap;
            }
        };

        assert_eq!(last.status, RunStatus::Completed, "{:?}", last.error);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
        assert_eq!(seen.last().copied(), Some(Phase::ALL.len()));
    }

    #[tokio::test]
    async fn test_partial_failures_do_not_abort_run() {
        let h = harness(10, |_, contacts| {
            (
                FakeExecutor::new().failing(&[&contacts[3], &contacts[7]]),
                FakePhases::new(contacts.to_vec()),
            )
        });
        let started = h.registry.start_run(1, PipelineConfig::default()).unwrap();
        let done = h.registry.handle(&started.run_id).unwrap().wait_for_terminal().await;

        assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error);
        let scored = h.phases.scored_ids().unwrap();
        assert_eq!(scored.len(), 8);
        assert!(!scored.contains(&h.contacts[3]));
        assert!(!scored.contains(&h.contacts[7]));
        assert_eq!(
            done.outcome(Phase::Score),
            Some(&PhaseOutcome::Scored { scored: 8 })
        );

        let Some(PhaseOutcome::Dispatched(summary)) = done.outcome(Phase::Research) else {
            panic!("research was not dispatched");
        };
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.attempts, 3);
        assert_eq!(done.phase_entities["research"].len(), 8);
        assert_eq!(done.contact_ids.len(), 8);
    }

    #[tokio::test]
    async fn test_phase_error_fails_run() {
        let h = harness(2, |_, contacts| {
            (
                FakeExecutor::new(),
                FakePhases::new(contacts.to_vec()).failing_in(Phase::Score),
            )
        });
        let started = h.registry.start_run(1, PipelineConfig::default()).unwrap();
        let done = h.registry.handle(&started.run_id).unwrap().wait_for_terminal().await;

        assert_eq!(done.status, RunStatus::Failed);
        let error = done.error.as_ref().unwrap();
        assert_eq!(error.kind, RunErrorKind::PhaseFailed);
        assert_eq!(error.phase, Phase::Score);
        assert!(error.message.contains("exploded"));
        assert!(done.outcome(Phase::Research).is_some());
        assert!(done.outcome(Phase::AbAssign).is_none());

        let logged = ErrorLog::new(&h.db).list_recent(None, 10).unwrap();
        assert!(logged.iter().any(|e| e.phase == "score"));
    }

    #[tokio::test]
    async fn test_cancel_prevents_new_phases() {
        let h = harness(2, |_, contacts| {
            (
                FakeExecutor::new(),
                FakePhases::new(contacts.to_vec()).with_delay(Duration::from_millis(50)),
            )
        });
        let started = h.registry.start_run(1, PipelineConfig::default()).unwrap();
        let handle = h.registry.handle(&started.run_id).unwrap();

        let mut rx = handle.state.clone();
        rx.wait_for(|s| s.current_phase == Some(Phase::Extract))
            .await
            .unwrap();
        assert!(h.registry.cancel_run(&started.run_id));
        assert!(h.registry.cancel_run(&started.run_id));

        let done = handle.wait_for_terminal().await;
        assert_eq!(done.status, RunStatus::Cancelled);
        assert!(done.cancel_requested);
        assert!(done.error.is_none());
        assert!(done.outcome(Phase::Initialize).is_some());
        assert!(done.outcome(Phase::Research).is_none());
        assert!(h.phases.scored_ids().is_none());
        assert!(!h.registry.cancel_run(&started.run_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_timeout_fails_run() {
        let h = plain(2);
        let config = PipelineConfig {
            approval_timeout_secs: 60,
            ..manual()
        };
        let started = h.registry.start_run(1, config).unwrap();
        let done = h.registry.handle(&started.run_id).unwrap().wait_for_terminal().await;

        assert_eq!(done.status, RunStatus::Failed);
        let error = done.error.as_ref().unwrap();
        assert_eq!(error.kind, RunErrorKind::ApprovalTimedOut);
        assert_eq!(error.message, crate::error::APPROVAL_TIMED_OUT);
        assert!(done.outcome(Phase::Qc).is_some());
        assert!(done.outcome(Phase::Approval).is_none());
        assert!(done.outcome(Phase::GenerateDeliverable).is_none());
    }

    #[tokio::test]
    async fn test_one_reject_of_three_artifacts() {
        let h = harness(3, |db, contacts| {
            (
                FakeExecutor::new(),
                FakePhases::new(contacts.to_vec()).with_artifacts(DraftManager::new(db)),
            )
        });

        let started = h.registry.start_run(1, manual()).unwrap();
        let handle = h.registry.handle(&started.run_id).unwrap();
        let waiting = wait_for_status(&handle, RunStatus::ApprovalNeeded).await;
        assert_eq!(waiting.artifact_ids.len(), 3);

        let rejected = waiting.artifact_ids[1].clone();
        let decisions = ApprovalDecisions::from([(rejected.clone(), Decision::Reject)]);
        assert!(h.registry.submit_approval(&started.run_id, decisions.clone()));

        let done = handle.wait_for_terminal().await;
        assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error);
        let Some(PhaseOutcome::Approval {
            mode,
            tally,
            withheld,
        }) = done.outcome(Phase::Approval)
        else {
            panic!("approval outcome missing");
        };
        assert_eq!(*mode, ApprovalMode::Manual);
        assert_eq!((tally.approved, tally.rejected), (2, 1));
        assert!(done.outcome(Phase::GenerateDeliverable).is_some());
        assert_eq!(done.approval_decisions, decisions);

        let drafts = DraftManager::new(&h.db);
        let rejected_contact = drafts.get(&rejected).unwrap().unwrap().contact_id;
        assert_eq!(withheld, &vec![rejected_contact.clone()]);
        assert!(!done.contact_ids.contains(&rejected_contact));
        assert_eq!(
            done.outcome(Phase::Finalize),
            Some(&PhaseOutcome::Finalized {
                contact_count: 2,
                sequenced: 2,
            })
        );

        for id in &waiting.artifact_ids {
            let status = drafts.get(id).unwrap().unwrap().approval_status;
            if *id == rejected {
                assert_eq!(status, ApprovalStatus::Rejected);
            } else {
                assert_eq!(status, ApprovalStatus::Approved);
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_contact_gets_no_followups() {
        let dir = tempfile::tempdir().unwrap();
        let db = OutreachDb::open_in_memory().unwrap();
        let registry = RunRegistry::new(
            PipelineServices::builtin(&db, dir.path()),
            Arc::new(EventBus::default()),
        );
        let prospect = |first: &str, email: &str| Prospect {
            first_name: first.to_string(),
            last_name: "Test".to_string(),
            company: Some("Acme".to_string()),
            title: Some("VP Engineering".to_string()),
            email: Some(email.to_string()),
            ..Default::default()
        };
        let config = PipelineConfig {
            auto_research: true,
            auto_messages: true,
            prospects: vec![
                prospect("Grace", "grace@example.com"),
                prospect("Edsger", "edsger@example.com"),
            ],
            ..manual()
        };

        let started = registry.start_run(1, config).unwrap();
        let handle = registry.handle(&started.run_id).unwrap();
        let waiting = wait_for_status(&handle, RunStatus::ApprovalNeeded).await;
        let (dropped, kept) = (&waiting.contact_ids[0], &waiting.contact_ids[1]);

        let drafts = DraftManager::new(&db);
        let dropped_drafts = drafts.list_for_contact(dropped).unwrap();
        assert!(!dropped_drafts.is_empty());
        let decisions: ApprovalDecisions = dropped_drafts
            .iter()
            .map(|d| (d.id.clone(), Decision::Reject))
            .collect();
        assert!(registry.submit_approval(&started.run_id, decisions.clone()));

        let done = handle.wait_for_terminal().await;
        assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error);
        assert!(matches!(
            done.outcome(Phase::Approval),
            Some(PhaseOutcome::Approval { withheld, .. }) if withheld == &vec![dropped.clone()]
        ));
        assert_eq!(done.phase_entities["approval"], vec![kept.clone()]);
        assert_eq!(
            done.outcome(Phase::Finalize),
            Some(&PhaseOutcome::Finalized {
                contact_count: 1,
                sequenced: 1,
            })
        );
        assert_eq!(done.approval_decisions, decisions);

        assert!(drafts.pending_followups(dropped).unwrap().is_empty());
        assert!(!drafts.pending_followups(kept).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_approval_approves_everything() {
        let h = plain(2);
        let started = h.registry.start_run(1, manual()).unwrap();
        let handle = h.registry.handle(&started.run_id).unwrap();

        assert!(!h.registry.skip_approval("prun_missing"));
        wait_for_status(&handle, RunStatus::ApprovalNeeded).await;
        assert!(h.registry.skip_approval(&started.run_id));

        let done = handle.wait_for_terminal().await;
        assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error);
        assert!(matches!(
            done.outcome(Phase::Approval),
            Some(PhaseOutcome::Approval {
                mode: ApprovalMode::Skipped,
                ..
            })
        ));
        assert!(!h.registry.submit_approval(&started.run_id, ApprovalDecisions::new()));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_approval_wait() {
        let h = plain(2);
        let started = h.registry.start_run(1, manual()).unwrap();
        let handle = h.registry.handle(&started.run_id).unwrap();

        wait_for_status(&handle, RunStatus::ApprovalNeeded).await;
        assert!(h.registry.cancel_run(&started.run_id));

        let done = handle.wait_for_terminal().await;
        assert_eq!(done.status, RunStatus::Cancelled);
        assert!(done.error.is_none());
        assert!(done.outcome(Phase::Approval).is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_snapshot_first() {
        let h = plain(2);
        let started = h.registry.start_run(1, manual()).unwrap();
        let handle = h.registry.handle(&started.run_id).unwrap();
        wait_for_status(&handle, RunStatus::ApprovalNeeded).await;

        let mut sub = h.registry.subscribe(&started.run_id).unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, PipelineEventKind::State);
        let snapshot: RunSnapshot = serde_json::from_value(first.data.unwrap()).unwrap();
        assert_eq!(snapshot.status, RunStatus::ApprovalNeeded);

        assert!(h.registry.skip_approval(&started.run_id));
        let mut kinds = Vec::new();
        while let Some(event) = sub.recv().await {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&PipelineEventKind::ApprovalResolved));
        assert!(!kinds.contains(&PipelineEventKind::State));
        assert_eq!(kinds.last(), Some(&PipelineEventKind::RunCompleted));
        h.registry.unsubscribe(&sub);
    }

    #[tokio::test]
    async fn test_start_run_guards() {
        let h = plain(1);

        assert!(matches!(
            h.registry.start_run(0, PipelineConfig::default()),
            Err(PipelineError::InvalidBatchNumber(0))
        ));
        assert!(matches!(
            h.registry.start_run(
                1,
                PipelineConfig {
                    max_workers: 0,
                    ..PipelineConfig::default()
                }
            ),
            Err(PipelineError::InvalidConfig(_))
        ));

        let first = assert_ok!(h.registry.start_run(1, PipelineConfig::default()));
        assert!(matches!(
            h.registry.start_run(1, PipelineConfig::default()),
            Err(PipelineError::BatchExists(1))
        ));
        h.registry.handle(&first.run_id).unwrap().wait_for_terminal().await;
        assert!(matches!(
            h.registry.start_run(1, PipelineConfig::default()),
            Err(PipelineError::BatchExists(1))
        ));

        assert_eq!(h.registry.list_runs().len(), 1);
        assert!(h.registry.get_run("prun_missing").is_none());
        assert!(matches!(
            h.registry.subscribe("prun_missing"),
            Err(PipelineError::RunNotFound(_))
        ));
    }
}
