//! Test doubles shared by the swarm tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::skills::{
    ContactScore, Deliverable, DeliverableGenerator, DraftOutput, ExperimentGroups,
    PhaseFunctions, PreBrief, QaOutput, QcFlag, ResearchOutput, ResearchSource, SequenceOutput,
    TaskContext, TaskExecutor, TaskOutput,
};
use crate::config::Prospect;
use crate::state::{ContactManager, DraftManager, NewDraft, OutreachDb, TaskKind};
use crate::swarm::phases::Phase;

/// `con_00`, `con_01`, ... for tests that never touch the contacts table
pub(crate) fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("con_{:02}", i)).collect()
}

/// Insert `n` contacts and return their ids in creation order
pub(crate) fn seed_contacts(db: &OutreachDb, n: usize) -> Vec<String> {
    let contacts = ContactManager::new(db);
    (0..n)
        .map(|i| {
            let prospect = Prospect {
                first_name: format!("Prospect{:02}", i),
                last_name: "Test".to_string(),
                company: Some("Acme".to_string()),
                ..Default::default()
            };
            contacts.create(&prospect).unwrap().id
        })
        .collect()
}

fn to_set<S: AsRef<str>>(ids: &[S]) -> HashSet<String> {
    ids.iter().map(|s| s.as_ref().to_string()).collect()
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executor that succeeds unless told otherwise
#[derive(Default)]
pub(crate) struct FakeExecutor {
    failing: HashSet<String>,
    fail_once: Mutex<HashSet<String>>,
    qa_failing: HashSet<String>,
    existing: HashSet<String>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// These entities always fail
    pub fn failing<S: AsRef<str>>(mut self, ids: &[S]) -> Self {
        self.failing = to_set(ids);
        self
    }

    /// These entities fail on their first execution only
    pub fn fail_once<S: AsRef<str>>(self, ids: &[S]) -> Self {
        Self {
            fail_once: Mutex::new(to_set(ids)),
            ..self
        }
    }

    /// QA flags these entities
    pub fn qa_failing<S: AsRef<str>>(mut self, ids: &[S]) -> Self {
        self.qa_failing = to_set(ids);
        self
    }

    /// These entities already have their side effect in place
    pub fn with_existing<S: AsRef<str>>(mut self, ids: &[S]) -> Self {
        self.existing = to_set(ids);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `execute` calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn output(&self, kind: TaskKind, entity_id: &str) -> TaskOutput {
        let contact_id = entity_id.to_string();
        match kind {
            TaskKind::Research => TaskOutput::Research(ResearchOutput {
                contact_id,
                source: ResearchSource::Cached,
                research_id: None,
                headline: None,
            }),
            TaskKind::Draft => TaskOutput::Draft(DraftOutput {
                contact_id,
                draft_ids: Vec::new(),
                skipped_channels: Vec::new(),
            }),
            TaskKind::Qa => {
                let flags = if self.qa_failing.contains(entity_id) {
                    vec![QcFlag {
                        contact_id: contact_id.clone(),
                        draft_id: None,
                        check: "no_placeholders".to_string(),
                        detail: "body contains placeholder text".to_string(),
                    }]
                } else {
                    Vec::new()
                };
                TaskOutput::Qa(QaOutput {
                    contact_id,
                    passed: flags.is_empty(),
                    drafts_checked: 1,
                    flags,
                })
            }
            TaskKind::Sequence => TaskOutput::Sequence(SequenceOutput {
                contact_id,
                scheduled: Vec::new(),
                already_scheduled: false,
            }),
        }
    }
}

#[async_trait]
impl TaskExecutor for FakeExecutor {
    async fn existing_output(
        &self,
        kind: TaskKind,
        entity_id: &str,
        _ctx: &TaskContext,
    ) -> Result<Option<TaskOutput>> {
        if self.existing.contains(entity_id) {
            return Ok(Some(self.output(kind, entity_id)));
        }
        Ok(None)
    }

    async fn execute(
        &self,
        kind: TaskKind,
        entity_id: &str,
        _ctx: &TaskContext,
    ) -> Result<TaskOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.contains(entity_id) {
            anyhow::bail!("{} failed for {}", kind, entity_id);
        }
        let first_failure = self
            .fail_once
            .lock()
            .map(|mut pending| pending.remove(entity_id))
            .unwrap_or(false);
        if first_failure {
            anyhow::bail!("transient {} failure for {}", kind, entity_id);
        }

        Ok(self.output(kind, entity_id))
    }
}

/// Phase functions with scripted results
pub(crate) struct FakePhases {
    contacts: Vec<String>,
    fail_in: Option<Phase>,
    artifacts: Option<DraftManager>,
    delay: Duration,
    pub scored: Mutex<Option<Vec<String>>>,
    pub pre_briefs: AtomicUsize,
    pub finalized: AtomicUsize,
}

impl FakePhases {
    pub fn new(contacts: Vec<String>) -> Self {
        Self {
            contacts,
            fail_in: None,
            artifacts: None,
            delay: Duration::ZERO,
            scored: Mutex::new(None),
            pre_briefs: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
        }
    }

    /// Raise an error from this phase
    pub fn failing_in(mut self, phase: Phase) -> Self {
        self.fail_in = Some(phase);
        self
    }

    /// Extract also creates one draft per contact in the batch
    pub fn with_artifacts(mut self, drafts: DraftManager) -> Self {
        self.artifacts = Some(drafts);
        self
    }

    /// Every phase body sleeps this long first
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn scored_ids(&self) -> Option<Vec<String>> {
        self.scored.lock().ok().and_then(|s| s.clone())
    }

    async fn enter(&self, phase: Phase) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_in == Some(phase) {
            anyhow::bail!("{} exploded", phase);
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseFunctions for FakePhases {
    async fn pre_brief(&self, _ctx: &TaskContext) -> Result<PreBrief> {
        self.enter(Phase::PreBrief).await?;
        self.pre_briefs.fetch_add(1, Ordering::SeqCst);
        Ok(PreBrief::default())
    }

    async fn extract(&self, ctx: &TaskContext) -> Result<Vec<String>> {
        self.enter(Phase::Extract).await?;
        if let Some(drafts) = &self.artifacts {
            for contact in &self.contacts {
                drafts.create(NewDraft {
                    contact_id: contact.clone(),
                    batch_id: Some(ctx.require_batch()?.to_string()),
                    touch_number: 1,
                    touch_type: "inmail".to_string(),
                    body: "Hi".to_string(),
                    ..Default::default()
                })?;
            }
        }
        Ok(self.contacts.clone())
    }

    async fn score(
        &self,
        _ctx: &TaskContext,
        contact_ids: &[String],
    ) -> Result<Vec<ContactScore>> {
        self.enter(Phase::Score).await?;
        if let Ok(mut scored) = self.scored.lock() {
            *scored = Some(contact_ids.to_vec());
        }
        Ok(contact_ids
            .iter()
            .map(|id| ContactScore {
                contact_id: id.clone(),
                score: 5,
            })
            .collect())
    }

    async fn assign_experiments(
        &self,
        _ctx: &TaskContext,
        contact_ids: &[String],
    ) -> Result<ExperimentGroups> {
        self.enter(Phase::AbAssign).await?;
        Ok(ExperimentGroups::from([("A".to_string(), contact_ids.to_vec())]))
    }

    async fn finalize(&self, _ctx: &TaskContext, _contact_ids: &[String]) -> Result<()> {
        self.enter(Phase::Finalize).await?;
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Deliverable generator that writes nothing
#[derive(Default)]
pub(crate) struct FakeDeliverables {
    pub generated: AtomicUsize,
}

#[async_trait]
impl DeliverableGenerator for FakeDeliverables {
    async fn generate(&self, _ctx: &TaskContext) -> Result<Deliverable> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(Deliverable::default())
    }
}
