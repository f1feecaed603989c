use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;

use super::{
    deliverable_skill, drafting_skill, experiment_skill, extract_skill, pre_brief_skill,
    qa_skill, researcher_skill, scoring_skill, sequence_skill, ContactScore, Deliverable,
    DeliverableGenerator, ExperimentGroups, PhaseFunctions, PreBrief, TaskContext, TaskExecutor,
    TaskOutput,
};
use crate::state::{BatchManager, BatchStore, ContactManager, DraftManager, OutreachDb, TaskKind};

/// Database-backed implementation of every collaborator
pub struct BuiltinSkills {
    contacts: ContactManager,
    drafts: DraftManager,
    batches: BatchManager,
    output_dir: PathBuf,
}

impl BuiltinSkills {
    pub fn new(db: &OutreachDb, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            contacts: ContactManager::new(db),
            drafts: DraftManager::new(db),
            batches: BatchManager::new(db),
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for BuiltinSkills {
    async fn existing_output(
        &self,
        kind: TaskKind,
        entity_id: &str,
        ctx: &TaskContext,
    ) -> Result<Option<TaskOutput>> {
        match kind {
            TaskKind::Draft => Ok(drafting_skill::existing(
                &self.contacts,
                &self.drafts,
                ctx,
                entity_id,
            )?
            .map(TaskOutput::Draft)),
            _ => Ok(None),
        }
    }

    async fn execute(
        &self,
        kind: TaskKind,
        entity_id: &str,
        ctx: &TaskContext,
    ) -> Result<TaskOutput> {
        let output = match kind {
            TaskKind::Research => TaskOutput::Research(researcher_skill::research(
                &self.contacts,
                entity_id,
                ctx.config.auto_research,
            )?),
            TaskKind::Draft => TaskOutput::Draft(drafting_skill::draft(
                &self.contacts,
                &self.drafts,
                &self.batches,
                ctx,
                entity_id,
            )?),
            TaskKind::Qa => {
                let drafts = self.drafts.list_for_contact(entity_id)?;
                TaskOutput::Qa(qa_skill::check(entity_id, &drafts))
            }
            TaskKind::Sequence => TaskOutput::Sequence(sequence_skill::schedule(
                &self.contacts,
                &self.drafts,
                entity_id,
                Utc::now().date_naive(),
            )?),
        };
        Ok(output)
    }
}

#[async_trait]
impl PhaseFunctions for BuiltinSkills {
    async fn pre_brief(&self, ctx: &TaskContext) -> Result<PreBrief> {
        pre_brief_skill::brief(&self.batches, &self.drafts, ctx.batch_number)
    }

    async fn extract(&self, ctx: &TaskContext) -> Result<Vec<String>> {
        if ctx.config.prospects.is_empty() {
            return self.batches.list_contacts(ctx.require_batch()?);
        }
        extract_skill::extract(&self.contacts, &ctx.config)
    }

    async fn score(
        &self,
        _ctx: &TaskContext,
        contact_ids: &[String],
    ) -> Result<Vec<ContactScore>> {
        scoring_skill::score_contacts(&self.contacts, contact_ids)
    }

    async fn assign_experiments(
        &self,
        ctx: &TaskContext,
        contact_ids: &[String],
    ) -> Result<ExperimentGroups> {
        experiment_skill::assign(
            &self.contacts,
            &self.batches,
            ctx.require_batch()?,
            &ctx.config,
            contact_ids,
        )
    }

    async fn finalize(&self, ctx: &TaskContext, contact_ids: &[String]) -> Result<()> {
        let batch_id = ctx.require_batch()?;
        let drafts = self.drafts.list_for_batch(batch_id)?;
        tracing::info!(
            batch_id,
            contacts = contact_ids.len(),
            drafts = drafts.len(),
            "batch finalized"
        );
        Ok(())
    }
}

#[async_trait]
impl DeliverableGenerator for BuiltinSkills {
    async fn generate(&self, ctx: &TaskContext) -> Result<Deliverable> {
        let batch_id = ctx.require_batch()?;
        let batch = self
            .batches
            .get_batch(batch_id)?
            .ok_or_else(|| anyhow::anyhow!("Batch not found: {}", batch_id))?;

        let mut contacts = Vec::new();
        for id in self.batches.list_contacts(batch_id)? {
            if let Some(contact) = self.contacts.get(&id)? {
                contacts.push(contact);
            }
        }
        let drafts = self.drafts.list_for_batch(batch_id)?;

        deliverable_skill::write(&self.output_dir, &batch, &contacts, &drafts).await
    }
}
