//! # Experiment Skill
//!
//! Splits a batch into experiment groups. Contacts are ordered by persona
//! and then dealt round-robin so every group gets a similar persona mix.

use anyhow::Result;

use super::ExperimentGroups;
use crate::config::PipelineConfig;
use crate::state::{BatchManager, ContactManager};

pub fn assign(
    contacts: &ContactManager,
    batches: &BatchManager,
    batch_id: &str,
    config: &PipelineConfig,
    ids: &[String],
) -> Result<ExperimentGroups> {
    let labels: Vec<&String> = config.ab_groups.keys().collect();
    if labels.is_empty() {
        anyhow::bail!("no experiment groups configured");
    }

    let mut ordered = Vec::with_capacity(ids.len());
    for id in ids {
        let persona = contacts
            .get(id)?
            .and_then(|c| c.persona_type)
            .unwrap_or_default();
        ordered.push((persona, id));
    }
    // Stable: ties keep submission order
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let mut groups: ExperimentGroups = labels
        .iter()
        .map(|label| (label.to_string(), Vec::new()))
        .collect();

    for (i, (_, id)) in ordered.into_iter().enumerate() {
        let label = labels[i % labels.len()];
        batches.set_ab_group(batch_id, id, label)?;
        if let Some(members) = groups.get_mut(label.as_str()) {
            members.push(id.clone());
        }
    }

    tracing::info!(
        variable = %config.ab_variable,
        groups = groups.len(),
        "experiment groups assigned"
    );
    Ok(groups)
}
