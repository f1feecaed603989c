//! # Extract Skill
//!
//! Turns supplied prospects into contacts. A LinkedIn URL already on file
//! reuses that contact instead of creating a duplicate.

use anyhow::Result;
use std::collections::HashSet;

use crate::config::PipelineConfig;
use crate::state::contacts::normalize_linkedin_url;
use crate::state::ContactManager;

/// Contact ids for the supplied prospects, capped at the target count
pub fn extract(contacts: &ContactManager, config: &PipelineConfig) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    let mut reused = 0usize;

    for prospect in &config.prospects {
        if ids.len() >= config.target_count {
            tracing::info!(
                target = config.target_count,
                supplied = config.prospects.len(),
                "target count reached, ignoring remaining prospects"
            );
            break;
        }

        if let Some(url) = prospect.linkedin_url.as_deref() {
            if !seen.insert(normalize_linkedin_url(url)) {
                continue;
            }
            if let Some(existing) = contacts.find_by_linkedin_url(url)? {
                reused += 1;
                ids.push(existing.id);
                continue;
            }
        }

        ids.push(contacts.create(prospect)?.id);
    }

    tracing::debug!(count = ids.len(), reused, "prospects extracted");
    Ok(ids)
}
