//! # Deliverable Skill
//!
//! Writes the reviewed batch to `<output_dir>/batch_<n>_deliverable.json`:
//! every contact with its approved drafts.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;

use super::Deliverable;
use crate::state::{ApprovalStatus, Batch, Contact, Draft};

#[derive(Serialize)]
struct ContactEntry<'a> {
    contact: &'a Contact,
    drafts: Vec<&'a Draft>,
}

#[derive(Serialize)]
struct DeliverableFile<'a> {
    batch_id: &'a str,
    batch_number: u32,
    generated_at: String,
    ab_variable: Option<&'a str>,
    contacts: Vec<ContactEntry<'a>>,
}

pub async fn write(
    output_dir: &Path,
    batch: &Batch,
    contacts: &[Contact],
    drafts: &[Draft],
) -> Result<Deliverable> {
    let entries: Vec<ContactEntry> = contacts
        .iter()
        .map(|contact| ContactEntry {
            contact,
            drafts: drafts
                .iter()
                .filter(|d| {
                    d.contact_id == contact.id && d.approval_status == ApprovalStatus::Approved
                })
                .collect(),
        })
        .collect();
    let approved_drafts = entries.iter().map(|e| e.drafts.len()).sum();

    let file = DeliverableFile {
        batch_id: &batch.id,
        batch_number: batch.batch_number,
        generated_at: Utc::now().to_rfc3339(),
        ab_variable: batch.ab_variable.as_deref(),
        contacts: entries,
    };

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let path = output_dir.join(format!("batch_{}_deliverable.json", batch.batch_number));
    let json = serde_json::to_string_pretty(&file)?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    tracing::info!(path = %path.display(), approved_drafts, "deliverable written");
    Ok(Deliverable {
        path: Some(path.display().to_string()),
        contact_count: contacts.len(),
        approved_drafts,
    })
}
