//! # Pre-Brief Skill
//!
//! Reviews how the previous batch's drafts fared before building the next one.

use anyhow::Result;

use super::PreBrief;
use crate::state::{ApprovalStatus, BatchManager, DraftManager};

pub fn brief(batches: &BatchManager, drafts: &DraftManager, batch_number: u32) -> Result<PreBrief> {
    let previous_number = batch_number.saturating_sub(1);
    let Some(previous) = batches.get_by_number(previous_number)? else {
        return Ok(PreBrief {
            previous_batch_number: Some(previous_number),
            notes: vec![format!("batch #{} not found", previous_number)],
            ..Default::default()
        });
    };

    let reviewed = drafts.list_for_batch(&previous.id)?;
    let count = |status: ApprovalStatus| {
        reviewed
            .iter()
            .filter(|d| d.approval_status == status)
            .count()
    };

    let mut brief = PreBrief {
        previous_batch_number: Some(previous.batch_number),
        previous_batch_id: Some(previous.id.clone()),
        drafts_total: reviewed.len(),
        approved: count(ApprovalStatus::Approved),
        rejected: count(ApprovalStatus::Rejected),
        edit_requested: count(ApprovalStatus::EditRequested),
        notes: Vec::new(),
    };

    if brief.drafts_total == 0 {
        brief.notes.push("previous batch produced no drafts".to_string());
    }
    if brief.rejected > brief.approved {
        brief
            .notes
            .push("more drafts rejected than approved last batch".to_string());
    }
    if let Some(variable) = previous.ab_variable {
        brief
            .notes
            .push(format!("previous experiment variable: {}", variable));
    }

    Ok(brief)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::state::{BatchStore, NewDraft, OutreachDb};
    use crate::testing::seed_contacts;

    #[test]
    fn test_brief_counts_previous_reviews() {
        let db = OutreachDb::open_in_memory().unwrap();
        let batches = BatchManager::new(&db);
        let drafts = DraftManager::new(&db);
        let first = batches.create_batch(1, &PipelineConfig::default()).unwrap();
        let contact = seed_contacts(&db, 1).remove(0);

        for status in [
            ApprovalStatus::Rejected,
            ApprovalStatus::Rejected,
            ApprovalStatus::Approved,
        ] {
            let d = drafts
                .create(NewDraft {
                    contact_id: contact.clone(),
                    batch_id: Some(first.id.clone()),
                    touch_number: 1,
                    touch_type: "inmail".to_string(),
                    ..Default::default()
                })
                .unwrap();
            drafts.set_status(&d.id, status).unwrap();
        }

        let brief = brief(&batches, &drafts, 2).unwrap();
        assert_eq!(brief.previous_batch_id, Some(first.id));
        assert_eq!((brief.approved, brief.rejected), (1, 2));
        assert!(brief.notes.iter().any(|n| n.contains("rejected")));
    }

    #[test]
    fn test_missing_previous_batch() {
        let db = OutreachDb::open_in_memory().unwrap();
        let brief = brief(&BatchManager::new(&db), &DraftManager::new(&db), 5).unwrap();
        assert_eq!(brief.previous_batch_number, Some(4));
        assert!(brief.previous_batch_id.is_none());
    }
}
