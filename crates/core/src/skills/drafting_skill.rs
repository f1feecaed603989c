//! # Drafting Skill
//!
//! Creates placeholder drafts for every configured channel and touch. Actual
//! copy is written later by a reviewer; QA flags the placeholders until then.

use anyhow::Result;

use super::{ChannelSkip, DraftOutput, TaskContext};
use crate::config::Channel;
use crate::state::{BatchManager, Contact, ContactManager, DraftManager, NewDraft};

/// Touch numbers drafted per channel
pub fn touches(channel: Channel) -> &'static [u32] {
    match channel {
        Channel::Email => &[1, 3, 5, 6],
        Channel::Linkedin => &[1, 3, 6],
    }
}

fn touch_type(channel: Channel, touch: u32) -> &'static str {
    match (channel, touch) {
        (_, 6) => "breakup",
        (Channel::Linkedin, _) => "inmail",
        (Channel::Email, _) => "email",
    }
}

/// Why a channel cannot get drafts for this contact, if it cannot
fn channel_block(contact: &Contact, channel: Channel) -> Option<&'static str> {
    if channel == Channel::Email && !contact.has_email() {
        return Some("no email address");
    }
    None
}

/// Drafts from an earlier run, if every eligible channel already has them
pub fn existing(
    contacts: &ContactManager,
    drafts: &DraftManager,
    ctx: &TaskContext,
    contact_id: &str,
) -> Result<Option<DraftOutput>> {
    let Some(contact) = contacts.get(contact_id)? else {
        return Ok(None);
    };

    let eligible: Vec<Channel> = ctx
        .config
        .channels
        .iter()
        .copied()
        .filter(|c| channel_block(&contact, *c).is_none())
        .collect();
    if eligible.is_empty() {
        return Ok(None);
    }
    for channel in &eligible {
        if !drafts.has_channel_drafts(contact_id, *channel)? {
            return Ok(None);
        }
    }

    let draft_ids = drafts
        .list_for_contact(contact_id)?
        .into_iter()
        .filter(|d| eligible.contains(&d.channel))
        .map(|d| d.id)
        .collect();
    Ok(Some(DraftOutput {
        contact_id: contact_id.to_string(),
        draft_ids,
        skipped_channels: Vec::new(),
    }))
}

pub fn draft(
    contacts: &ContactManager,
    drafts: &DraftManager,
    batches: &BatchManager,
    ctx: &TaskContext,
    contact_id: &str,
) -> Result<DraftOutput> {
    let contact = contacts
        .get(contact_id)?
        .ok_or_else(|| anyhow::anyhow!("Contact not found: {}", contact_id))?;

    let research = contacts.latest_research(contact_id)?;
    if research.is_none() && ctx.config.require_research {
        anyhow::bail!("Research required before drafting {}", contact.full_name());
    }
    let headline = research
        .and_then(|r| r.headline)
        .unwrap_or_else(|| "N/A".to_string());

    let ab_group = match ctx.batch_id.as_deref() {
        Some(batch_id) => batches.ab_group(batch_id, contact_id)?,
        None => None,
    };

    let mut output = DraftOutput {
        contact_id: contact_id.to_string(),
        draft_ids: Vec::new(),
        skipped_channels: Vec::new(),
    };

    for &channel in &ctx.config.channels {
        if let Some(reason) = channel_block(&contact, channel) {
            output.skipped_channels.push(ChannelSkip {
                channel,
                reason: reason.to_string(),
            });
            continue;
        }
        if drafts.has_channel_drafts(contact_id, channel)? {
            output.skipped_channels.push(ChannelSkip {
                channel,
                reason: "drafts already exist".to_string(),
            });
            continue;
        }

        for &touch in touches(channel) {
            let created = drafts.create(NewDraft {
                contact_id: contact_id.to_string(),
                batch_id: ctx.batch_id.clone(),
                channel: Some(channel),
                touch_number: touch,
                touch_type: touch_type(channel, touch).to_string(),
                subject_line: Some(format!(
                    "[DRAFT] Touch {} for {}",
                    touch, contact.first_name
                )),
                body: format!(
                    "[PENDING GENERATION] Research-based {} message for {} at {}. \
                     Research headline: {}",
                    channel.as_str(),
                    contact.full_name(),
                    contact.company_name.as_deref().unwrap_or("their company"),
                    headline
                ),
                proof_point_used: None,
                ab_group: ab_group.clone(),
            })?;
            output.draft_ids.push(created.id);
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, Prospect};
    use crate::state::{BatchStore, OutreachDb};
    use std::sync::Arc;

    struct Fixture {
        contacts: ContactManager,
        drafts: DraftManager,
        batches: BatchManager,
        ctx: TaskContext,
    }

    fn fixture(config: PipelineConfig) -> Fixture {
        let db = OutreachDb::open_in_memory().unwrap();
        let batches = BatchManager::new(&db);
        let batch = batches.create_batch(1, &config).unwrap();
        let mut ctx = TaskContext::new("prun_t", 1, Arc::new(config));
        ctx.batch_id = Some(batch.id);
        Fixture {
            contacts: ContactManager::new(&db),
            drafts: DraftManager::new(&db),
            batches,
            ctx,
        }
    }

    fn contact(f: &Fixture, email: Option<&str>) -> String {
        let c = f
            .contacts
            .create(&Prospect {
                first_name: "Lee".to_string(),
                last_name: "Wong".to_string(),
                email: email.map(String::from),
                ..Default::default()
            })
            .unwrap();
        f.contacts.add_research(&c.id, Some("Head of QA"), None).unwrap();
        c.id
    }

    #[test]
    fn test_drafts_every_touch() {
        let f = fixture(PipelineConfig::default());
        let id = contact(&f, Some("lee@acme.io"));

        let out = draft(&f.contacts, &f.drafts, &f.batches, &f.ctx, &id).unwrap();
        assert_eq!(out.draft_ids.len(), 7);
        assert!(out.skipped_channels.is_empty());

        let stored = f.drafts.list_for_contact(&id).unwrap();
        assert!(stored.iter().all(|d| d.batch_id == f.ctx.batch_id));
        assert!(stored
            .iter()
            .any(|d| d.touch_number == 6 && d.touch_type == "breakup"));
    }

    #[test]
    fn test_skips_email_without_address_and_existing_channels() {
        let f = fixture(PipelineConfig::default());
        let id = contact(&f, None);

        let out = draft(&f.contacts, &f.drafts, &f.batches, &f.ctx, &id).unwrap();
        assert_eq!(out.draft_ids.len(), 3);
        assert_eq!(out.skipped_channels[0].channel, Channel::Email);

        let again = draft(&f.contacts, &f.drafts, &f.batches, &f.ctx, &id).unwrap();
        assert!(again.draft_ids.is_empty());
        assert_eq!(again.skipped_channels.len(), 2);

        let reused = existing(&f.contacts, &f.drafts, &f.ctx, &id).unwrap().unwrap();
        assert_eq!(reused.draft_ids.len(), 3);
    }

    #[test]
    fn test_requires_research() {
        let f = fixture(PipelineConfig::default());
        let c = f
            .contacts
            .create(&Prospect {
                first_name: "Ana".to_string(),
                ..Default::default()
            })
            .unwrap();

        assert!(draft(&f.contacts, &f.drafts, &f.batches, &f.ctx, &c.id).is_err());
        assert!(existing(&f.contacts, &f.drafts, &f.ctx, &c.id).unwrap().is_none());
    }
}
