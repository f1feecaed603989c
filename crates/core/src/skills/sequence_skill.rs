//! # Sequence Skill
//!
//! Schedules follow-up touches on the standard cadence. Call touches are
//! worked manually and never scheduled.

use anyhow::Result;
use chrono::{Days, NaiveDate};

use super::{ScheduledTouch, SequenceOutput};
use crate::config::Channel;
use crate::state::{ContactManager, DraftManager};

/// (touch, channel, days after the first touch); `None` is a phone call
const CADENCE: [(u32, Option<Channel>, u64); 6] = [
    (1, Some(Channel::Linkedin), 0),
    (2, None, 2),
    (3, Some(Channel::Linkedin), 4),
    (4, None, 7),
    (5, Some(Channel::Email), 9),
    (6, Some(Channel::Linkedin), 14),
];

pub fn schedule(
    contacts: &ContactManager,
    drafts: &DraftManager,
    contact_id: &str,
    start: NaiveDate,
) -> Result<SequenceOutput> {
    let contact = contacts
        .get(contact_id)?
        .ok_or_else(|| anyhow::anyhow!("Contact not found: {}", contact_id))?;

    let pending = drafts.pending_followups(contact_id)?;
    if !pending.is_empty() {
        return Ok(SequenceOutput {
            contact_id: contact_id.to_string(),
            scheduled: pending
                .into_iter()
                .map(|f| ScheduledTouch {
                    touch_number: f.touch_number,
                    channel: f.channel,
                    due_date: f.due_date,
                })
                .collect(),
            already_scheduled: true,
        });
    }

    let mut scheduled = Vec::new();
    for (touch, channel, days) in CADENCE {
        let Some(channel) = channel else { continue };
        if channel == Channel::Email && !contact.has_email() {
            continue;
        }
        let due = start
            .checked_add_days(Days::new(days))
            .ok_or_else(|| anyhow::anyhow!("Follow-up date out of range"))?;
        let followup = drafts.schedule_followup(contact_id, touch, channel, due)?;
        scheduled.push(ScheduledTouch {
            touch_number: followup.touch_number,
            channel: followup.channel,
            due_date: followup.due_date,
        });
    }

    Ok(SequenceOutput {
        contact_id: contact_id.to_string(),
        scheduled,
        already_scheduled: false,
    })
}
