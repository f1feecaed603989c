//! # Researcher Skill
//!
//! Looks up stored research for a contact. Nothing is invented: without
//! stored research the contact is flagged, unless generation is enabled, in
//! which case a minimal snapshot is built from the contact's own profile.

use anyhow::Result;

use super::{ResearchOutput, ResearchSource};
use crate::state::{Contact, ContactManager};

pub fn research(
    contacts: &ContactManager,
    contact_id: &str,
    generate: bool,
) -> Result<ResearchOutput> {
    let contact = contacts
        .get(contact_id)?
        .ok_or_else(|| anyhow::anyhow!("Contact not found: {}", contact_id))?;

    if let Some(existing) = contacts.latest_research(contact_id)? {
        return Ok(ResearchOutput {
            contact_id: contact_id.to_string(),
            source: ResearchSource::Cached,
            research_id: Some(existing.id),
            headline: existing.headline,
        });
    }

    if !generate {
        tracing::info!(
            contact = %contact.full_name(),
            "research missing, flagged for manual research"
        );
        return Ok(ResearchOutput {
            contact_id: contact_id.to_string(),
            source: ResearchSource::NeedsResearch,
            research_id: None,
            headline: None,
        });
    }

    let headline = profile_headline(&contact);
    let snapshot = contacts.add_research(contact_id, headline.as_deref(), None)?;
    Ok(ResearchOutput {
        contact_id: contact_id.to_string(),
        source: ResearchSource::Generated,
        research_id: Some(snapshot.id),
        headline,
    })
}

fn profile_headline(contact: &Contact) -> Option<String> {
    match (contact.title.as_deref(), contact.company_name.as_deref()) {
        (Some(title), Some(company)) => Some(format!("{} at {}", title, company)),
        (Some(title), None) => Some(title.to_string()),
        (None, Some(company)) => Some(company.to_string()),
        (None, None) => None,
    }
}
