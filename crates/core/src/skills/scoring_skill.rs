//! # Scoring Skill
//!
//! Readiness score (0-10): how much we know about a contact and how senior
//! they are. Stored on the contact.

use anyhow::Result;

use super::ContactScore;
use crate::state::{Contact, ContactManager};

const SENIOR: [&str; 5] = ["chief", "vp", "vice president", "head", "director"];
const MID: [&str; 3] = ["manager", "lead", "principal"];

pub fn readiness(contact: &Contact, has_research: bool) -> u32 {
    let title = contact.title.as_deref().unwrap_or_default().to_lowercase();
    let seniority = if SENIOR.iter().any(|s| title.contains(s)) {
        3
    } else if MID.iter().any(|s| title.contains(s)) {
        2
    } else if !title.is_empty() {
        1
    } else {
        0
    };

    let mut score = seniority;
    if contact.has_email() {
        score += 2;
    }
    if contact.linkedin_url.is_some() {
        score += 1;
    }
    if contact.company_name.is_some() {
        score += 1;
    }
    if contact.persona_type.is_some() {
        score += 1;
    }
    if has_research {
        score += 2;
    }
    score.min(10)
}

pub fn score_contacts(contacts: &ContactManager, ids: &[String]) -> Result<Vec<ContactScore>> {
    let mut scores = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(contact) = contacts.get(id)? else {
            tracing::warn!(contact = %id, "cannot score unknown contact");
            continue;
        };
        let has_research = contacts.latest_research(id)?.is_some();
        let score = readiness(&contact, has_research);
        contacts.set_readiness_score(id, score)?;
        scores.push(ContactScore {
            contact_id: id.clone(),
            score,
        });
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Prospect;
    use crate::state::OutreachDb;

    #[test]
    fn test_readiness() {
        let db = OutreachDb::open_in_memory().unwrap();
        let contacts = ContactManager::new(&db);
        let senior = contacts
            .create(&Prospect {
                first_name: "Dee".to_string(),
                title: Some("VP Engineering".to_string()),
                company: Some("Acme".to_string()),
                email: Some("dee@acme.io".to_string()),
                linkedin_url: Some("https://linkedin.com/in/dee".to_string()),
                persona_type: Some("vp_eng".to_string()),
                ..Default::default()
            })
            .unwrap();
        contacts.add_research(&senior.id, Some("VP"), None).unwrap();
        let bare = contacts
            .create(&Prospect {
                first_name: "Bo".to_string(),
                ..Default::default()
            })
            .unwrap();

        let scores =
            score_contacts(&contacts, &[senior.id.clone(), bare.id.clone()]).unwrap();
        assert_eq!(scores[0].score, 10);
        assert_eq!(scores[1].score, 0);
        assert_eq!(
            contacts.get(&senior.id).unwrap().unwrap().readiness_score,
            Some(10)
        );
    }
}
