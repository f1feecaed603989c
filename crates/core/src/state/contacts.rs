//! # Contacts
//!
//! Prospects stored during extract plus the research snapshots gathered for them.

use super::db::OutreachDb;
use super::generate_id;
use crate::config::Prospect;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// A stored contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub persona_type: Option<String>,
    #[serde(default)]
    pub readiness_score: Option<u32>,
}

impl Contact {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Email present and non-blank
    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }
}

/// A research snapshot for one contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Research {
    pub id: String,
    pub contact_id: String,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub company_news: Option<String>,
}

const CONTACT_COLUMNS: &str = r#"
    id, first_name, last_name, title, company_name, email, linkedin_url,
    persona_type, readiness_score
"#;

/// Manages contacts and their research
pub struct ContactManager {
    conn: Arc<Mutex<Connection>>,
}

impl ContactManager {
    pub fn new(db: &OutreachDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// Store a prospect as a new contact
    pub fn create(&self, prospect: &Prospect) -> Result<Contact> {
        let contact = Contact {
            id: generate_id("con"),
            first_name: prospect.first_name.trim().to_string(),
            last_name: prospect.last_name.trim().to_string(),
            title: prospect.title.clone(),
            company_name: prospect.company.clone(),
            email: prospect.email.clone(),
            linkedin_url: prospect.linkedin_url.as_deref().map(normalize_linkedin_url),
            persona_type: prospect.persona_type.clone(),
            readiness_score: None,
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO contacts
            (id, first_name, last_name, title, company_name, email, linkedin_url,
             persona_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                contact.id,
                contact.first_name,
                contact.last_name,
                contact.title,
                contact.company_name,
                contact.email,
                contact.linkedin_url,
                contact.persona_type,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert contact")?;

        Ok(contact)
    }

    pub fn get(&self, contact_id: &str) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM contacts WHERE id = ?1", CONTACT_COLUMNS);
        let contact = conn
            .query_row(&sql, params![contact_id], Self::row_to_contact)
            .optional()
            .context("Failed to load contact")?;
        Ok(contact)
    }

    pub fn find_by_linkedin_url(&self, url: &str) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM contacts WHERE linkedin_url = ?1 LIMIT 1",
            CONTACT_COLUMNS
        );
        let contact = conn
            .query_row(&sql, params![normalize_linkedin_url(url)], Self::row_to_contact)
            .optional()?;
        Ok(contact)
    }

    pub fn set_readiness_score(&self, contact_id: &str, score: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE contacts SET readiness_score = ?1 WHERE id = ?2",
            params![score, contact_id],
        )?;
        Ok(())
    }

    pub fn add_research(
        &self,
        contact_id: &str,
        headline: Option<&str>,
        company_news: Option<&str>,
    ) -> Result<Research> {
        let research = Research {
            id: generate_id("res"),
            contact_id: contact_id.to_string(),
            headline: headline.map(String::from),
            company_news: company_news.map(String::from),
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO research_snapshots (id, contact_id, headline, company_news, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                research.id,
                research.contact_id,
                research.headline,
                research.company_news,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert research snapshot")?;

        Ok(research)
    }

    /// Most recent research snapshot for the contact
    pub fn latest_research(&self, contact_id: &str) -> Result<Option<Research>> {
        let conn = self.lock()?;
        let research = conn
            .query_row(
                r#"
                SELECT id, contact_id, headline, company_news
                FROM research_snapshots
                WHERE contact_id = ?1
                ORDER BY created_at DESC, rowid DESC
                LIMIT 1
                "#,
                params![contact_id],
                |row| {
                    Ok(Research {
                        id: row.get(0)?,
                        contact_id: row.get(1)?,
                        headline: row.get(2)?,
                        company_news: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(research)
    }

    fn row_to_contact(row: &rusqlite::Row) -> rusqlite::Result<Contact> {
        Ok(Contact {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            title: row.get(3)?,
            company_name: row.get(4)?,
            email: row.get(5)?,
            linkedin_url: row.get(6)?,
            persona_type: row.get(7)?,
            readiness_score: row.get(8)?,
        })
    }
}

/// Lowercase, drop query string and trailing slash
pub fn normalize_linkedin_url(url: &str) -> String {
    let base = url.split(['?', '#']).next().unwrap_or(url);
    base.trim().trim_end_matches('/').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prospect(first: &str, url: Option<&str>) -> Prospect {
        Prospect {
            first_name: first.to_string(),
            last_name: "Doe".to_string(),
            company: Some("Acme".to_string()),
            linkedin_url: url.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let db = OutreachDb::open_in_memory().unwrap();
        let contacts = ContactManager::new(&db);

        let created = contacts
            .create(&prospect("Jane", Some("https://LinkedIn.com/in/jane/?trk=x")))
            .unwrap();
        assert!(created.id.starts_with("con_"));
        assert_eq!(created.full_name(), "Jane Doe");
        assert!(!created.has_email());

        let found = contacts
            .find_by_linkedin_url("https://linkedin.com/in/jane")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);

        contacts.set_readiness_score(&created.id, 7).unwrap();
        assert_eq!(
            contacts.get(&created.id).unwrap().unwrap().readiness_score,
            Some(7)
        );
    }

    #[test]
    fn test_latest_research() {
        let db = OutreachDb::open_in_memory().unwrap();
        let contacts = ContactManager::new(&db);
        let c = contacts.create(&prospect("Sam", None)).unwrap();

        assert!(contacts.latest_research(&c.id).unwrap().is_none());
        contacts
            .add_research(&c.id, Some("VP Quality"), None)
            .unwrap();
        contacts
            .add_research(&c.id, Some("VP QA"), Some("Raised Series B"))
            .unwrap();

        let latest = contacts.latest_research(&c.id).unwrap().unwrap();
        assert_eq!(latest.headline.as_deref(), Some("VP QA"));
    }
}
