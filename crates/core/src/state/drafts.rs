//! # Message Drafts & Follow-ups
//!
//! Drafts are the artifacts the approval gate reviews. Follow-ups are the
//! scheduled touches produced by sequencing.

use super::db::OutreachDb;
use super::generate_id;
use crate::config::Channel;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Review state of a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Draft,
    Approved,
    Rejected,
    EditRequested,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::EditRequested => "edit_requested",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "edit_requested" => Self::EditRequested,
            _ => Self::Draft,
        }
    }
}

/// A drafted outreach message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub contact_id: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub channel: Channel,
    pub touch_number: u32,
    pub touch_type: String,
    #[serde(default)]
    pub subject_line: Option<String>,
    pub body: String,
    #[serde(default)]
    pub proof_point_used: Option<String>,
    #[serde(default)]
    pub ab_group: Option<String>,
    pub approval_status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to store a new draft
#[derive(Debug, Clone, Default)]
pub struct NewDraft {
    pub contact_id: String,
    pub batch_id: Option<String>,
    pub channel: Option<Channel>,
    pub touch_number: u32,
    pub touch_type: String,
    pub subject_line: Option<String>,
    pub body: String,
    pub proof_point_used: Option<String>,
    pub ab_group: Option<String>,
}

/// A scheduled follow-up touch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Followup {
    pub id: String,
    pub contact_id: String,
    pub touch_number: u32,
    pub channel: Channel,
    pub due_date: NaiveDate,
    pub state: String,
}

const DRAFT_COLUMNS: &str = r#"
    id, contact_id, batch_id, channel, touch_number, touch_type, subject_line,
    body, proof_point_used, ab_group, approval_status, created_at
"#;

/// Manages drafts and follow-ups
pub struct DraftManager {
    conn: Arc<Mutex<Connection>>,
}

impl DraftManager {
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

    pub fn create(&self, draft: NewDraft) -> Result<Draft> {
        let channel = draft.channel.unwrap_or(Channel::Linkedin);
        let created = Draft {
            id: generate_id("msg"),
            contact_id: draft.contact_id,
            batch_id: draft.batch_id,
            channel,
            touch_number: draft.touch_number,
            touch_type: draft.touch_type,
            subject_line: draft.subject_line,
            body: draft.body,
            proof_point_used: draft.proof_point_used,
            ab_group: draft.ab_group,
            approval_status: ApprovalStatus::Draft,
            created_at: Utc::now(),
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO message_drafts
            (id, contact_id, batch_id, channel, touch_number, touch_type, subject_line,
             body, proof_point_used, ab_group, approval_status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                created.id,
                created.contact_id,
                created.batch_id,
                created.channel.as_str(),
                created.touch_number,
                created.touch_type,
                created.subject_line,
                created.body,
                created.proof_point_used,
                created.ab_group,
                created.approval_status.as_str(),
                created.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert draft")?;

        Ok(created)
    }

    pub fn get(&self, draft_id: &str) -> Result<Option<Draft>> {
        Ok(self.query("id = ?1", draft_id)?.into_iter().next())
    }

    pub fn list_for_contact(&self, contact_id: &str) -> Result<Vec<Draft>> {
        self.query("contact_id = ?1", contact_id)
    }

    pub fn list_for_batch(&self, batch_id: &str) -> Result<Vec<Draft>> {
        self.query("batch_id = ?1", batch_id)
    }

    /// Whether the contact already has at least one draft on this channel
    pub fn has_channel_drafts(&self, contact_id: &str, channel: Channel) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message_drafts WHERE contact_id = ?1 AND channel = ?2",
            params![contact_id, channel.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns false when no draft has this id
    pub fn set_status(&self, draft_id: &str, status: ApprovalStatus) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE message_drafts SET approval_status = ?1 WHERE id = ?2",
            params![status.as_str(), draft_id],
        )?;
        Ok(affected > 0)
    }

    /// Drafts nobody has reviewed yet
    pub fn count_awaiting_review(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message_drafts WHERE approval_status = 'draft'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Draft counts per channel and review status, for drafts created at or after `since`
    pub fn review_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(Channel, ApprovalStatus, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT channel, approval_status, COUNT(*)
            FROM message_drafts
            WHERE created_at >= ?1
            GROUP BY channel, approval_status
            "#,
        )?;
        let counts = stmt
            .query_map(params![since.to_rfc3339()], |row| {
                let channel: String = row.get(0)?;
                let status: String = row.get(1)?;
                let count: i64 = row.get(2)?;
                Ok((
                    Channel::from_str(&channel).unwrap_or(Channel::Linkedin),
                    ApprovalStatus::from_str(&status),
                    count as usize,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to count drafts")?;
        Ok(counts)
    }

    fn query(&self, sql_where: &str, arg: &str) -> Result<Vec<Draft>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM message_drafts WHERE {} ORDER BY contact_id, touch_number, channel",
            DRAFT_COLUMNS, sql_where
        );
        let mut stmt = conn.prepare(&sql)?;
        let drafts = stmt
            .query_map(params![arg], Self::row_to_draft)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load drafts")?;
        Ok(drafts)
    }

    fn row_to_draft(row: &rusqlite::Row) -> rusqlite::Result<Draft> {
        let channel: String = row.get(3)?;
        let created_at: String = row.get(11)?;

        Ok(Draft {
            id: row.get(0)?,
            contact_id: row.get(1)?,
            batch_id: row.get(2)?,
            channel: Channel::from_str(&channel).unwrap_or(Channel::Linkedin),
            touch_number: row.get(4)?,
            touch_type: row.get(5)?,
            subject_line: row.get(6)?,
            body: row.get(7)?,
            proof_point_used: row.get(8)?,
            ab_group: row.get(9)?,
            approval_status: ApprovalStatus::from_str(&row.get::<_, String>(10)?),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // --- Follow-ups ---

    pub fn schedule_followup(
        &self,
        contact_id: &str,
        touch_number: u32,
        channel: Channel,
        due_date: NaiveDate,
    ) -> Result<Followup> {
        let followup = Followup {
            id: generate_id("fu"),
            contact_id: contact_id.to_string(),
            touch_number,
            channel,
            due_date,
            state: "pending".to_string(),
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO followups
            (id, contact_id, touch_number, channel, due_date, state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                followup.id,
                followup.contact_id,
                followup.touch_number,
                followup.channel.as_str(),
                followup.due_date.to_string(),
                followup.state,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to schedule follow-up")?;

        Ok(followup)
    }

    /// Pending follow-ups due on or before `day`
    pub fn count_due_followups(&self, day: NaiveDate) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM followups WHERE state = 'pending' AND due_date <= ?1",
            params![day.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Follow-ups scheduled at or after `since`
    pub fn count_followups_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM followups WHERE created_at >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn pending_followups(&self, contact_id: &str) -> Result<Vec<Followup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, contact_id, touch_number, channel, due_date, state
            FROM followups
            WHERE contact_id = ?1 AND state = 'pending'
            ORDER BY due_date, touch_number
            "#,
        )?;

        let followups = stmt
            .query_map(params![contact_id], |row| {
                let channel: String = row.get(3)?;
                let due: String = row.get(4)?;
                Ok(Followup {
                    id: row.get(0)?,
                    contact_id: row.get(1)?,
                    touch_number: row.get(2)?,
                    channel: Channel::from_str(&channel).unwrap_or(Channel::Linkedin),
                    due_date: due.parse().unwrap_or(NaiveDate::MIN),
                    state: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load follow-ups")?;

        Ok(followups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::state::{BatchManager, BatchStore};
    use crate::testing::seed_contacts;

    #[test]
    fn test_draft_lifecycle() {
        let db = OutreachDb::open_in_memory().unwrap();
        let drafts = DraftManager::new(&db);
        let contact = seed_contacts(&db, 1).remove(0);
        let batch = BatchManager::new(&db)
            .create_batch(1, &PipelineConfig::default())
            .unwrap();

        let draft = drafts
            .create(NewDraft {
                contact_id: contact.clone(),
                batch_id: Some(batch.id.clone()),
                channel: Some(Channel::Email),
                touch_number: 1,
                touch_type: "email".to_string(),
                subject_line: Some("Quick question".to_string()),
                body: "Hi there".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(draft.approval_status, ApprovalStatus::Draft);

        assert!(drafts.has_channel_drafts(&contact, Channel::Email).unwrap());
        assert!(!drafts.has_channel_drafts(&contact, Channel::Linkedin).unwrap());

        assert!(drafts.set_status(&draft.id, ApprovalStatus::Rejected).unwrap());
        assert!(!drafts.set_status("msg_missing", ApprovalStatus::Approved).unwrap());

        let loaded = drafts.get(&draft.id).unwrap().unwrap();
        assert_eq!(loaded.approval_status, ApprovalStatus::Rejected);
        assert_eq!(drafts.list_for_batch(&batch.id).unwrap().len(), 1);
        assert_eq!(drafts.list_for_contact(&contact).unwrap().len(), 1);
    }

    #[test]
    fn test_draft_for_unknown_contact_is_refused() {
        let db = OutreachDb::open_in_memory().unwrap();
        let drafts = DraftManager::new(&db);

        let result = drafts.create(NewDraft {
            contact_id: "con_missing".to_string(),
            touch_number: 1,
            touch_type: "inmail".to_string(),
            body: "Hi".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_followups() {
        let db = OutreachDb::open_in_memory().unwrap();
        let drafts = DraftManager::new(&db);
        let contacts = seed_contacts(&db, 2);
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        drafts
            .schedule_followup(&contacts[0], 3, Channel::Linkedin, day)
            .unwrap();
        let pending = drafts.pending_followups(&contacts[0]).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].due_date, day);
        assert!(drafts.pending_followups(&contacts[1]).unwrap().is_empty());

        assert_eq!(drafts.count_due_followups(day).unwrap(), 1);
        assert_eq!(drafts.count_due_followups(day.pred_opt().unwrap()).unwrap(), 0);
    }
}
