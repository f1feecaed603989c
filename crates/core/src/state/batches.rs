//! # Batch State Management
//!
//! A batch is the unit a pipeline run builds: a numbered set of prospects,
//! an A/B experiment definition and the drafts reviewed at the approval gate.

use super::db::OutreachDb;
use super::drafts::{ApprovalStatus, Draft, DraftManager};
use super::generate_id;
use crate::config::PipelineConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Lifecycle status of a batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Building,
    Complete,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Building,
        }
    }
}

/// A numbered batch of prospects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub batch_number: u32,
    pub prospect_count: u32,
    pub ab_variable: Option<String>,
    pub ab_groups: BTreeMap<String, String>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Batch persistence used by the run controller
pub trait BatchStore: Send + Sync {
    fn create_batch(&self, batch_number: u32, config: &PipelineConfig) -> Result<Batch>;
    fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>>;
    fn batch_number_exists(&self, batch_number: u32) -> Result<bool>;
    fn update_status(&self, batch_id: &str, status: BatchStatus) -> Result<()>;
    /// Link contacts to the batch, keeping the given order
    fn add_contacts(&self, batch_id: &str, contact_ids: &[String]) -> Result<()>;
    fn list_contacts(&self, batch_id: &str) -> Result<Vec<String>>;
    /// Drafts awaiting review for this batch
    fn list_artifacts(&self, batch_id: &str) -> Result<Vec<Draft>>;
    /// Returns false for an unknown artifact id
    fn set_artifact_status(&self, artifact_id: &str, status: ApprovalStatus) -> Result<bool>;
}

/// SQLite-backed batch store
pub struct BatchManager {
    conn: Arc<Mutex<Connection>>,
    drafts: DraftManager,
}

impl BatchManager {
    pub fn new(db: &OutreachDb) -> Self {
        Self {
            conn: db.connection(),
            drafts: DraftManager::new(db),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// Batch by its number
    pub fn get_by_number(&self, batch_number: u32) -> Result<Option<Batch>> {
        let conn = self.lock()?;
        let batch = conn
            .query_row(
                &format!("SELECT {} FROM batches WHERE batch_number = ?1", BATCH_COLUMNS),
                params![batch_number],
                Self::row_to_batch,
            )
            .optional()?;
        Ok(batch)
    }

    /// Record the experiment group of a contact within a batch
    pub fn set_ab_group(&self, batch_id: &str, contact_id: &str, group: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE batch_prospects SET ab_group = ?1 WHERE batch_id = ?2 AND contact_id = ?3",
            params![group, batch_id, contact_id],
        )?;
        Ok(())
    }

    pub fn ab_group(&self, batch_id: &str, contact_id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let group: Option<Option<String>> = conn
            .query_row(
                "SELECT ab_group FROM batch_prospects WHERE batch_id = ?1 AND contact_id = ?2",
                params![batch_id, contact_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(group.flatten())
    }

    fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
        let groups_json: String = row.get(4)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;

        Ok(Batch {
            id: row.get(0)?,
            batch_number: row.get(1)?,
            prospect_count: row.get(2)?,
            ab_variable: row.get(3)?,
            ab_groups: serde_json::from_str(&groups_json).unwrap_or_default(),
            status: BatchStatus::from_str(&row.get::<_, String>(5)?),
            created_at: parse_time(&created_at),
            updated_at: parse_time(&updated_at),
        })
    }
}

const BATCH_COLUMNS: &str =
    "id, batch_number, prospect_count, ab_variable, ab_groups_json, status, created_at, updated_at";

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl BatchStore for BatchManager {
    fn create_batch(&self, batch_number: u32, config: &PipelineConfig) -> Result<Batch> {
        let now = Utc::now();
        let batch = Batch {
            id: generate_id("bat"),
            batch_number,
            prospect_count: 0,
            ab_variable: Some(config.ab_variable.clone()),
            ab_groups: config.ab_groups.clone(),
            status: BatchStatus::Building,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO batches
            (id, batch_number, prospect_count, ab_variable, ab_groups_json, status,
             created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                batch.id,
                batch.batch_number,
                batch.prospect_count,
                batch.ab_variable,
                serde_json::to_string(&batch.ab_groups)?,
                batch.status.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to create batch #{}", batch_number))?;

        Ok(batch)
    }

    fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let conn = self.lock()?;
        let batch = conn
            .query_row(
                &format!("SELECT {} FROM batches WHERE id = ?1", BATCH_COLUMNS),
                params![batch_id],
                Self::row_to_batch,
            )
            .optional()
            .context("Failed to load batch")?;
        Ok(batch)
    }

    fn batch_number_exists(&self, batch_number: u32) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM batches WHERE batch_number = ?1",
            params![batch_number],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn update_status(&self, batch_id: &str, status: BatchStatus) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE batches SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), batch_id],
        )?;
        if affected == 0 {
            anyhow::bail!("Batch not found: {}", batch_id);
        }
        Ok(())
    }

    fn add_contacts(&self, batch_id: &str, contact_ids: &[String]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let start: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM batch_prospects WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;

        for (offset, contact_id) in contact_ids.iter().enumerate() {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO batch_prospects (batch_id, contact_id, position)
                VALUES (?1, ?2, ?3)
                "#,
                params![batch_id, contact_id, start + offset as i64],
            )?;
        }

        tx.execute(
            r#"
            UPDATE batches
            SET prospect_count = (SELECT COUNT(*) FROM batch_prospects WHERE batch_id = ?1),
                updated_at = ?2
            WHERE id = ?1
            "#,
            params![batch_id, Utc::now().to_rfc3339()],
        )?;

        tx.commit().context("Failed to link contacts to batch")?;
        Ok(())
    }

    fn list_contacts(&self, batch_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT contact_id FROM batch_prospects WHERE batch_id = ?1 ORDER BY position",
        )?;
        let ids = stmt
            .query_map(params![batch_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn list_artifacts(&self, batch_id: &str) -> Result<Vec<Draft>> {
        self.drafts.list_for_batch(batch_id)
    }

    fn set_artifact_status(&self, artifact_id: &str, status: ApprovalStatus) -> Result<bool> {
        self.drafts.set_status(artifact_id, status)
    }
}
