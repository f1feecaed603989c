//! # Pipeline Error Log
//!
//! Best-effort sink for entity and phase failures. Recording never fails the
//! caller; a broken sink only logs.

use super::db::OutreachDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "info" => Self::Info,
            "critical" => Self::Critical,
            _ => Self::Warning,
        }
    }
}

/// One recorded failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineErrorRecord {
    pub batch_id: Option<String>,
    pub entity_id: Option<String>,
    pub phase: String,
    pub agent_name: Option<String>,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl PipelineErrorRecord {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            batch_id: None,
            entity_id: None,
            phase: phase.into(),
            agent_name: None,
            message: message.into(),
            context: serde_json::Value::Null,
            severity: Severity::Warning,
            created_at: Utc::now(),
        }
    }

    pub fn with_batch(mut self, batch_id: Option<&str>) -> Self {
        self.batch_id = batch_id.map(String::from);
        self
    }

    pub fn with_entity(mut self, entity_id: &str) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Destination for pipeline failures
pub trait ErrorSink: Send + Sync {
    fn record(&self, error: &PipelineErrorRecord);
}

/// Persists failures to `pipeline_errors`
pub struct ErrorLog {
    conn: Arc<Mutex<Connection>>,
}

impl ErrorLog {
    pub fn new(db: &OutreachDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn insert(&self, error: &PipelineErrorRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute(
            r#"
            INSERT INTO pipeline_errors
            (batch_id, entity_id, phase, agent_name, error_message, context_json, severity,
             created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                error.batch_id,
                error.entity_id,
                error.phase,
                error.agent_name,
                error.message,
                serde_json::to_string(&error.context)?,
                error.severity.as_str(),
                error.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert pipeline error")?;
        Ok(())
    }

    /// Most recent errors first, optionally for one batch
    pub fn list_recent(
        &self,
        batch_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PipelineErrorRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let mut stmt = conn.prepare(
            r#"
            SELECT batch_id, entity_id, phase, agent_name, error_message, context_json,
                   severity, created_at
            FROM pipeline_errors
            WHERE ?1 IS NULL OR batch_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let records = stmt
            .query_map(params![batch_id, limit as i64], |row| {
                let context_json: String = row.get(5)?;
                let created_at: String = row.get(7)?;
                Ok(PipelineErrorRecord {
                    batch_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    phase: row.get(2)?,
                    agent_name: row.get(3)?,
                    message: row.get(4)?,
                    context: serde_json::from_str(&context_json).unwrap_or_default(),
                    severity: Severity::from_str(&row.get::<_, String>(6)?),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list pipeline errors")?;

        Ok(records)
    }

    /// Errors recorded at or after `since`
    pub fn count_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pipeline_errors WHERE created_at >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl ErrorSink for ErrorLog {
    fn record(&self, error: &PipelineErrorRecord) {
        match error.severity {
            Severity::Info => tracing::info!(
                phase = %error.phase,
                entity = error.entity_id.as_deref().unwrap_or("-"),
                "{}",
                error.message
            ),
            Severity::Warning => tracing::warn!(
                phase = %error.phase,
                entity = error.entity_id.as_deref().unwrap_or("-"),
                "{}",
                error.message
            ),
            Severity::Critical => tracing::error!(
                phase = %error.phase,
                entity = error.entity_id.as_deref().unwrap_or("-"),
                "{}",
                error.message
            ),
        }

        if let Err(e) = self.insert(error) {
            tracing::error!(error = %e, "failed to persist pipeline error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_list() {
        let db = OutreachDb::open_in_memory().unwrap();
        let log = ErrorLog::new(&db);

        log.record(
            &PipelineErrorRecord::new("research", "timeout")
                .with_batch(Some("bat_1"))
                .with_entity("con_1")
                .with_agent("research_agent"),
        );
        log.record(
            &PipelineErrorRecord::new("score", "db locked")
                .with_batch(Some("bat_2"))
                .with_severity(Severity::Critical)
                .with_context(serde_json::json!({ "attempt": 1 })),
        );

        let all = log.list_recent(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].phase, "score");
        assert_eq!(all[0].severity, Severity::Critical);
        assert_eq!(all[0].context["attempt"], 1);

        let first_batch = log.list_recent(Some("bat_1"), 10).unwrap();
        assert_eq!(first_batch.len(), 1);
        assert_eq!(first_batch[0].entity_id.as_deref(), Some("con_1"));
    }
}
