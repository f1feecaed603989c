//! # Swarm Task Store
//!
//! Persistent audit trail of every unit of work the dispatcher runs.
//! Tasks are never deleted; a `(run_id, dedupe_key)` pair owns exactly one row.

use super::db::OutreachDb;
use super::generate_id;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Kind of per-entity work the dispatcher runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Research,
    Draft,
    Qa,
    Sequence,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Draft => "draft",
            Self::Qa => "qa",
            Self::Sequence => "sequence",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "draft" => Self::Draft,
            "qa" => Self::Qa,
            "sequence" => Self::Sequence,
            _ => Self::Research,
        }
    }

    /// Name recorded in the audit trail for the agent doing this work
    pub fn agent_name(&self) -> String {
        format!("{}_agent", self.as_str())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedupe key for one entity within one phase
pub fn dedupe_key(kind: TaskKind, entity_id: &str) -> String {
    format!("{}:{}", kind.as_str(), entity_id)
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// A stored task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub run_id: String,
    pub agent_name: String,
    pub kind: TaskKind,
    pub entity_id: String,
    pub dedupe_key: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Errored with no retry budget left
    pub fn is_terminal_error(&self) -> bool {
        self.status == TaskStatus::Error && self.retry_count >= self.max_retries
    }
}

/// Request to register a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub run_id: String,
    pub kind: TaskKind,
    pub entity_id: String,
    pub input: serde_json::Value,
    pub max_retries: u32,
}

/// Result of registering a task under its dedupe key
#[derive(Debug, Clone)]
pub enum TaskRegistration {
    /// First registration for this key
    Created(TaskRecord),
    /// An errored task with budget left was re-armed
    Retry(TaskRecord),
    /// The key is already taken; the existing record is returned untouched
    Duplicate(TaskRecord),
}

/// Persistence for swarm tasks
pub trait TaskStore: Send + Sync {
    /// Register a task, honouring the `(run_id, dedupe_key)` uniqueness
    fn register(&self, task: NewTask) -> Result<TaskRegistration>;
    fn mark_running(&self, task_id: &str) -> Result<()>;
    fn complete(&self, task_id: &str, output: &serde_json::Value) -> Result<()>;
    fn fail(&self, task_id: &str, error: &str) -> Result<()>;
    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;
    fn find_by_key(&self, run_id: &str, dedupe_key: &str) -> Result<Option<TaskRecord>>;
    fn list_for_run(&self, run_id: &str) -> Result<Vec<TaskRecord>>;
    fn count_for_run(&self, run_id: &str) -> Result<usize>;
}

const TASK_COLUMNS: &str = r#"
    id, run_id, agent_name, task_type, entity_id, dedupe_key, input_json, output_json,
    status, retry_count, max_retries, error_message, started_at, completed_at, created_at
"#;

/// SQLite-backed task store
pub struct TaskManager {
    conn: Arc<Mutex<Connection>>,
}

impl TaskManager {
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

    fn find(conn: &Connection, sql_where: &str, args: &[&str]) -> Result<Option<TaskRecord>> {
        let sql = format!("SELECT {} FROM swarm_tasks WHERE {}", TASK_COLUMNS, sql_where);
        let mut stmt = conn.prepare(&sql)?;
        let record = stmt
            .query_row(rusqlite::params_from_iter(args.iter()), Self::row_to_task)
            .optional()
            .context("Failed to load swarm task")?;
        Ok(record)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
        let input_json: String = row.get(6)?;
        let output_json: Option<String> = row.get(7)?;

        Ok(TaskRecord {
            id: row.get(0)?,
            run_id: row.get(1)?,
            agent_name: row.get(2)?,
            kind: TaskKind::from_str(&row.get::<_, String>(3)?),
            entity_id: row.get(4)?,
            dedupe_key: row.get(5)?,
            input: serde_json::from_str(&input_json).unwrap_or_default(),
            output: output_json.and_then(|s| serde_json::from_str(&s).ok()),
            status: TaskStatus::from_str(&row.get::<_, String>(8)?),
            retry_count: row.get(9)?,
            max_retries: row.get(10)?,
            error: row.get(11)?,
            started_at: parse_time(row.get(12)?),
            completed_at: parse_time(row.get(13)?),
            created_at: parse_time(row.get(14)?).unwrap_or_else(Utc::now),
        })
    }
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
    })
}

impl TaskStore for TaskManager {
    fn register(&self, task: NewTask) -> Result<TaskRegistration> {
        let conn = self.lock()?;
        let key = dedupe_key(task.kind, &task.entity_id);

        if let Some(existing) = Self::find(
            &conn,
            "run_id = ?1 AND dedupe_key = ?2",
            &[task.run_id.as_str(), key.as_str()],
        )? {
            if existing.status == TaskStatus::Error && existing.retry_count < existing.max_retries
            {
                conn.execute(
                    r#"
                    UPDATE swarm_tasks
                    SET status = 'pending', retry_count = retry_count + 1,
                        error_message = NULL, started_at = NULL, completed_at = NULL
                    WHERE id = ?1
                    "#,
                    params![existing.id],
                )?;
                let rearmed = Self::find(&conn, "id = ?1", &[existing.id.as_str()])?
                    .ok_or_else(|| anyhow::anyhow!("Task vanished: {}", existing.id))?;
                return Ok(TaskRegistration::Retry(rearmed));
            }
            return Ok(TaskRegistration::Duplicate(existing));
        }

        let record = TaskRecord {
            id: generate_id("stask"),
            run_id: task.run_id,
            agent_name: task.kind.agent_name(),
            kind: task.kind,
            entity_id: task.entity_id,
            dedupe_key: key,
            input: task.input,
            output: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: task.max_retries,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };

        conn.execute(
            r#"
            INSERT INTO swarm_tasks
            (id, run_id, agent_name, task_type, entity_id, dedupe_key, input_json,
             status, retry_count, max_retries, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.run_id,
                record.agent_name,
                record.kind.as_str(),
                record.entity_id,
                record.dedupe_key,
                serde_json::to_string(&record.input)?,
                record.status.as_str(),
                record.retry_count,
                record.max_retries,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert swarm task")?;

        Ok(TaskRegistration::Created(record))
    }

    fn mark_running(&self, task_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE swarm_tasks SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), task_id],
        )?;
        Ok(())
    }

    fn complete(&self, task_id: &str, output: &serde_json::Value) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            UPDATE swarm_tasks
            SET status = 'completed', output_json = ?1, completed_at = ?2
            WHERE id = ?3
            "#,
            params![serde_json::to_string(output)?, Utc::now().to_rfc3339(), task_id],
        )?;
        if affected == 0 {
            anyhow::bail!("Swarm task not found: {}", task_id);
        }
        Ok(())
    }

    fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            UPDATE swarm_tasks
            SET status = 'error', error_message = ?1, completed_at = ?2
            WHERE id = ?3
            "#,
            params![error, Utc::now().to_rfc3339(), task_id],
        )?;
        if affected == 0 {
            anyhow::bail!("Swarm task not found: {}", task_id);
        }
        Ok(())
    }

    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;
        Self::find(&conn, "id = ?1", &[task_id])
    }

    fn find_by_key(&self, run_id: &str, dedupe_key: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;
        Self::find(&conn, "run_id = ?1 AND dedupe_key = ?2", &[run_id, dedupe_key])
    }

    fn list_for_run(&self, run_id: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM swarm_tasks WHERE run_id = ?1 ORDER BY created_at, id",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![run_id], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list swarm tasks")?;
        Ok(tasks)
    }

    fn count_for_run(&self, run_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM swarm_tasks WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
