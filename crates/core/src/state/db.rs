//! # Outreach Database
//!
//! Single SQLite database for batches, contacts, drafts and the swarm task
//! audit trail. Lives at `.outreach/outreach.db` by default.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Shared database handle used by every manager
pub struct OutreachDb {
    conn: Arc<Mutex<Connection>>,
}

impl OutreachDb {
    /// Open or create the database at `.outreach/outreach.db`
    pub fn open() -> Result<Self> {
        Self::open_at(".outreach/outreach.db")
    }

    /// Open database at a specific path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open outreach database")?;
        let _mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL journal")?;

        Self::from_connection(conn)
    }

    /// Open a private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }
        if current_version < 2 {
            migrate_v2(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [2],
            )?;
        }

        tracing::debug!(version = SCHEMA_VERSION, "database schema ready");
        Ok(())
    }
}

/// Version 1 - batches, contacts, drafts, swarm tasks
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL DEFAULT '',
            title TEXT,
            company_name TEXT,
            email TEXT,
            linkedin_url TEXT,
            persona_type TEXT,
            readiness_score INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS research_snapshots (
            id TEXT PRIMARY KEY,
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            headline TEXT,
            company_news TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            batch_number INTEGER NOT NULL UNIQUE,
            prospect_count INTEGER NOT NULL DEFAULT 0,
            ab_variable TEXT,
            ab_groups_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'building',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS batch_prospects (
            batch_id TEXT NOT NULL REFERENCES batches(id),
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            ab_group TEXT,
            position INTEGER NOT NULL,
            PRIMARY KEY (batch_id, contact_id)
        );

        CREATE TABLE IF NOT EXISTS message_drafts (
            id TEXT PRIMARY KEY,
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            batch_id TEXT REFERENCES batches(id),
            channel TEXT NOT NULL,
            touch_number INTEGER NOT NULL,
            touch_type TEXT NOT NULL,
            subject_line TEXT,
            body TEXT NOT NULL DEFAULT '',
            proof_point_used TEXT,
            ab_group TEXT,
            approval_status TEXT NOT NULL DEFAULT 'draft',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS followups (
            id TEXT PRIMARY KEY,
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            touch_number INTEGER NOT NULL,
            channel TEXT NOT NULL,
            due_date TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS swarm_tasks (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            agent_name TEXT NOT NULL,
            task_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            dedupe_key TEXT NOT NULL,
            input_json TEXT NOT NULL DEFAULT '{}',
            output_json TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 2,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_swarm_tasks_dedupe
            ON swarm_tasks(run_id, dedupe_key);
        CREATE INDEX IF NOT EXISTS idx_drafts_contact ON message_drafts(contact_id);
        CREATE INDEX IF NOT EXISTS idx_drafts_batch ON message_drafts(batch_id);
        CREATE INDEX IF NOT EXISTS idx_research_contact ON research_snapshots(contact_id);
        "#,
    )
    .context("Failed to apply schema v1")?;
    Ok(())
}

/// Version 2 - pipeline error log
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT,
            entity_id TEXT,
            phase TEXT NOT NULL,
            agent_name TEXT,
            error_message TEXT NOT NULL,
            context_json TEXT NOT NULL DEFAULT '{}',
            severity TEXT NOT NULL DEFAULT 'warning',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pipeline_errors_batch ON pipeline_errors(batch_id);
        "#,
    )
    .context("Failed to apply schema v2")?;
    Ok(())
}
