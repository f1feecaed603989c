pub mod batches;
pub mod contacts;
pub mod db;
pub mod drafts;
pub mod errors;
pub mod tasks;

pub use db::OutreachDb;

pub use batches::{Batch, BatchManager, BatchStatus, BatchStore};
pub use contacts::{Contact, ContactManager, Research};
pub use drafts::{ApprovalStatus, Draft, DraftManager, Followup, NewDraft};
pub use errors::{ErrorLog, ErrorSink, PipelineErrorRecord, Severity};
pub use tasks::{
    dedupe_key, NewTask, TaskKind, TaskManager, TaskRecord, TaskRegistration, TaskStatus,
    TaskStore,
};

/// Prefixed short id, e.g. `con_3f9a1c2b7d4e`
pub fn generate_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &raw[..12])
}
