//! # Outreach Core
//!
//! The pipeline engine behind the outreach server: run orchestration,
//! bounded task dispatch, progress events, the approval gate and the
//! SQLite state they persist to.
//!
//! ## Architecture
//!
//! - `config` - Typed, validated pipeline configuration
//! - `error` - Errors callers match on
//! - `skills/` - Collaborator traits and the builtin skills
//! - `state/` - SQLite persistence (contacts, batches, drafts, tasks, errors)
//! - `swarm/` - Run controller, supervisor, event bus and run registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use outreach_core::config::PipelineConfig;
//! use outreach_core::state::OutreachDb;
//! use outreach_core::swarm::{EventBus, PipelineServices, RunRegistry};
//!
//! let db = OutreachDb::open()?;
//! let registry = RunRegistry::new(
//!     PipelineServices::builtin(&db, "output"),
//!     Arc::new(EventBus::default()),
//! );
//! let run = registry.start_run(1, PipelineConfig::default())?;
//! ```

pub mod config;
pub mod error;
pub mod skills;
pub mod state;
pub mod swarm;

#[cfg(test)]
mod testing;

pub use config::{Channel, PipelineConfig, Prospect};
pub use error::{ConfigError, PipelineError, RunError, RunErrorKind};
