//! # Swarm Orchestration
//!
//! Runs a batch of prospects through the outreach pipeline.
//!
//! ## Pipeline Flow
//!
//! ```text
//! RunRegistry::start_run ─▶ PipelineRun (one tokio task per run)
//!                              ├── PhaseFunctions (single-shot phases)
//!                              ├── SwarmSupervisor (per-contact work, bounded)
//!                              └── approval gate ◀── submit_approval / skip_approval
//!
//! every mutation ─▶ watch snapshot + EventBus ─▶ subscribers
//! ```
//!
//! Outside of runs, [`actions`] performs one-off work on a single contact or
//! batch and [`insights`] rolls up daily and weekly activity.

pub mod actions;
pub mod bus;
pub mod events;
pub mod insights;
pub mod phases;
pub mod registry;
pub mod runner;
pub mod supervisor;

pub use actions::{ActionRequest, ActionResult, ActionStatus, AgentAction};
pub use bus::{EventBus, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use events::{PipelineEvent, PipelineEventKind};
pub use insights::{ChannelReview, DailySummary, PendingWork, RunTally, WeeklyReview};
pub use phases::{
    ApprovalDecisions, ApprovalMode, ApprovalTally, Decision, Phase, PhaseOutcome, PhaseRecord,
    RunSnapshot, RunStatus,
};
pub use registry::{PipelineServices, RunHandle, RunRegistry};
pub use runner::ApprovalCommand;
pub use supervisor::{
    BatchReport, PhaseReport, PhaseSummary, SkipReason, SwarmSupervisor, TaskOutcome,
};
