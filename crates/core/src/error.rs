//! # Errors
//!
//! Typed errors surfaced by the orchestration layer. Collaborators and the
//! state layer use `anyhow`; these are the errors callers match on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::swarm::phases::Phase;

/// Message recorded when nobody reviews a batch in time
pub const APPROVAL_TIMED_OUT: &str = "Approval timed out";

/// Invalid pipeline configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("prospect #{index} is invalid: {reason}")]
    InvalidProspect { index: usize, reason: String },
}

/// Errors returned by the run registry
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("batch number must be >= 1, got {0}")]
    InvalidBatchNumber(u32),
    #[error("batch #{0} already exists")]
    BatchExists(u32),
    #[error("pipeline run not found: {0}")]
    RunNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Why a run ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// A phase function raised
    PhaseFailed,
    /// The approval gate waited past its timeout
    ApprovalTimedOut,
}

/// Terminal error preserved on a failed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{phase} failed: {message}")]
pub struct RunError {
    pub kind: RunErrorKind,
    pub phase: Phase,
    pub message: String,
}

impl RunError {
    pub fn phase_failed(phase: Phase, error: &anyhow::Error) -> Self {
        Self {
            kind: RunErrorKind::PhaseFailed,
            phase,
            message: format!("{:#}", error),
        }
    }

    pub fn approval_timed_out() -> Self {
        Self {
            kind: RunErrorKind::ApprovalTimedOut,
            phase: Phase::Approval,
            message: APPROVAL_TIMED_OUT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_display() {
        let err = RunError::phase_failed(Phase::Score, &anyhow::anyhow!("db locked"));
        assert_eq!(err.to_string(), "score failed: db locked");
        assert_eq!(err.kind, RunErrorKind::PhaseFailed);

        let timeout = RunError::approval_timed_out();
        assert_eq!(timeout.message, APPROVAL_TIMED_OUT);
        assert_eq!(timeout.phase, Phase::Approval);
    }
}
