//! Error taxonomy for the orchestrator.
//!
//! Callers of the control API need to match on a handful of outcomes
//! (duplicate id, unknown worker, illegal transition, ...); everything else
//! — I/O failures, forge-call failures, malformed persisted state — just
//! needs to propagate with context, which is what `anyhow::Error` is for.
use thiserror::Error;

use crate::worker::model::WorkerState;

/// Caller-matched failure cases for the control API (§4.7, §7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("worker '{0}' already exists in a non-terminal state")]
    DuplicateId(String),

    #[error("worker '{0}' not found")]
    NotFound(String),

    #[error("worker '{id}' cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: WorkerState,
        to: WorkerState,
    },

    #[error("worker '{0}' has no attached process")]
    NotRunning(String),

    #[error("failed to create worktree: {0}")]
    WorktreeError(String),

    #[error("failed to spawn worker process: {0}")]
    SpawnError(String),
}

impl OrchestratorError {
    /// Exit code for the `sipag` CLI (§6).
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::NotFound(_) => 3,
            OrchestratorError::DuplicateId(_) => 4,
            OrchestratorError::InvalidTransition { .. } => 5,
            OrchestratorError::NotRunning(_)
            | OrchestratorError::WorktreeError(_)
            | OrchestratorError::SpawnError(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_table() {
        assert_eq!(OrchestratorError::NotFound("x".into()).exit_code(), 3);
        assert_eq!(OrchestratorError::DuplicateId("x".into()).exit_code(), 4);
        assert_eq!(
            OrchestratorError::InvalidTransition {
                id: "x".into(),
                from: WorkerState::Merged,
                to: WorkerState::Working,
            }
            .exit_code(),
            5
        );
        assert_eq!(OrchestratorError::NotRunning("x".into()).exit_code(), 1);
    }

    #[test]
    fn messages_include_worker_id() {
        let e = OrchestratorError::NotFound("feat-1".into());
        assert!(e.to_string().contains("feat-1"));
    }
}
