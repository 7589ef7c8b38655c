//! Typed error hierarchy for the stageward orchestrator.
//!
//! Three enums cover the three failure surfaces:
//! - `BackendError` — model backend call failures (network, auth, timeout)
//! - `TransitionError` — rejected stage transitions (stale, terminal, unknown)
//! - `WorkflowError` — per-turn failures surfaced through `WorkflowResult`
//!
//! Supervisor parse failures and stale transitions are recovered inside the
//! turn (verdict degrades to `stay`, stale decisions are discarded), so they
//! never appear as a `WorkflowError`.

use thiserror::Error;

/// Errors raised when calling a model backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Rejected stage transitions. All variants are recoverable: the
/// orchestrator discards the decision and stays in place.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("decision was evaluated against stage {decided_for} but session is at {current}")]
    StaleDecision { decided_for: String, current: String },

    #[error("stage {stage_id} is terminal, nothing to advance to")]
    AtTerminal { stage_id: String },

    #[error("stage {stage_id} is not part of the protocol")]
    UnknownStage { stage_id: String },
}

/// Errors that fail a whole turn. Converted into a failed `WorkflowResult`
/// at the orchestrator boundary; never propagated to the caller as a panic
/// or a raw `Err`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("responder generation failed: {source}")]
    ResponderFailure {
        #[source]
        source: BackendError,
    },

    #[error("safety screening failed: {0}")]
    SafetyInterceptFailure(String),

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("session store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("stage {stage_id} referenced by session is not part of the protocol")]
    UnknownStage { stage_id: String },
}

impl WorkflowError {
    /// Stable machine-readable kind for the produced-result contract.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::ResponderFailure { .. } => "ResponderFailure",
            WorkflowError::SafetyInterceptFailure(_) => "SafetyInterceptFailure",
            WorkflowError::SessionNotFound { .. } => "SessionNotFound",
            WorkflowError::Store(_) => "StoreFailure",
            WorkflowError::UnknownStage { .. } => "UnknownStage",
        }
    }
}
