//! Error taxonomy shared across the engine.
//!
//! Individual modules define their own `XxxError`/`XxxResult` pairs for
//! internal detail (see `rate_limit`, `dag`, `worktree`, `watchdog`); this
//! module holds the taxonomy that crosses module boundaries — the errors a
//! phase (`Analyzer`/`Planner`/`Executor`) can return to the `Runner`, plus
//! the agent-facing [`StructuredError`] used for the terminal error
//! checkpoint.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Structured, agent-friendly error payload.
///
/// Every engine error that reaches a checkpoint or a CLI exit carries a machine-readable
/// `code`, a human message, and a `recovery_action` telling the operator (or
/// a supervising agent) what to do next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub recovery_action: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
            retryable: false,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// Errors a phase (`Analyzer`, `Planner`, `Executor`) can return to the `Runner`.
///
/// Categories follow spec §7 exactly: Validation, Consensus, State,
/// Execution, Finalization, Partial, Cancellation.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Input validation failed before any phase work started.
    #[error("validation error [{code}]: {message}")]
    Validation { code: String, message: String },

    /// Moderator consensus score fell below `abort_threshold`.
    #[error("human review required: score {score:.3} below threshold {threshold:.3}")]
    HumanReviewRequired { score: f64, threshold: f64 },

    /// Durable-state invariant violated (missing analysis, stuck DAG, cycle).
    #[error("state error [{code}]: {message}")]
    State { code: String, message: String },

    /// An agent subprocess / fallback chain exhausted without success.
    #[error("execution error: {0}")]
    Execution(String),

    /// A post-task git operation (commit/push/PR) failed.
    #[error("finalization error: {0}")]
    Finalization(String),

    /// Fewer successful agent invocations than required (e.g. V1 fan-out).
    #[error("insufficient successful results: got {got}, need {need}")]
    Partial { got: usize, need: usize },

    /// The workflow context or control plane was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// A lower-level engine error that doesn't need its own variant here.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PhaseResult<T> = Result<T, PhaseError>;

impl PhaseError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn state(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::State {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Map this error onto the [`StructuredError`] persisted in the error checkpoint.
    pub fn to_structured(&self) -> StructuredError {
        match self {
            Self::Validation { code, message } => StructuredError::new(
                code.clone(),
                message.clone(),
                "fix the input (prompt, timeout, agent config) and re-run",
            ),
            Self::HumanReviewRequired { score, threshold } => {
                StructuredError::new(
                    "HUMAN_REVIEW_REQUIRED",
                    format!("consensus score {score:.3} is below abort threshold {threshold:.3}"),
                    "inspect the analysis round outputs and either relax abort_threshold or \
                     provide a clarifying prompt before resuming",
                )
                .with_context("score", serde_json::json!(score))
                .with_context("threshold", serde_json::json!(threshold))
            }
            Self::State { code, message } => StructuredError::new(
                code.clone(),
                message.clone(),
                "inspect checkpoints for the last good phase and resume",
            ),
            Self::Execution(msg) => StructuredError::new(
                "EXECUTION_FAILED",
                msg.clone(),
                "check agent availability and rate limits, then resume",
            )
            .retryable(),
            Self::Finalization(msg) => StructuredError::new(
                "FINALIZATION_FAILED",
                msg.clone(),
                "resolve the git/PR error manually; the task worktree is preserved",
            ),
            Self::Partial { got, need } => StructuredError::new(
                "INSUFFICIENT_RESULTS",
                format!("only {got} of {need} required agent invocations succeeded"),
                "check failed agents' logs and re-run once capacity is restored",
            )
            .retryable(),
            Self::Cancelled => StructuredError::new(
                "CANCELLED",
                "workflow was cancelled".to_string(),
                "resume the workflow to continue from the last checkpoint",
            ),
            Self::Other(e) => StructuredError::new("INTERNAL_ERROR", e.to_string(), "see logs"),
        }
    }
}

/// Recognizes cancellation regardless of whether it surfaced as a
/// `tokio::task::JoinError`-style cancellation, a `PhaseError::Cancelled`,
/// or the domain `CANCELLED` structured-error code.
pub fn is_workflow_cancelled(err: &PhaseError) -> bool {
    match err {
        PhaseError::Cancelled => true,
        PhaseError::State { code, .. } => code == "CANCELLED",
        _ => false,
    }
}
