//! quorum-ai coordination engine
//!
//! This crate implements the phase sequencer, consensus analysis loop, DAG
//! planner and task executor that drive a multi-agent coding workflow:
//!
//! - `Analyzer`: fan-out/fan-in multi-agent analysis with moderator consensus
//! - `Planner`: turns consolidated analysis into a dependency-ordered task DAG
//! - `Executor`: runs tasks in parallel batches with per-task fallback chains
//! - `Finalizer`: commits, pushes and opens PRs for completed task work
//! - `Runner`: orchestrates the phase sequence end to end, including resume
//!
//! State is persisted through the `StateStore` trait so a workflow can be
//! resumed after a crash or restart without repeating completed phases.

#![allow(dead_code)]

pub mod agent;
pub mod analyzer;
pub mod config;
pub mod control;
pub mod dag;
pub mod doctor;
pub mod error;
pub mod executor;
pub mod file_enforce;
pub mod finalizer;
pub mod git;
pub mod moderator;
pub mod planner;
pub mod prompts;
pub mod rate_limit;
pub mod report;
pub mod retry;
pub mod runner;
pub mod state;
pub mod watchdog;
pub mod worktree;

// Re-export key agent types
pub use agent::{
    Agent, AgentError, AgentRegistry, AgentResult, Capabilities, ExecuteRequest, ExecuteResult,
    Format, FinishReason,
};

// Re-export key error types
pub use error::{is_workflow_cancelled, PhaseError, PhaseResult, StructuredError};

// Re-export key state types
pub use state::{
    AnalysisCheckpointMetadata, AnalysisOutput, Blueprint, Checkpoint, ComprehensiveTaskManifest,
    ExecutionMode, InMemoryStateStore, InteractiveReview, ManifestTask, Metrics,
    ModeratorEvaluationResult, OutputPlacement, PlanTask, Phase, SharedStateStore,
    SledStateStore, StateStore, TaskId, TaskState, TaskStatus, WorkflowDefinition, WorkflowId,
    WorkflowRun, WorkflowState, WorkflowStatus,
};

// Re-export key config types
pub use config::{
    AgentRateLimit, ConfigError, ConfigResult, FinalizeConfig, GitIsolationConfig,
    ModeratorConfig, PhaseTimeouts, SynthesizerConfig, WorkflowConfig, WorktreeMode,
};

// Re-export control plane types
pub use control::{Control, ControlError};

// Re-export DAG types
pub use dag::{DagError, DagResult, Levels, TaskDag};

// Re-export git/GitHub interface types
pub use git::{
    GitChangesInfo, GitClient, GitError, GitHubClient, GitResult, MergeStrategy, PrMergeStrategy,
    PullRequestSpec,
};

// Re-export worktree manager types
pub use worktree::{WorktreeError, WorktreeHandle, WorktreeManager, WorktreeResult};

// Re-export moderator types
pub use moderator::{
    check_termination, Moderator, ModeratorError, ModeratorResult, RoundOutcome, ThresholdConfig,
    ThresholdTable,
};

// Re-export analyzer/planner types
pub use analyzer::Analyzer;
pub use planner::{rebuild_dag_from_state, Planner};

// Re-export executor/finalizer/runner types
pub use executor::{Executor, ExecutorError, ExecutorResult};
pub use finalizer::{Finalizer, FinalizerError, FinalizerResult};
pub use runner::{Runner, RunnerError, RunnerResult};

// Re-export prompt rendering types
pub use prompts::{PromptError, PromptParams, PromptRenderer, PromptResult, PromptVariant};

// Re-export report writer types
pub use report::{FsReportWriter, ReportError, ReportPaths, ReportResult, ReportWriter, RunLayout};

// Re-export rate limiting types
pub use rate_limit::{Limiter, Permit, RateLimitError, RateLimitResult, RateLimiterRegistry};

// Re-export retry types
pub use retry::{retry, Backoff, NoopNotify, RetryError, RetryNotify, RetryPolicy};

// Re-export watchdog types
pub use watchdog::{OutputWatchdog, WatchdogConfig};

// Re-export doctor/readiness-check types
pub use doctor::{AgentReport, DoctorReport};
