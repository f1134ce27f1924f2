//! Workflow data model and its persistence boundary.

mod store;
mod types;

pub use store::{
    run_dir, InMemoryStateStore, SharedStateStore, SledStateStore, StateStore, StoreError,
    StoreResult,
};
pub use types::{
    AnalysisCheckpointMetadata, AnalysisOutput, Blueprint, Checkpoint, ComprehensiveTaskManifest,
    ExecutionMode, InteractiveReview, ManifestTask, Metrics, ModeratorEvaluationResult,
    OutputPlacement, Phase, PlanTask, TaskId, TaskState, TaskStatus, WorkflowDefinition,
    WorkflowId, WorkflowRun, WorkflowState, WorkflowStatus, MAX_INLINE_OUTPUT_SIZE,
};
