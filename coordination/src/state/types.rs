//! Core data model for one workflow run.
//!
//! Mirrors spec §3 exactly: [`WorkflowState`] splits into a `Definition`
//! (immutable after creation) and a `Run` (mutated as phases progress),
//! [`TaskState`] is the per-task record mutated by the `Executor`, and
//! [`Checkpoint`] is the append-only event log entry that makes a run
//! resumable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum bytes of task output kept inline in [`TaskState::output`] before
/// spilling to `OutputFile` (spec §3, §4.5 step 9).
pub const MAX_INLINE_OUTPUT_SIZE: usize = 16 * 1024;

/// Opaque, globally-unique workflow identifier, always prefixed `wf-`.
///
/// A newtype (rather than a bare `String` alias) so the `wf-` prefix
/// invariant is enforced at construction time instead of by convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Generate a fresh workflow id: `wf-<uuid-v4>`.
    pub fn new() -> Self {
        Self(format!("wf-{}", uuid::Uuid::new_v4()))
    }

    /// Wrap an existing id, validating the `wf-` prefix.
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        if !raw.starts_with("wf-") {
            return Err(format!("workflow id {raw:?} missing required 'wf-' prefix"));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task identifier, unique within a workflow (not globally).
pub type TaskId = String;

/// The four fixed pipeline phases (spec §1/§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refine,
    Analyze,
    Plan,
    Execute,
}

impl Phase {
    /// Fixed phase order; `Runner` walks this list.
    pub const ORDER: [Phase; 4] = [Phase::Refine, Phase::Analyze, Phase::Plan, Phase::Execute];

    pub fn next(self) -> Option<Phase> {
        let idx = Self::ORDER.iter().position(|p| *p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Refine => "refine",
            Phase::Analyze => "analyze",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
        };
        write!(f, "{s}")
    }
}

/// Overall workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    AwaitingReview,
    Completed,
    Failed,
}

/// Execution mode carried in the (optional) workflow blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    MultiAgent,
    Interactive,
}

/// Optional, user-supplied shape for the workflow (spec §3 `Blueprint`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub execution_mode: ExecutionMode,
}

/// The immutable half of [`WorkflowState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub prompt: String,
    pub blueprint: Option<Blueprint>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate run metrics (spec §3 `Metrics`), filled in incrementally as
/// agents report token/cost usage and the moderator reports scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost_usd: f64,
    pub consensus_score: Option<f64>,
    #[serde(with = "duration_opt_secs", default)]
    pub duration: Option<Duration>,
}

mod duration_opt_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

/// Nested record tracking a pause for human review (spec §3 `InteractiveReview`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveReview {
    pub requested_at: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// The mutable half of [`WorkflowState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub tasks: HashMap<TaskId, TaskState>,
    /// Insertion order of `tasks`, kept separate so iteration order is stable
    /// even though `tasks` is a map (spec §3 invariant: `tasks` keys equal
    /// `task_order` as a set, each task appears at most once in `task_order`).
    pub task_order: Vec<TaskId>,
    pub checkpoints: Vec<Checkpoint>,
    pub metrics: Metrics,
    pub interactive_review: Option<InteractiveReview>,
    pub heartbeat_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub report_path: Option<PathBuf>,
    pub workflow_branch: Option<String>,
}

/// The durable record for one workflow run (spec §3 `WorkflowState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub definition: WorkflowDefinition,
    pub run: WorkflowRun,
}

impl WorkflowState {
    pub fn new(prompt: impl Into<String>, blueprint: Option<Blueprint>) -> Self {
        let now = Utc::now();
        Self {
            definition: WorkflowDefinition {
                id: WorkflowId::new(),
                prompt: prompt.into(),
                blueprint,
                created_at: now,
            },
            run: WorkflowRun {
                status: WorkflowStatus::Pending,
                current_phase: Phase::Refine,
                tasks: HashMap::new(),
                task_order: Vec::new(),
                checkpoints: Vec::new(),
                metrics: Metrics::default(),
                interactive_review: None,
                heartbeat_at: now,
                updated_at: now,
                report_path: None,
                workflow_branch: None,
            },
        }
    }

    pub fn id(&self) -> &WorkflowId {
        &self.definition.id
    }

    /// Invariant check: `tasks` keys equal `task_order` as a set, and no
    /// task id appears twice in `task_order`. Used by tests and by
    /// `ExecuteAtomically`-style persistence paths as a defensive assert.
    pub fn invariants_hold(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        for id in &self.run.task_order {
            if !seen.insert(id) {
                return false;
            }
        }
        seen.len() == self.run.tasks.len() && self.run.tasks.keys().all(|k| seen.contains(k))
    }

    /// Add a new task, preserving insertion order exactly once.
    pub fn insert_task(&mut self, task: TaskState) {
        if !self.run.tasks.contains_key(&task.id) {
            self.run.task_order.push(task.id.clone());
        }
        self.run.tasks.insert(task.id.clone(), task);
        self.touch();
    }

    pub fn append_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.run.checkpoints.push(checkpoint);
        self.touch();
    }

    /// Most recent checkpoint of `kind` for `phase`, if any.
    pub fn last_checkpoint(&self, phase: Phase, kind: &str) -> Option<&Checkpoint> {
        self.run
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.phase == phase && c.kind == kind)
    }

    pub fn phase_complete(&self, phase: Phase) -> bool {
        self.last_checkpoint(phase, "phase_complete").is_some()
    }

    fn touch(&mut self) {
        self.run.updated_at = Utc::now();
    }
}

/// Per-task status (spec §3 `TaskState.Status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-task record mutated throughout the Execute phase (spec §3 `TaskState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: TaskId,
    pub phase: Phase,
    pub name: String,
    pub dependencies: Vec<TaskId>,
    pub cli: String,
    pub model: Option<String>,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub retries: u32,
    pub error: Option<String>,
    pub output: Option<String>,
    pub output_file: Option<PathBuf>,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub files_modified: Vec<String>,
    pub resumable: bool,
    pub merge_pending: bool,
    pub tool_calls: Vec<String>,
}

impl TaskState {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cli: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: Phase::Execute,
            name: name.into(),
            dependencies: Vec::new(),
            cli: cli.into(),
            model: None,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            retries: 0,
            error: None,
            output: None,
            output_file: None,
            worktree_path: None,
            branch: None,
            last_commit: None,
            files_modified: Vec::new(),
            resumable: false,
            merge_pending: false,
            tool_calls: Vec::new(),
        }
    }

    /// Store `output`, spilling to an external file reference if it exceeds
    /// [`MAX_INLINE_OUTPUT_SIZE`] (spec §3, §4.5 step 9). The caller is
    /// responsible for actually writing `output` to `file_path` via the
    /// `ReportWriter` when this returns `Spill`.
    pub fn record_output(&mut self, output: &str, file_path: PathBuf) -> OutputPlacement {
        if output.len() <= MAX_INLINE_OUTPUT_SIZE {
            self.output = Some(output.to_string());
            self.output_file = None;
            OutputPlacement::Inline
        } else {
            self.output = None;
            self.output_file = Some(file_path.clone());
            OutputPlacement::Spill(file_path)
        }
    }
}

/// Where a task's output ended up after [`TaskState::record_output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputPlacement {
    Inline,
    Spill(PathBuf),
}

/// A single append-only checkpoint event (spec §3 `Checkpoint`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub kind: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    /// Opaque serialized metadata; the concrete shape is checkpoint-kind
    /// specific and is never interpreted outside the component that wrote
    /// it except to round-trip it back into a typed value on resume.
    pub data: serde_json::Value,
}

impl Checkpoint {
    pub fn new(phase: Phase, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            phase,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Per-agent analysis result for one round (spec §3 `AnalysisOutput`).
///
/// `agent_name` carries the round prefix (`"v2-claude"`) once past round 1,
/// matching the naming convention in spec §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub agent_name: String,
    pub model: Option<String>,
    pub raw_output: String,
    pub claims: Vec<String>,
    pub risks: Vec<String>,
    pub recommendations: Vec<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub duration: Duration,
}

/// Cache metadata for one agent's analysis file, used to skip re-invocation
/// on resume when the prompt hash and on-disk content both still match
/// (spec §4.2 "Caching on resume").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCheckpointMetadata {
    pub agent_name: String,
    pub model: Option<String>,
    pub round: u32,
    pub file_path: PathBuf,
    pub prompt_hash: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    pub content_hash: String,
}

/// Plan entity before it becomes a [`TaskState`] (spec §3 `Task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: TaskId,
    pub phase: Phase,
    pub name: String,
    pub description: String,
    pub cli: String,
    pub model: Option<String>,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
}

/// One entry in a [`ComprehensiveTaskManifest`] (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestTask {
    pub id: TaskId,
    pub name: String,
    pub file: PathBuf,
    pub dependencies: Vec<TaskId>,
    pub complexity: Option<String>,
    pub cli: Option<String>,
}

/// Planner output: task specs plus the parallel-execution batching
/// (spec §3 `ComprehensiveTaskManifest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveTaskManifest {
    pub tasks: Vec<ManifestTask>,
    pub execution_levels: Vec<Vec<TaskId>>,
}

/// Moderator evaluation result (spec §3 `ModeratorEvaluationResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorEvaluationResult {
    pub score: f64,
    pub score_found: bool,
    pub agreements: Vec<String>,
    pub divergences: Vec<String>,
    pub missing_perspectives: Vec<String>,
    pub recommendations: Vec<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_id_requires_prefix() {
        assert!(WorkflowId::parse("wf-abc").is_ok());
        assert!(WorkflowId::parse("abc").is_err());
    }

    #[test]
    fn insert_task_keeps_order_and_uniqueness() {
        let mut state = WorkflowState::new("do the thing", None);
        state.insert_task(TaskState::new("t1", "first", "claude"));
        state.insert_task(TaskState::new("t2", "second", "gemini"));
        // Re-inserting an existing id must not duplicate task_order.
        state.insert_task(TaskState::new("t1", "first-updated", "claude"));

        assert_eq!(state.run.task_order, vec!["t1".to_string(), "t2".to_string()]);
        assert!(state.invariants_hold());
        assert_eq!(state.run.tasks["t1"].name, "first-updated");
    }

    #[test]
    fn record_output_spills_large_payloads() {
        let mut task = TaskState::new("t1", "first", "claude");
        let small = "ok";
        assert_eq!(
            task.record_output(small, PathBuf::from("/tmp/out.md")),
            OutputPlacement::Inline
        );
        assert_eq!(task.output.as_deref(), Some("ok"));

        let big = "x".repeat(MAX_INLINE_OUTPUT_SIZE + 1);
        let placement = task.record_output(&big, PathBuf::from("/tmp/out.md"));
        assert_eq!(placement, OutputPlacement::Spill(PathBuf::from("/tmp/out.md")));
        assert!(task.output.is_none());
        assert_eq!(task.output_file, Some(PathBuf::from("/tmp/out.md")));
    }

    #[test]
    fn phase_order_is_fixed() {
        assert_eq!(Phase::Refine.next(), Some(Phase::Analyze));
        assert_eq!(Phase::Analyze.next(), Some(Phase::Plan));
        assert_eq!(Phase::Plan.next(), Some(Phase::Execute));
        assert_eq!(Phase::Execute.next(), None);
    }
}
