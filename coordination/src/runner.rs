//! Runner (spec §4.10) — sequences Refine → Analyze → Plan → Execute,
//! acquiring the per-workflow lock, handling resume, the optional
//! interactive gate, and terminal status/error bookkeeping.
//!
//! The Refine phase itself has no dedicated component in this design (spec
//! §1 scopes prompt template rendering out entirely, and §2's component
//! table lists no "Refiner"); the Runner executes it inline as a trivial
//! idempotent checkpoint pair so the fixed four-phase sequence still holds
//! even though all of the interesting phase logic lives in `Analyzer`,
//! `Planner` and `Executor`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::config::WorkflowConfig;
use crate::control::Control;
use crate::error::PhaseError;
use crate::planner::rebuild_dag_from_state;
use crate::report::{ReportPaths, ReportWriter};
use crate::state::store::{StateStore, StoreError, StoreResult};
use crate::state::{
    Blueprint, Checkpoint, ExecutionMode, Phase, SharedStateStore, WorkflowId, WorkflowState,
    WorkflowStatus,
};

use crate::analyzer::Analyzer;
use crate::executor::Executor;
use crate::planner::Planner;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("validation error [{code}]: {message}")]
    Validation { code: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// An interactive review gate rejected resuming the phase (spec §4.10
    /// step 5: the reloaded state still shows `Pending` on an earlier
    /// phase, meaning the operator hasn't actually approved yet).
    #[error("phase rejected: workflow is still awaiting review")]
    PhaseRejected,
}

pub type RunnerResult<T> = Result<T, RunnerError>;

impl RunnerError {
    fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Pause-gate hook consulted before each phase when the workflow's
/// blueprint requests `ExecutionMode::Interactive` (spec §4.10 step 5).
/// Waits out-of-band for an operator to resume the workflow, then the
/// Runner reloads state from the store and checks it's actually safe to
/// proceed.
#[async_trait]
pub trait InteractiveGate: Send + Sync {
    async fn wait_for_resume(&self, workflow_id: &WorkflowId) -> RunnerResult<()>;
}

/// No-op gate used when a workflow's execution mode doesn't require one.
pub struct NoopGate;

#[async_trait]
impl InteractiveGate for NoopGate {
    async fn wait_for_resume(&self, _workflow_id: &WorkflowId) -> RunnerResult<()> {
        Ok(())
    }
}

/// Phase sequencer (spec §4.10). Generic over the report-writer
/// implementation, same as `Analyzer`/`Planner`/`Executor`, since it needs
/// to read the consolidated-analysis file directly for artifact
/// reconciliation (step 4).
pub struct Runner<W: ReportWriter + ReportPaths> {
    store: SharedStateStore,
    agents: Arc<AgentRegistry>,
    writer: Arc<W>,
    analyzer: Arc<Analyzer<W>>,
    planner: Arc<Planner<W>>,
    executor: Arc<Executor<W>>,
    config: WorkflowConfig,
    control: Control,
    interactive_gate: Arc<dyn InteractiveGate>,
}

impl<W: ReportWriter + ReportPaths + 'static> Runner<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStateStore,
        agents: Arc<AgentRegistry>,
        writer: Arc<W>,
        analyzer: Arc<Analyzer<W>>,
        planner: Arc<Planner<W>>,
        executor: Arc<Executor<W>>,
        config: WorkflowConfig,
        control: Control,
    ) -> Self {
        Self {
            store,
            agents,
            writer,
            analyzer,
            planner,
            executor,
            config,
            control,
            interactive_gate: Arc::new(NoopGate),
        }
    }

    pub fn with_interactive_gate(mut self, gate: Arc<dyn InteractiveGate>) -> Self {
        self.interactive_gate = gate;
        self
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Start a brand-new workflow run (spec §4.10 steps 1-2).
    pub async fn run(&self, prompt: impl Into<String>, blueprint: Option<Blueprint>) -> RunnerResult<WorkflowState> {
        let prompt = prompt.into();
        self.validate_inputs(&prompt)?;

        let state = WorkflowState::new(prompt, blueprint);
        self.store.acquire_lock(state.id()).map_err(RunnerError::Store)?;
        self.store.save(&state)?;

        self.drive(state).await
    }

    /// Resume an existing workflow by id (spec §4.10 step 3).
    pub async fn resume(&self, id: &WorkflowId) -> RunnerResult<WorkflowState> {
        self.store.acquire_lock(id).map_err(RunnerError::Store)?;
        let state = match self.store.load(id) {
            Ok(s) => s,
            Err(e) => {
                let _ = self.store.release_lock(id);
                return Err(RunnerError::Store(e));
            }
        };
        self.drive(state).await
    }

    fn validate_inputs(&self, prompt: &str) -> RunnerResult<()> {
        self.config
            .validate_prompt(prompt)
            .map_err(|e| RunnerError::validation("INVALID_PROMPT", e.to_string()))?;
        if let Some((code, message)) = validate_agents_and_config(&self.agents, &self.config).into_iter().next() {
            return Err(RunnerError::validation(code, message));
        }
        Ok(())
    }

    /// Run every phase from `state`'s resume point through Execute,
    /// persisting after each phase and releasing the workflow lock on every
    /// exit path (spec §4.10 steps 3-7).
    async fn drive(&self, mut state: WorkflowState) -> RunnerResult<WorkflowState> {
        let id = state.id().clone();

        let outcome = self.drive_inner(&mut state).await;

        match outcome {
            Ok(()) => {
                state.run.metrics.duration = Some(
                    (chrono::Utc::now() - state.definition.created_at)
                        .to_std()
                        .unwrap_or_default(),
                );
                state.run.status = WorkflowStatus::Completed;
                self.save_and_unlock(&id, &state)?;
                Ok(state)
            }
            Err(e) => {
                self.handle_error(&mut state, &e);
                // Best-effort persistence of the terminal failure state;
                // the lock is released regardless so a human can inspect
                // or force-resume.
                let _ = self.store.save(&state);
                let _ = self.store.release_lock(&id);
                Err(e)
            }
        }
    }

    async fn drive_inner(&self, state: &mut WorkflowState) -> RunnerResult<()> {
        self.reconcile_analysis_artifacts(state).await;

        let resume_point = Phase::ORDER
            .iter()
            .copied()
            .find(|p| !state.phase_complete(*p))
            .unwrap_or(Phase::Execute);

        state.run.status = WorkflowStatus::Running;
        state.run.current_phase = resume_point;
        self.store.save(state)?;

        // Resuming directly into Execute skips the Planner entirely, so the
        // persisted task set has to be validated as a DAG up front rather
        // than relying on a fresh `materialize` call. The Executor rebuilds
        // the same DAG on every call regardless, so this is purely an early
        // sanity check before the rest of the pipeline runs.
        if resume_point == Phase::Execute {
            rebuild_dag_from_state(state).map_err(|e| {
                RunnerError::Phase(PhaseError::state("CYCLIC_PLAN", e.to_string()))
            })?;
        }

        let remaining: Vec<Phase> = Phase::ORDER
            .iter()
            .copied()
            .skip_while(|p| *p != resume_point)
            .collect();

        let interactive = matches!(
            state.definition.blueprint,
            Some(Blueprint {
                execution_mode: ExecutionMode::Interactive,
                ..
            })
        );

        for phase in remaining {
            self.control.check_cancelled().map_err(|_| RunnerError::Phase(PhaseError::Cancelled))?;

            if interactive {
                state.run.status = WorkflowStatus::AwaitingReview;
                state.run.interactive_review = Some(crate::state::InteractiveReview {
                    requested_at: chrono::Utc::now(),
                    resumed_at: None,
                    note: None,
                });
                self.store.save(state)?;

                self.interactive_gate.wait_for_resume(state.id()).await?;

                let reloaded = self.store.load(state.id())?;
                if matches!(reloaded.run.status, WorkflowStatus::Pending) {
                    return Err(RunnerError::PhaseRejected);
                }
                *state = reloaded;
                if let Some(review) = state.run.interactive_review.as_mut() {
                    review.resumed_at = Some(chrono::Utc::now());
                }
                state.run.status = WorkflowStatus::Running;
            }

            state.run.current_phase = phase;
            self.store.save(state)?;

            info!(phase = %phase, workflow = %state.id(), "running phase");
            match phase {
                Phase::Refine => self.run_refine(state).await?,
                Phase::Analyze => self.analyzer.run(&self.control, state).await.map_err(RunnerError::Phase)?,
                Phase::Plan => self.planner.run(&self.control, state).await.map_err(RunnerError::Phase)?,
                Phase::Execute => self.executor.run(&self.control, state).await.map_err(RunnerError::Phase)?,
            }

            self.store.save(state)?;
            let _ = self.store.update_heartbeat(state.id());
        }

        Ok(())
    }

    /// Trivial, idempotent Refine phase: out of scope beyond its
    /// checkpoints (spec §1), since prompt refinement is a pure-function
    /// external collaborator the core doesn't own.
    async fn run_refine(&self, state: &mut WorkflowState) -> RunnerResult<()> {
        if state.phase_complete(Phase::Refine) {
            return Ok(());
        }
        state.append_checkpoint(Checkpoint::new(Phase::Refine, "phase_start", serde_json::json!({})));
        state.append_checkpoint(Checkpoint::new(Phase::Refine, "phase_complete", serde_json::json!({})));
        Ok(())
    }

    /// Spec §4.10 step 4: if no `consolidated_analysis` checkpoint exists
    /// but the consolidated file is already on disk (left behind by a
    /// crashed run after the file write but before the checkpoint append),
    /// synthesize the checkpoint from the file. If there's only one agent
    /// configured for Analyze, also check its V1 file and promote it to
    /// "consolidated" the same way a single-agent fallback would.
    async fn reconcile_analysis_artifacts(&self, state: &mut WorkflowState) {
        if state.last_checkpoint(Phase::Analyze, "consolidated_analysis").is_some() {
            return;
        }

        let consolidated_path = self.writer.consolidated_analysis_path();
        if let Ok(content) = self.writer.read(&consolidated_path).await {
            info!(workflow = %state.id(), "recovered consolidated analysis checkpoint from disk");
            state.append_checkpoint(Checkpoint::new(
                Phase::Analyze,
                "consolidated_analysis",
                serde_json::json!({
                    "content": content,
                    "agent_count": 1,
                    "synthesized": false,
                    "recovered_from_disk": true,
                }),
            ));
            return;
        }

        let analyze_agents = self.agents.enabled_for(Phase::Analyze);
        if analyze_agents.len() != 1 {
            return;
        }
        let agent_name = &analyze_agents[0];
        let model = self.config.agent_default_model.get(agent_name).cloned().unwrap_or_default();
        let v1_path = self.writer.v1_analysis_path(agent_name, &model);
        if let Ok(content) = self.writer.read(&v1_path).await {
            warn!(
                workflow = %state.id(),
                agent = agent_name,
                "promoting single-agent V1 analysis to consolidated on recovery"
            );
            state.append_checkpoint(Checkpoint::new(
                Phase::Analyze,
                "consolidated_analysis",
                serde_json::json!({
                    "content": content,
                    "agent_count": 1,
                    "synthesized": false,
                    "agent": agent_name,
                    "recovered_from_disk": true,
                }),
            ));
        }
    }

    /// Spec §7: on any escalated error, write an error checkpoint with
    /// context, set Status=Failed, persist.
    fn handle_error(&self, state: &mut WorkflowState, error: &RunnerError) {
        let structured = match error {
            RunnerError::Phase(e) => e.to_structured(),
            RunnerError::Validation { code, message } => {
                crate::error::StructuredError::new(code.clone(), message.clone(), "fix the input and re-run")
            }
            RunnerError::Store(e) => {
                crate::error::StructuredError::new("STORE_ERROR", e.to_string(), "inspect the state store and retry")
            }
            RunnerError::PhaseRejected => crate::error::StructuredError::new(
                "PHASE_REJECTED",
                "workflow is still awaiting review".to_string(),
                "have an operator resume the workflow",
            ),
        };

        state.append_checkpoint(Checkpoint::new(
            state.run.current_phase,
            "error",
            serde_json::to_value(&structured).unwrap_or(serde_json::json!({"message": error.to_string()})),
        ));
        state.run.status = WorkflowStatus::Failed;
        warn!(workflow = %state.id(), error = %error, "workflow failed");
    }

    fn save_and_unlock(&self, id: &WorkflowId, state: &WorkflowState) -> RunnerResult<()> {
        self.store.save(state)?;
        self.store.release_lock(id)?;
        Ok(())
    }
}

/// Heartbeat/zombie reaping (spec §5 "Heartbeat (summary)") is a
/// cross-cutting component out of this module's scope; this helper is the
/// one place the Runner couples to it, exposed so a CLI binary's
/// background task can drive the reaper against the same store the Runner
/// uses.
pub fn find_zombie_workflows(store: &dyn StateStore, threshold: std::time::Duration) -> StoreResult<Vec<WorkflowId>> {
    store.find_zombie_workflows(threshold)
}

/// Agent/config checks shared between `Runner::validate_inputs` (spec §4.10
/// step 1) and the doctor readiness check (§4.12), which runs the same
/// checks without a prompt to validate. Returns every `(code, message)`
/// pair found rather than stopping at the first, so the doctor can report
/// them all at once.
pub(crate) fn validate_agents_and_config(agents: &AgentRegistry, config: &WorkflowConfig) -> Vec<(&'static str, String)> {
    let mut errors = Vec::new();
    if config.phase_timeouts.refine.is_zero()
        || config.phase_timeouts.analyze.is_zero()
        || config.phase_timeouts.plan.is_zero()
        || config.phase_timeouts.execute.is_zero()
    {
        errors.push(("INVALID_TIMEOUT", "every phase timeout must be non-zero".to_string()));
    }
    if agents.is_empty() {
        errors.push(("NO_AGENTS", "at least one agent must be registered".to_string()));
    }
    if config.default_agent.trim().is_empty() {
        errors.push(("NO_DEFAULT_AGENT", "default_agent must be set".to_string()));
    }
    // Spec §4.11: an agent enabled for a phase that calls it with
    // `Format::Json` (Plan) must advertise `supports_json`, or every
    // manifest it returns would have to go through the envelope/
    // best-effort parse path instead of a real JSON request.
    for name in agents.enabled_for(Phase::Plan) {
        if let Some(agent) = agents.get(name) {
            if !agent.capabilities().supports_json {
                errors.push((
                    "AGENT_MISSING_JSON_SUPPORT",
                    format!("agent {name} is enabled for the plan phase but does not support JSON output"),
                ));
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentResult, Capabilities, ExecuteResult, FinishReason};
    use crate::config::SynthesizerConfig;
    use crate::finalizer::Finalizer;
    use crate::git::{GitChangesInfo, GitClient, GitError, MergeStrategy};
    use crate::moderator::Moderator;
    use crate::prompts::{PromptError, PromptParams, PromptRenderer, PromptVariant};
    use crate::rate_limit::RateLimiterRegistry;
    use crate::report::FsReportWriter;
    use crate::retry::RetryPolicy;
    use crate::state::InMemoryStateStore;
    use crate::watchdog::WatchdogConfig;
    use crate::worktree::WorktreeManager;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    struct Layout {
        run_dir: PathBuf,
    }
    impl ReportPaths for Layout {
        fn run_dir(&self) -> &Path {
            &self.run_dir
        }
    }
    #[async_trait]
    impl ReportWriter for Layout {
        async fn write(&self, path: &Path, content: &str) -> crate::report::ReportResult<()> {
            FsReportWriter.write(path, content).await
        }
        async fn read(&self, path: &Path) -> crate::report::ReportResult<String> {
            FsReportWriter.read(path).await
        }
        async fn exists(&self, path: &Path) -> bool {
            FsReportWriter.exists(path).await
        }
    }

    struct StubAgent {
        name: String,
        response: String,
    }
    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_tools: true,
                supports_images: false,
                max_context_tokens: 100_000,
            }
        }
        async fn execute(&self, request: crate::agent::ExecuteRequest) -> AgentResult<ExecuteResult> {
            let output = match request.phase {
                Phase::Plan => r#"{"tasks":[{"id":"t1","name":"do the task","file":"t1.md","dependencies":[],"complexity":null,"cli":"claude"}],"execution_levels":[["t1"]]}"#.to_string(),
                _ => self.response.clone(),
            };
            Ok(ExecuteResult {
                output,
                model: None,
                tokens_in: 10,
                tokens_out: 500,
                cost_usd: 0.0,
                finish_reason: FinishReason::Stop,
                tool_calls: vec![],
            })
        }
    }

    struct StubRenderer;
    impl PromptRenderer for StubRenderer {
        fn render(&self, _variant: PromptVariant, _params: &PromptParams) -> Result<String, PromptError> {
            Ok("rendered prompt".to_string())
        }
    }

    struct StubGit;
    #[async_trait]
    impl GitClient for StubGit {
        fn repo_root(&self) -> PathBuf {
            PathBuf::from("/repo")
        }
        async fn current_branch(&self, _path: &Path) -> Result<String, GitError> {
            Ok("main".into())
        }
        async fn status(&self, _path: &Path) -> Result<GitChangesInfo, GitError> {
            Ok(GitChangesInfo {
                staged: vec!["a.rs".into()],
                unstaged: vec![],
                untracked: vec![],
            })
        }
        async fn worktree_add(&self, _path: &Path, _branch: &str, _base: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn worktree_remove(&self, _path: &Path) -> Result<(), GitError> {
            Ok(())
        }
        async fn worktree_list(&self) -> Result<Vec<PathBuf>, GitError> {
            Ok(vec![])
        }
        async fn create_branch(&self, _name: &str, _base: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn delete_branch(&self, _name: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn merge_branch(&self, _path: &Path, _from: &str, _strategy: MergeStrategy) -> Result<(), GitError> {
            Ok(())
        }
        async fn stage_all(&self, _path: &Path) -> Result<(), GitError> {
            Ok(())
        }
        async fn commit(&self, _path: &Path, _message: &str) -> Result<String, GitError> {
            Ok("deadbeef".to_string())
        }
        async fn push(&self, _path: &Path, _remote: &str, _branch: &str) -> Result<(), GitError> {
            Ok(())
        }
    }

    fn make_runner(dir: &std::path::Path) -> Runner<Layout> {
        let mut config = WorkflowConfig::default();
        config.moderator.agent = Some("claude".to_string());
        config.moderator.threshold = 0.5;
        config.moderator.min_rounds = 1;
        config.moderator.max_rounds = 2;
        config.moderator.abort_threshold = 0.1;
        config.analyze_synthesizer = SynthesizerConfig {
            enabled: true,
            agent: Some("claude".to_string()),
        };
        config.default_agent = "claude".to_string();

        let mut registry = AgentRegistry::new("claude");
        let moderator_response = "## Agreements\n- agree\n\n## Divergences\n- none\n\n\
                                   **CONSENSUS_SCORE:** 95%\n\nThis moderator response is long \
                                   enough to clear the minimum length validation threshold easily.";
        registry.register(
            Arc::new(StubAgent {
                name: "claude".to_string(),
                response: "## Claims\n- claim one\n".to_string(),
            }),
            &[Phase::Analyze, Phase::Plan, Phase::Execute],
        );
        let agents = Arc::new(registry);

        let writer = Arc::new(Layout {
            run_dir: dir.to_path_buf(),
        });
        let limiters = RateLimiterRegistry::new(vec![("claude".to_string(), 4, None)]);
        let retry_policy = RetryPolicy {
            max_attempts: 1,
            backoff: crate::retry::Backoff::Fixed(std::time::Duration::from_millis(1)),
        };
        let renderer: Arc<dyn PromptRenderer> = Arc::new(StubRenderer);

        let moderator_agent: Arc<dyn Agent> = Arc::new(StubAgent {
            name: "claude".to_string(),
            response: moderator_response.to_string(),
        });
        let moderator = Moderator::new(
            moderator_agent,
            limiters.clone(),
            writer.clone(),
            retry_policy.clone(),
            WatchdogConfig {
                poll_interval: std::time::Duration::from_secs(60),
                stability_window: std::time::Duration::from_secs(60),
                min_file_size: u64::MAX,
            },
        );

        let analyzer = Arc::new(Analyzer::new(
            agents.clone(),
            renderer.clone(),
            writer.clone(),
            moderator,
            limiters.clone(),
            retry_policy.clone(),
            config.clone(),
        ));
        let planner = Arc::new(Planner::new(
            agents.clone(),
            renderer.clone(),
            writer.clone(),
            limiters.clone(),
            retry_policy.clone(),
            config.clone(),
        ));
        let git: Arc<dyn GitClient> = Arc::new(StubGit);
        let worktrees = Arc::new(WorktreeManager::new(git.clone(), dir.join("worktrees")));
        let finalizer = Arc::new(Finalizer::new(git.clone(), None, config.finalize.clone()));
        let executor = Arc::new(Executor::new(
            agents.clone(),
            renderer,
            writer.clone(),
            git,
            worktrees,
            finalizer,
            limiters,
            retry_policy,
            config.clone(),
        ));

        Runner::new(
            InMemoryStateStore::shared(),
            agents,
            writer,
            analyzer,
            planner,
            executor,
            config,
            Control::new(),
        )
    }

    #[tokio::test]
    async fn rejects_empty_prompt_before_acquiring_lock() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(dir.path());
        let result = runner.run("", None).await;
        assert!(matches!(result, Err(RunnerError::Validation { .. })));
    }

    #[tokio::test]
    async fn rejects_plan_agent_without_json_support() {
        struct NoJsonAgent;
        #[async_trait]
        impl Agent for NoJsonAgent {
            fn name(&self) -> &str {
                "textonly"
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities {
                    supports_json: false,
                    supports_streaming: false,
                    supports_tools: false,
                    supports_images: false,
                    max_context_tokens: 4_000,
                }
            }
            async fn execute(&self, _request: crate::agent::ExecuteRequest) -> AgentResult<ExecuteResult> {
                Ok(ExecuteResult {
                    output: "".to_string(),
                    model: None,
                    tokens_in: 0,
                    tokens_out: 0,
                    cost_usd: 0.0,
                    finish_reason: FinishReason::Stop,
                    tool_calls: vec![],
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(dir.path());
        let mut registry = AgentRegistry::new("claude");
        registry.register(Arc::new(NoJsonAgent), &[Phase::Plan]);
        let runner = Runner {
            agents: Arc::new(registry),
            ..runner
        };

        let result = runner.run("build a thing", None).await;
        assert!(matches!(
            result,
            Err(RunnerError::Validation { ref code, .. }) if code == "AGENT_MISSING_JSON_SUPPORT"
        ));
    }

    #[tokio::test]
    async fn full_pipeline_completes_with_single_agent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(dir.path());
        let state = runner.run("build a thing", None).await.expect("pipeline should complete");
        assert!(matches!(state.run.status, WorkflowStatus::Completed));
        assert!(state.phase_complete(Phase::Refine));
        assert!(state.phase_complete(Phase::Analyze));
        assert!(state.phase_complete(Phase::Plan));
        assert!(state.phase_complete(Phase::Execute));
    }

    #[tokio::test]
    async fn resuming_a_completed_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(dir.path());
        let state = runner.run("build a thing twice", None).await.unwrap();
        let id = state.id().clone();

        let resumed = runner.resume(&id).await.unwrap();
        assert!(matches!(resumed.run.status, WorkflowStatus::Completed));
    }
}
