//! Executor (spec §4.5) — runs ready tasks in dependency-respecting
//! parallel batches, each with a per-task agent fallback chain and output
//! validation (§4.5.1).
//!
//! Mirrors the Planner's shape: one struct holding the collaborators, one
//! `run` entry point, private helpers for the per-task work. The fallback
//! chain and output-validation decision tree are the two pieces of this
//! module that encode the most spec detail, so they're kept as separate
//! private functions rather than inlined into `run_task`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::agent::{AgentRegistry, ExecuteRequest, Format};
use crate::config::WorkflowConfig;
use crate::control::Control;
use crate::dag::TaskDag;
use crate::error::{PhaseError, PhaseResult};
use crate::finalizer::Finalizer;
use crate::git::{GitChangesInfo, GitClient};
use crate::prompts::{PromptParams, PromptRenderer, PromptVariant};
use crate::rate_limit::RateLimiterRegistry;
use crate::report::{ReportPaths, ReportWriter};
use crate::retry::{retry, RetryNotify, RetryPolicy};
use crate::state::{
    Checkpoint, OutputPlacement, Phase, TaskId, TaskState, TaskStatus, WorkflowState,
    MAX_INLINE_OUTPUT_SIZE,
};
use crate::worktree::WorktreeManager;

// Named the same as the decision tree they parallel (spec §4.5.1); kept
// even though the current tree only branches on the suspiciously-low
// threshold, since they document the token expectations per task kind.
#[allow(dead_code)]
const MIN_EXPECTED_TOKENS_FOR_CODE_GEN: u64 = 200;
#[allow(dead_code)]
const MIN_EXPECTED_TOKENS_FOR_IMPLEMENTATION: u64 = 300;
const SUSPICIOUSLY_LOW_TOKEN_THRESHOLD: u64 = 150;

const IMPLEMENTATION_KEYWORDS: &[&str] = &["implement", "create", "add", "build", "write", "develop"];
const ANALYSIS_KEYWORDS: &[&str] = &["analyze", "review", "check", "verify", "audit", "inspect", "read"];

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("a task finished without producing a validated output or an error")]
    NoOutcome,
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Outcome of output validation (spec §4.5.1): `valid` with an optional
/// warning (e.g. "tokens possibly underreported"), or invalid with a reason.
struct ValidationOutcome {
    valid: bool,
    warning: Option<String>,
}

/// Feeds each failed attempt back into `TaskState.retries` (spec §5
/// "retry-count is recorded in TaskState").
struct CountingNotify<'a> {
    retries: &'a mut u32,
}

impl<E> RetryNotify<E> for CountingNotify<'_> {
    fn after_failure(&mut self, _attempt: u32, _err: &E) {
        *self.retries += 1;
    }
}

/// Runs the Execute phase: orphan worktree cleanup, then ready-batch
/// scheduling until every task is terminal.
pub struct Executor<W: ReportWriter + ReportPaths> {
    agents: Arc<AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    writer: Arc<W>,
    git: Arc<dyn GitClient>,
    worktrees: Arc<WorktreeManager>,
    finalizer: Arc<Finalizer>,
    limiters: RateLimiterRegistry,
    retry_policy: RetryPolicy,
    config: WorkflowConfig,
}

impl<W: ReportWriter + ReportPaths + 'static> Executor<W> {
    pub fn new(
        agents: Arc<AgentRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        writer: Arc<W>,
        git: Arc<dyn GitClient>,
        worktrees: Arc<WorktreeManager>,
        finalizer: Arc<Finalizer>,
        limiters: RateLimiterRegistry,
        retry_policy: RetryPolicy,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            agents,
            renderer,
            writer,
            git,
            worktrees,
            finalizer,
            limiters,
            retry_policy,
            config,
        }
    }

    pub async fn run(&self, control: &Control, state: &mut WorkflowState) -> PhaseResult<()> {
        if state.phase_complete(Phase::Execute) {
            return Ok(());
        }
        control.check_cancelled().map_err(|_| PhaseError::Cancelled)?;

        if state.run.tasks.is_empty() {
            return Err(PhaseError::validation("MISSING_TASKS", "plan phase produced no tasks to execute"));
        }

        // Preliminary action: reap worktrees left behind by a previous,
        // interrupted run (spec §4.5 step "preliminary actions").
        if let Err(e) = self.worktrees.cleanup_orphans(&state.run.tasks).await {
            warn!(error = %e, "orphan worktree cleanup failed, continuing");
        }

        let dag = crate::planner::rebuild_dag_from_state(state)
            .map_err(|e| PhaseError::state("CYCLIC_PLAN", e.to_string()))?;

        state.append_checkpoint(Checkpoint::new(Phase::Execute, "phase_start", serde_json::json!({})));

        loop {
            control.wait_if_paused().await.map_err(|_| PhaseError::Cancelled)?;

            let completed: HashSet<TaskId> = state
                .run
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.id.clone())
                .collect();

            let ready = dag
                .ready_tasks(&state.run.tasks, &completed)
                .map_err(|e| PhaseError::state("EXECUTION_STUCK", e.to_string()))?;
            if ready.is_empty() {
                break;
            }

            let use_worktree = self.decide_worktree_policy(state, ready.len());

            let all_tasks = Arc::new(state.run.tasks.clone());

            let mut handles = Vec::new();
            for task_id in &ready {
                let task = state.run.tasks.get(task_id).expect("ready task present in state").clone();
                let this = self.clone_shared();
                let control = control.clone();
                let workflow_branch = state.run.workflow_branch.clone();
                let workflow_id = state.id().clone();
                let all_tasks = all_tasks.clone();
                handles.push(tokio::spawn(async move {
                    let outcome = tokio::time::timeout(
                        this.config.phase_timeouts.execute,
                        this.run_task(&control, task.clone(), use_worktree, &workflow_id, workflow_branch.as_deref(), &all_tasks),
                    )
                    .await;
                    match outcome {
                        Ok(result) => (task.id, result),
                        Err(_) => (
                            task.id.clone(),
                            Err(PhaseError::Execution(format!("task {} timed out", task.id))),
                        ),
                    }
                }));
            }

            let first_error: Arc<Mutex<Option<PhaseError>>> = Arc::new(Mutex::new(None));
            for handle in handles {
                let (task_id, result) = handle.await.map_err(|e| PhaseError::Execution(format!("task join failed: {e}")))?;
                match result {
                    Ok((outcome, checkpoints)) => {
                        for checkpoint in checkpoints {
                            state.append_checkpoint(checkpoint);
                        }
                        if outcome.status == TaskStatus::Failed {
                            let mut slot = first_error.lock().expect("mutex poisoned");
                            if slot.is_none() {
                                *slot = Some(PhaseError::Execution(
                                    outcome.error.clone().unwrap_or_else(|| format!("task {task_id} failed")),
                                ));
                            }
                        } else {
                            state.run.metrics.total_tokens_in += outcome.tokens_in;
                            state.run.metrics.total_tokens_out += outcome.tokens_out;
                            state.run.metrics.total_cost_usd += outcome.cost_usd;
                        }
                        if let Some(existing) = state.run.tasks.get_mut(&task_id) {
                            *existing = outcome;
                        }
                    }
                    Err(e) => {
                        if let Some(existing) = state.run.tasks.get_mut(&task_id) {
                            existing.status = TaskStatus::Failed;
                            existing.error = Some(e.to_string());
                        }
                        state.append_checkpoint(Checkpoint::new(
                            Phase::Execute,
                            "task_complete",
                            serde_json::json!({"task_id": task_id, "status": "failed", "error": e.to_string()}),
                        ));
                        let mut slot = first_error.lock().expect("mutex poisoned");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            }

            if let Some(err) = first_error.lock().expect("mutex poisoned").take() {
                return Err(err);
            }
        }

        state.append_checkpoint(Checkpoint::new(Phase::Execute, "phase_complete", serde_json::json!({})));
        Ok(())
    }

    /// Cheap clone bundle so a spawned task can own its own handles without
    /// borrowing `&self` across an `.await` boundary inside `tokio::spawn`.
    fn clone_shared(&self) -> ExecutorHandles<W> {
        ExecutorHandles {
            agents: self.agents.clone(),
            renderer: self.renderer.clone(),
            writer: self.writer.clone(),
            git: self.git.clone(),
            worktrees: self.worktrees.clone(),
            finalizer: self.finalizer.clone(),
            limiters: self.limiters.clone(),
            retry_policy: self.retry_policy.clone(),
            config: self.config.clone(),
        }
    }

    /// Spec §4.5 step 3: worktree policy from `WorktreeMode`, overridden to
    /// always-on when workflow-scoped git isolation is configured and a
    /// workflow branch has already been created.
    fn decide_worktree_policy(&self, state: &WorkflowState, ready_count: usize) -> bool {
        if self.config.git_isolation.enabled && state.run.workflow_branch.is_some() {
            return true;
        }
        self.config.worktree_mode.use_worktree(ready_count)
    }
}

/// Everything a spawned per-task future needs, cloned out of the `Executor`
/// so each task attempt is independent of its siblings (spec §5: "sibling
/// failure does not cancel peers").
struct ExecutorHandles<W: ReportWriter + ReportPaths> {
    agents: Arc<AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    writer: Arc<W>,
    git: Arc<dyn GitClient>,
    worktrees: Arc<WorktreeManager>,
    finalizer: Arc<Finalizer>,
    limiters: RateLimiterRegistry,
    retry_policy: RetryPolicy,
    config: WorkflowConfig,
}

impl<W: ReportWriter + ReportPaths + 'static> ExecutorHandles<W> {
    async fn run_task(
        &self,
        control: &Control,
        mut task: TaskState,
        use_worktree: bool,
        workflow_id: &crate::state::WorkflowId,
        workflow_branch: Option<&str>,
        all_tasks: &HashMap<TaskId, TaskState>,
    ) -> PhaseResult<(TaskState, Vec<Checkpoint>)> {
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        info!(task_id = %task.id, "task started");

        let mut checkpoints = vec![Checkpoint::new(
            Phase::Execute,
            "task_start",
            serde_json::json!({"task_id": task.id, "name": task.name, "cli": task.cli}),
        )];

        if self.config.dry_run {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(chrono::Utc::now());
            checkpoints.push(Checkpoint::new(
                Phase::Execute,
                "task_complete",
                serde_json::json!({"task_id": task.id, "status": "completed", "dry_run": true}),
            ));
            return Ok((task, checkpoints));
        }

        let work_dir = if use_worktree {
            let handle = match workflow_branch {
                Some(branch) => self.worktrees.create_task_worktree(workflow_id, &task, branch).await,
                None => {
                    let base = self
                        .worktrees
                        .dependency_base_branch(&task.dependencies, all_tasks)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "HEAD".to_string());
                    self.worktrees.create_from_branch(&task, &base).await
                }
            };
            match handle {
                Ok(h) => {
                    task.worktree_path = Some(h.path.clone());
                    task.branch = Some(h.branch.clone());
                    h.path
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "worktree setup failed, running in repo root");
                    self.git.repo_root()
                }
            }
        } else {
            self.git.repo_root()
        };

        let params = PromptParams::new()
            .with_string("prompt", task.name.clone())
            .with_string("work_dir", work_dir.display().to_string());
        let render_result = self
            .renderer
            .render(PromptVariant::TaskExecute, &params)
            .map_err(|e| PhaseError::Execution(e.to_string()));

        let outcome: PhaseResult<()> = match render_result {
            Err(e) => Err(e),
            Ok(rendered) => {
                let mut attempt_retries = 0u32;
                let fallback = self
                    .run_with_fallback(control, &task, &rendered, &work_dir, &mut attempt_retries, &mut checkpoints)
                    .await;
                task.retries += attempt_retries;
                match fallback {
                    Ok((result, validation)) => {
                        self.record_success(&mut task, result, validation, use_worktree, workflow_branch, &work_dir).await
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(()) => {
                // Spec §4.5 step 10: workflow-scoped worktrees keep their
                // branch around after the worktree directory is removed,
                // since the merge in `record_success` already folded it
                // into the workflow branch but the branch ref itself stays
                // for audit/rollback. Legacy worktrees obey
                // `worktree_auto_clean`.
                if use_worktree {
                    match workflow_branch {
                        Some(_) => {
                            let _ = self.worktrees.remove_task_worktree(&task.id, false).await;
                        }
                        None => {
                            let _ = self.worktrees.remove(&task.id, self.config.worktree_auto_clean).await;
                        }
                    }
                }
                checkpoints.push(Checkpoint::new(
                    Phase::Execute,
                    "task_complete",
                    serde_json::json!({"task_id": task.id, "status": "completed"}),
                ));
                Ok((task, checkpoints))
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.error = Some(e.to_string());
                if use_worktree {
                    match workflow_branch {
                        Some(_) => {
                            let _ = self.worktrees.remove_task_worktree(&task.id, true).await;
                        }
                        None => {
                            let _ = self.worktrees.remove(&task.id, self.config.worktree_auto_clean).await;
                        }
                    }
                }
                checkpoints.push(Checkpoint::new(
                    Phase::Execute,
                    "task_complete",
                    serde_json::json!({"task_id": task.id, "status": "failed", "error": task.error}),
                ));
                Ok((task, checkpoints))
            }
        }
    }

    /// Spec §4.5 step 8: try `task.cli` first, then every other agent
    /// enabled for `Execute`, in registry order. Validation failure (§4.5.1)
    /// advances the chain the same way an execution failure does.
    async fn run_with_fallback(
        &self,
        control: &Control,
        task: &TaskState,
        prompt: &str,
        work_dir: &std::path::Path,
        retries: &mut u32,
        checkpoints: &mut Vec<Checkpoint>,
    ) -> PhaseResult<(crate::agent::ExecuteResult, ValidationOutcome)> {
        let primary = self.agents.resolve_agent_name(&task.cli, Phase::Execute);
        let chain = fallback_chain(&primary, self.agents.enabled_for(Phase::Execute), &self.agents);

        let mut last_error: Option<PhaseError> = None;
        for (idx, agent_name) in chain.iter().enumerate() {
            let is_fallback = idx > 0;
            let agent = match self.agents.get(agent_name) {
                Some(a) => a,
                None => continue,
            };
            let limiter = match self.limiters.get(agent_name) {
                Ok(l) => l,
                Err(e) => {
                    last_error = Some(PhaseError::Execution(e.to_string()));
                    continue;
                }
            };
            let model = self.config.resolve_phase_model(agent_name, Phase::Execute, task.model.as_deref());
            let request = ExecuteRequest {
                prompt: prompt.to_string(),
                format: Format::Text,
                model,
                timeout: self.config.phase_timeouts.execute,
                sandbox: self.config.sandbox,
                denied_tools: self.config.deny_tools.clone(),
                work_dir: work_dir.to_path_buf(),
                phase: Phase::Execute,
            };

            let permit = limiter.acquire(agent_name).await;
            let permit = match permit {
                Ok(p) => p,
                Err(e) => {
                    last_error = Some(PhaseError::Execution(e.to_string()));
                    continue;
                }
            };

            let agent_for_retry = agent.clone();
            let attempt = retry(
                control,
                &self.retry_policy,
                CountingNotify { retries: &mut *retries },
                move |_n| {
                    let agent = agent_for_retry.clone();
                    let req = request.clone();
                    async move { agent.execute(req).await }
                },
            )
            .await;
            drop(permit);

            let result = match attempt {
                Ok(r) => r,
                Err(e) => {
                    warn!(agent = %agent_name, is_fallback, error = %e, "agent invocation failed, trying next fallback");
                    checkpoints.push(Checkpoint::new(
                        Phase::Execute,
                        "error",
                        serde_json::json!({"agent": agent_name, "is_fallback": is_fallback, "error": e.to_string()}),
                    ));
                    last_error = Some(PhaseError::Execution(format!("agent {agent_name} exhausted retries: {e}")));
                    continue;
                }
            };

            let changes = self
                .git
                .status(work_dir)
                .await
                .unwrap_or_default();
            let validation = validate_output(&task.name, &changes, &result);
            if !validation.valid {
                let reason = validation.warning.clone().unwrap_or_else(|| "unvalidated".to_string());
                warn!(agent = %agent_name, is_fallback, "output validation rejected attempt, trying next fallback");
                checkpoints.push(Checkpoint::new(
                    Phase::Execute,
                    "error",
                    serde_json::json!({"agent": agent_name, "is_fallback": is_fallback, "error": reason}),
                ));
                last_error = Some(PhaseError::Execution(format!("agent {agent_name} produced no valid output ({reason})")));
                continue;
            }

            return Ok((result, validation));
        }

        Err(last_error.unwrap_or(PhaseError::Execution(format!("no agent enabled for execute on task {}", task.id))))
    }

    async fn record_success(
        &self,
        task: &mut TaskState,
        result: crate::agent::ExecuteResult,
        validation: ValidationOutcome,
        use_worktree: bool,
        workflow_branch: Option<&str>,
        work_dir: &std::path::Path,
    ) -> PhaseResult<()> {
        if let Some(warning) = validation.warning {
            warn!(task_id = %task.id, warning, "output validation warning");
        }

        task.tokens_in += result.tokens_in;
        task.tokens_out += result.tokens_out;
        task.cost_usd += result.cost_usd;
        task.tool_calls = result.tool_calls.clone();

        let output_path = self.writer.task_output_path(&task.id);
        let placement = task.record_output(&result.output, output_path.clone());
        if let OutputPlacement::Spill(path) = placement {
            self.writer
                .write(&path, &result.output)
                .await
                .map_err(|e| PhaseError::Execution(e.to_string()))?;
        }

        self.finalizer
            .finalize(task, work_dir)
            .await
            .map_err(|e| PhaseError::Finalization(e.to_string()))?;

        if use_worktree {
            if let (Some(branch), Some(workflow_branch)) = (task.branch.clone(), workflow_branch) {
                let workflow_path = self.git.repo_root();
                if let Err(e) = self
                    .worktrees
                    .merge_task_to_workflow(&workflow_path, &branch, self.config.git_isolation.merge_strategy.into())
                    .await
                {
                    return Err(PhaseError::Finalization(format!("merge of task branch {branch} into {workflow_branch} failed: {e}")));
                }
            }
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(chrono::Utc::now());
        Ok(())
    }
}

/// Spec §4.5 step 8 / §4.11: `primary` first, then every other candidate
/// enabled for the phase, ties broken by descending `max_context_tokens`
/// since registration order carries no ranking meaning of its own.
fn fallback_chain(primary: &str, enabled: &[String], agents: &AgentRegistry) -> Vec<String> {
    let mut rest: Vec<&String> = enabled.iter().filter(|candidate| candidate.as_str() != primary).collect();
    rest.sort_by_key(|name| std::cmp::Reverse(agents.get(name).map(|a| a.capabilities().max_context_tokens).unwrap_or(0)));
    let mut chain = vec![primary.to_string()];
    chain.extend(rest.into_iter().cloned());
    chain
}

/// Spec §4.5.1: git changes are the authoritative signal; tool-call
/// presence is legacy and no longer inspected. Falls back to task-name
/// keyword categorization with per-category token thresholds when the
/// working tree shows no changes at all.
fn validate_output(task_name: &str, changes: &GitChangesInfo, result: &crate::agent::ExecuteResult) -> ValidationOutcome {
    if changes.has_changes() {
        if result.tokens_out < SUSPICIOUSLY_LOW_TOKEN_THRESHOLD {
            return ValidationOutcome {
                valid: true,
                warning: Some("tokens possibly underreported".to_string()),
            };
        }
        return ValidationOutcome { valid: true, warning: None };
    }

    let lower = task_name.to_lowercase();
    if IMPLEMENTATION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ValidationOutcome {
            valid: false,
            warning: Some("no files were modified".to_string()),
        };
    }
    if ANALYSIS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ValidationOutcome {
            valid: result.tokens_out >= SUSPICIOUSLY_LOW_TOKEN_THRESHOLD,
            warning: None,
        };
    }
    if result.tokens_out < SUSPICIOUSLY_LOW_TOKEN_THRESHOLD {
        ValidationOutcome { valid: false, warning: None }
    } else {
        ValidationOutcome {
            valid: true,
            warning: Some("task produced no git changes".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentResult, Capabilities, ExecuteRequest, FinishReason};
    use async_trait::async_trait;

    fn result(tokens_out: u64) -> crate::agent::ExecuteResult {
        crate::agent::ExecuteResult {
            output: "done".to_string(),
            model: None,
            tokens_in: 10,
            tokens_out,
            cost_usd: 0.0,
            finish_reason: FinishReason::Stop,
            tool_calls: vec![],
        }
    }

    #[test]
    fn git_changes_are_authoritative() {
        let changes = GitChangesInfo {
            staged: vec!["a.rs".into()],
            unstaged: vec![],
            untracked: vec![],
        };
        let outcome = validate_output("implement the thing", &changes, &result(10));
        assert!(outcome.valid);
        assert!(outcome.warning.is_some());
    }

    #[test]
    fn implementation_task_without_changes_is_invalid() {
        let outcome = validate_output("implement new endpoint", &GitChangesInfo::default(), &result(500));
        assert!(!outcome.valid);
        assert_eq!(outcome.warning.as_deref(), Some("no files were modified"));
    }

    #[test]
    fn analysis_task_without_changes_valid_above_threshold() {
        let outcome = validate_output("analyze the module", &GitChangesInfo::default(), &result(200));
        assert!(outcome.valid);
        let low = validate_output("analyze the module", &GitChangesInfo::default(), &result(50));
        assert!(!low.valid);
    }

    struct CapAgent {
        name: String,
        max_context_tokens: u64,
    }
    #[async_trait]
    impl Agent for CapAgent {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_tools: false,
                supports_images: false,
                max_context_tokens: self.max_context_tokens,
            }
        }
        async fn execute(&self, _request: ExecuteRequest) -> AgentResult<crate::agent::ExecuteResult> {
            Ok(result(1))
        }
    }

    #[test]
    fn fallback_chain_breaks_ties_by_max_context_tokens() {
        let mut registry = AgentRegistry::new("claude");
        registry.register(
            Arc::new(CapAgent { name: "claude".into(), max_context_tokens: 100_000 }),
            &[Phase::Execute],
        );
        registry.register(
            Arc::new(CapAgent { name: "small".into(), max_context_tokens: 8_000 }),
            &[Phase::Execute],
        );
        registry.register(
            Arc::new(CapAgent { name: "huge".into(), max_context_tokens: 1_000_000 }),
            &[Phase::Execute],
        );

        let chain = fallback_chain("claude", registry.enabled_for(Phase::Execute), &registry);

        assert_eq!(chain, vec!["claude".to_string(), "huge".to_string(), "small".to_string()]);
    }

    #[test]
    fn unknown_task_without_changes_uses_token_threshold() {
        let outcome = validate_output("investigate weirdness", &GitChangesInfo::default(), &result(200));
        assert!(outcome.valid);
        assert!(outcome.warning.is_some());
        let low = validate_output("investigate weirdness", &GitChangesInfo::default(), &result(10));
        assert!(!low.valid);
    }
}
