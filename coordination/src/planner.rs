//! Planner (spec §4.3) — turns the consolidated analysis into a
//! [`ComprehensiveTaskManifest`] and the [`TaskDag`] the Executor walks.
//!
//! The comprehensive single-call path is primary; when the configured plan
//! agent fails or the response doesn't parse, the optional
//! `plan_synthesizer` multi-agent path (render `PlanGenerate` per agent,
//! then `SynthesizePlans`) is the fallback, matching the Analyzer's
//! fallback-to-concatenation posture for degraded but non-fatal failures.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::{AgentRegistry, ExecuteRequest, Format};
use crate::config::WorkflowConfig;
use crate::control::Control;
use crate::dag::{DagError, TaskDag};
use crate::error::{PhaseError, PhaseResult};
use crate::prompts::{PromptParams, PromptRenderer, PromptVariant};
use crate::rate_limit::RateLimiterRegistry;
use crate::report::{ReportPaths, ReportWriter};
use crate::retry::{retry, NoopNotify, RetryPolicy};
use crate::state::{
    Checkpoint, ComprehensiveTaskManifest, ManifestTask, Phase, TaskId, TaskState, WorkflowState,
};

pub struct Planner<W: ReportWriter + ReportPaths> {
    agents: Arc<AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    writer: Arc<W>,
    limiters: RateLimiterRegistry,
    retry_policy: RetryPolicy,
    config: WorkflowConfig,
}

impl<W: ReportWriter + ReportPaths + 'static> Planner<W> {
    pub fn new(
        agents: Arc<AgentRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        writer: Arc<W>,
        limiters: RateLimiterRegistry,
        retry_policy: RetryPolicy,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            agents,
            renderer,
            writer,
            limiters,
            retry_policy,
            config,
        }
    }

    pub async fn run(&self, control: &Control, state: &mut WorkflowState) -> PhaseResult<()> {
        if state.phase_complete(Phase::Plan) {
            return Ok(());
        }
        control.check_cancelled().map_err(|_| PhaseError::Cancelled)?;

        state.append_checkpoint(Checkpoint::new(Phase::Plan, "phase_start", serde_json::json!({})));

        let consolidated = self
            .writer
            .read(&self.writer.consolidated_analysis_path())
            .await
            .map_err(|e| {
                PhaseError::state(
                    "MISSING_ANALYSIS",
                    format!("cannot plan without the analyze phase's output: {e}"),
                )
            })?;

        let mut manifest = match self.plan_comprehensive(control, state, &consolidated).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "comprehensive planner failed, falling back to per-agent plan synthesis");
                self.plan_via_synthesis(control, state, &consolidated).await?
            }
        };

        self.reconcile_with_tasks_dir(&mut manifest).await;
        self.materialize(state, &manifest)?;

        self.writer
            .write(
                &self.writer.execution_graph_path(),
                &serde_json::to_string_pretty(&manifest).map_err(|e| PhaseError::Execution(e.to_string()))?,
            )
            .await
            .map_err(|e| PhaseError::Execution(e.to_string()))?;

        state.append_checkpoint(Checkpoint::new(
            Phase::Plan,
            "plan_complete",
            serde_json::json!({ "task_count": manifest.tasks.len(), "levels": manifest.execution_levels.len() }),
        ));
        state.append_checkpoint(Checkpoint::new(Phase::Plan, "phase_complete", serde_json::json!({})));
        Ok(())
    }

    async fn plan_comprehensive(
        &self,
        control: &Control,
        state: &WorkflowState,
        consolidated: &str,
    ) -> PhaseResult<ComprehensiveTaskManifest> {
        let agent_name = self.config.default_agent.clone();
        let agent = self
            .agents
            .get(&agent_name)
            .ok_or_else(|| PhaseError::validation("UNKNOWN_AGENT", format!("planning agent {agent_name:?} not registered")))?;
        let model = self.config.resolve_phase_model(&agent_name, Phase::Plan, None);

        let params = PromptParams::new()
            .with_string("prompt", state.definition.prompt.clone())
            .with_string("consolidated_analysis", consolidated.to_string())
            .with_output_file(self.writer.execution_graph_path());
        let rendered = self
            .renderer
            .render(PromptVariant::PlanComprehensive, &params)
            .map_err(|e| PhaseError::Execution(e.to_string()))?;

        let limiter = self.limiters.get(&agent_name).map_err(|e| PhaseError::Execution(e.to_string()))?;
        let request = ExecuteRequest {
            prompt: rendered,
            format: Format::Json,
            model,
            timeout: self.config.phase_timeouts.plan,
            sandbox: self.config.sandbox,
            denied_tools: self.config.deny_tools.clone(),
            work_dir: self.writer.run_dir().to_path_buf(),
            phase: Phase::Plan,
        };

        let _permit = limiter.acquire(&agent_name).await.map_err(|e| PhaseError::Execution(e.to_string()))?;
        let result = retry(control, &self.retry_policy, NoopNotify, move |_n| {
            let agent = agent.clone();
            let req = request.clone();
            async move { agent.execute(req).await }
        })
        .await
        .map_err(|e| PhaseError::Execution(format!("planning agent {agent_name} exhausted retries: {e}")))?;

        parse_manifest(&result.output)
    }

    /// Fallback: render `PlanGenerate` per agent, combine with `SynthesizePlans`
    /// if a synthesizer is configured, else take the first successful plan.
    async fn plan_via_synthesis(
        &self,
        control: &Control,
        state: &WorkflowState,
        consolidated: &str,
    ) -> PhaseResult<ComprehensiveTaskManifest> {
        let agent_names = self.agents.enabled_for(Phase::Plan).to_vec();
        if agent_names.is_empty() {
            return Err(PhaseError::Partial { got: 0, need: 1 });
        }

        let mut candidates: Vec<String> = Vec::new();
        for agent_name in &agent_names {
            let params = PromptParams::new()
                .with_string("prompt", state.definition.prompt.clone())
                .with_string("consolidated_analysis", consolidated.to_string());
            let rendered = match self.renderer.render(PromptVariant::PlanGenerate, &params) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let agent = match self.agents.get(agent_name) {
                Some(a) => a,
                None => continue,
            };
            let limiter = match self.limiters.get(agent_name) {
                Ok(l) => l,
                Err(_) => continue,
            };
            let request = ExecuteRequest {
                prompt: rendered,
                format: Format::Json,
                model: self.config.resolve_phase_model(agent_name, Phase::Plan, None),
                timeout: self.config.phase_timeouts.plan,
                sandbox: self.config.sandbox,
                denied_tools: self.config.deny_tools.clone(),
                work_dir: self.writer.run_dir().to_path_buf(),
                phase: Phase::Plan,
            };
            let _permit = match limiter.acquire(agent_name).await {
                Ok(p) => p,
                Err(_) => continue,
            };
            match retry(control, &self.retry_policy, NoopNotify, move |_n| {
                let agent = agent.clone();
                let req = request.clone();
                async move { agent.execute(req).await }
            })
            .await
            {
                Ok(result) => candidates.push(result.output),
                Err(e) => warn!(agent_name, error = %e, "fallback plan agent failed"),
            }
        }

        if candidates.is_empty() {
            return Err(PhaseError::Partial { got: 0, need: 1 });
        }

        if candidates.len() == 1 || self.config.plan_synthesizer.agent.is_none() {
            return parse_manifest(&candidates[0]);
        }

        let synthesizer = self.config.plan_synthesizer.agent.clone().expect("checked above");
        let agent = self
            .agents
            .get(&synthesizer)
            .ok_or_else(|| PhaseError::validation("UNKNOWN_AGENT", format!("plan synthesizer {synthesizer:?} not registered")))?;
        let params = PromptParams::new().with_list("plans", candidates.clone());
        let rendered = self
            .renderer
            .render(PromptVariant::SynthesizePlans, &params)
            .map_err(|e| PhaseError::Execution(e.to_string()))?;
        let limiter = self.limiters.get(&synthesizer).map_err(|e| PhaseError::Execution(e.to_string()))?;
        let request = ExecuteRequest {
            prompt: rendered,
            format: Format::Json,
            model: self.config.resolve_phase_model(&synthesizer, Phase::Plan, None),
            timeout: self.config.phase_timeouts.plan,
            sandbox: self.config.sandbox,
            denied_tools: self.config.deny_tools.clone(),
            work_dir: self.writer.run_dir().to_path_buf(),
            phase: Phase::Plan,
        };
        let _permit = limiter.acquire(&synthesizer).await.map_err(|e| PhaseError::Execution(e.to_string()))?;
        match retry(control, &self.retry_policy, NoopNotify, move |_n| {
            let agent = agent.clone();
            let req = request.clone();
            async move { agent.execute(req).await }
        })
        .await
        {
            Ok(result) => parse_manifest(&result.output),
            Err(_) => parse_manifest(&candidates[0]),
        }
    }

    /// Spec §4.3 steps 4-5: the tasks directory is the source of truth for
    /// which tasks actually exist. A JSON manifest entry whose spec file is
    /// missing on disk is kept (logged, not failed, since the agent may
    /// have answered without writing every file); a spec file on disk with
    /// no corresponding JSON entry is added as a dependency-free task so a
    /// manifest that under-reports tasks doesn't silently drop work the
    /// agent actually produced.
    async fn reconcile_with_tasks_dir(&self, manifest: &mut ComprehensiveTaskManifest) {
        let on_disk = scan_task_files(&self.writer.tasks_dir()).await;
        let on_disk_ids: HashSet<&TaskId> = on_disk.iter().map(|(id, _, _)| id).collect();

        for task in &manifest.tasks {
            if !on_disk_ids.contains(&task.id) && !self.writer.exists(&task.file).await {
                warn!(task_id = %task.id, file = %task.file.display(), "planner manifest references a task spec file that was not written to disk");
            }
        }

        let known: HashSet<TaskId> = manifest.tasks.iter().map(|t| t.id.clone()).collect();
        let mut added_any = false;
        for (id, name, path) in on_disk {
            if known.contains(&id) {
                continue;
            }
            info!(task_id = %id, file = %path.display(), "adding task found on disk but absent from the planner's JSON manifest");
            manifest.tasks.push(ManifestTask {
                id,
                name,
                file: path,
                dependencies: Vec::new(),
                complexity: None,
                cli: None,
            });
            added_any = true;
        }

        // Recompute levels so the persisted execution-graph artifact still
        // matches the (possibly now larger) task set's real dependencies.
        if added_any {
            if let Ok(dag) = build_dag(
                &manifest
                    .tasks
                    .iter()
                    .map(|t| (t.id.clone(), t.dependencies.clone()))
                    .collect::<Vec<_>>(),
            ) {
                if let Ok(levels) = dag.build() {
                    manifest.execution_levels = levels;
                }
            }
        }
    }

    /// Convert the manifest's tasks into `TaskState`s and insert them into
    /// `state`, validating the dependency graph is acyclic before doing so
    /// (spec §4.4 invariant: the Plan phase never hands the Executor a
    /// cyclic graph).
    fn materialize(&self, state: &mut WorkflowState, manifest: &ComprehensiveTaskManifest) -> PhaseResult<()> {
        let dag = build_dag(&manifest.tasks.iter().map(|t| (t.id.clone(), t.dependencies.clone())).collect::<Vec<_>>())
            .map_err(|e| PhaseError::state("CYCLIC_PLAN", e.to_string()))?;
        dag.build().map_err(|e| PhaseError::state("CYCLIC_PLAN", e.to_string()))?;

        for task in &manifest.tasks {
            let mut task_state = TaskState::new(task.id.clone(), task.name.clone(), task.cli.clone().unwrap_or_else(|| self.config.default_agent.clone()));
            task_state.phase = Phase::Execute;
            task_state.dependencies = task.dependencies.clone();
            task_state.model = self.config.resolve_phase_model(&task_state.cli, Phase::Execute, None);
            info!(task_id = %task_state.id, "materialized plan task");
            state.insert_task(task_state);
        }
        Ok(())
    }
}

/// Rebuild a [`TaskDag`] from a workflow's current task set (spec §4.4
/// "rebuild on resume"): used by both the Planner (freshly, right after
/// materializing) and the Executor (on resume into the Execute phase,
/// without re-running the Planner).
pub fn rebuild_dag_from_state(state: &WorkflowState) -> Result<TaskDag, DagError> {
    let pairs: Vec<(String, Vec<String>)> = state
        .run
        .task_order
        .iter()
        .filter_map(|id| state.run.tasks.get(id))
        .map(|t| (t.id.clone(), t.dependencies.clone()))
        .collect();
    build_dag(&pairs)
}

fn build_dag(pairs: &[(String, Vec<String>)]) -> Result<TaskDag, DagError> {
    let mut dag = TaskDag::new();
    let known: HashSet<String> = pairs.iter().map(|(id, _)| id.clone()).collect();
    for (id, _) in pairs {
        dag.add_task(id.clone())?;
    }
    for (id, deps) in pairs {
        for dep in deps {
            if !known.contains(dep) {
                return Err(DagError::UnknownDependency(dep.clone()));
            }
            dag.add_dependency(dep, id)?;
        }
    }
    Ok(dag)
}

/// Scan a tasks directory for `{id}-{name}.md` files (spec §4.3 step 5): the
/// id is the token before the first hyphen, the rest of the stem (hyphens
/// restored) is the name. Missing or unreadable directories just yield no
/// tasks — resolved at the caller via the JSON manifest instead.
async fn scan_task_files(dir: &Path) -> Vec<(TaskId, String, PathBuf)> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return found,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((id, name)) = stem.split_once('-') else {
            continue;
        };
        found.push((id.to_string(), name.to_string(), path));
    }
    found
}

/// A handful of agent CLIs wrap their answer instead of emitting a bare
/// manifest: a `{result|content|text|output: "..."}` envelope whose string
/// value is itself the manifest (possibly fenced prose), or Gemini's
/// `candidates[0].content.parts[].text`. Unwrap one layer of either before
/// falling back to balanced-bracket extraction.
fn unwrap_agent_envelope(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;

    if let Some(text) = value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(text.to_string());
    }

    for key in ["result", "content", "text", "output"] {
        if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
            return Some(text.to_string());
        }
    }

    None
}

fn parse_manifest_body(raw: &str) -> Result<ComprehensiveTaskManifest, serde_json::Error> {
    let trimmed = extract_json_object(raw);
    serde_json::from_str::<ComprehensiveTaskManifest>(trimmed).or_else(|_| {
        // Accept a bare task list too, computing levels ourselves.
        let tasks: Vec<ManifestTask> = serde_json::from_str(trimmed)?;
        let pairs: Vec<(String, Vec<String>)> =
            tasks.iter().map(|t| (t.id.clone(), t.dependencies.clone())).collect();
        let dag = build_dag(&pairs).map_err(|e| serde_json::Error::io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;
        let execution_levels = dag
            .build()
            .map_err(|e| serde_json::Error::io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;
        Ok(ComprehensiveTaskManifest { tasks, execution_levels })
    })
}

fn parse_manifest(raw: &str) -> PhaseResult<ComprehensiveTaskManifest> {
    if let Ok(manifest) = parse_manifest_body(raw) {
        return Ok(manifest);
    }
    if let Some(unwrapped) = unwrap_agent_envelope(raw) {
        if let Ok(manifest) = parse_manifest_body(&unwrapped) {
            return Ok(manifest);
        }
    }
    parse_manifest_body(raw)
        .map_err(|e| PhaseError::Execution(format!("failed to parse plan manifest: {e}")))
}

/// Agent output commonly wraps JSON in prose or a fenced code block; extract
/// the first balanced `{...}` object, falling back to the raw text.
fn extract_json_object(text: &str) -> &str {
    let start = match text.find('{') {
        Some(i) => i,
        None => return text,
    };
    let mut depth = 0i32;
    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return &text[start..=start + i];
                }
            }
            _ => {}
        }
    }
    text
}

#[allow(unused)]
fn _assert_manifest_map_helper(_m: &HashMap<String, String>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_object_from_fenced_prose() {
        let text = "Here is the plan:\n```json\n{\"tasks\": [], \"execution_levels\": []}\n```\nthanks";
        let extracted = extract_json_object(text);
        assert_eq!(extracted, "{\"tasks\": [], \"execution_levels\": []}");
    }

    #[test]
    fn parses_manifest_with_explicit_levels() {
        let raw = r#"{"tasks": [{"id":"t1","name":"n","file":"t1.md","dependencies":[],"complexity":null,"cli":"claude"}], "execution_levels": [["t1"]]}"#;
        let manifest = parse_manifest(raw).unwrap();
        assert_eq!(manifest.tasks.len(), 1);
        assert_eq!(manifest.execution_levels, vec![vec!["t1".to_string()]]);
    }

    #[test]
    fn parses_bare_task_list_and_computes_levels() {
        let raw = r#"[{"id":"t1","name":"n1","file":"t1.md","dependencies":[],"complexity":null,"cli":null},
                       {"id":"t2","name":"n2","file":"t2.md","dependencies":["t1"],"complexity":null,"cli":null}]"#;
        let manifest = parse_manifest(raw).unwrap();
        assert_eq!(manifest.execution_levels, vec![vec!["t1".to_string()], vec!["t2".to_string()]]);
    }

    #[test]
    fn rebuild_dag_from_state_respects_dependencies() {
        let mut state = WorkflowState::new("do it", None);
        let mut t1 = TaskState::new("t1", "first", "claude");
        t1.dependencies = vec![];
        let mut t2 = TaskState::new("t2", "second", "claude");
        t2.dependencies = vec!["t1".to_string()];
        state.insert_task(t1);
        state.insert_task(t2);

        let dag = rebuild_dag_from_state(&state).unwrap();
        let levels = dag.build().unwrap();
        assert_eq!(levels[0], vec!["t1".to_string()]);
        assert_eq!(levels[1], vec!["t2".to_string()]);
    }

    #[test]
    fn unwraps_result_envelope_before_parsing() {
        let raw = r#"{"result": "{\"tasks\": [], \"execution_levels\": []}"}"#;
        let manifest = parse_manifest(raw).unwrap();
        assert!(manifest.tasks.is_empty());
    }

    #[test]
    fn unwraps_gemini_candidate_envelope() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"{\"tasks\": [], \"execution_levels\": []}"}]}}]}"#;
        let manifest = parse_manifest(raw).unwrap();
        assert!(manifest.tasks.is_empty());
    }

    #[tokio::test]
    async fn scan_task_files_parses_id_name_md_pattern() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("t1-setup-db.md"), "spec").await.unwrap();
        tokio::fs::write(dir.path().join("ignored.txt"), "x").await.unwrap();

        let found = scan_task_files(dir.path()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "t1");
        assert_eq!(found[0].1, "setup-db");
    }

    struct Layout {
        run_dir: PathBuf,
    }
    impl ReportPaths for Layout {
        fn run_dir(&self) -> &Path {
            &self.run_dir
        }
    }
    #[async_trait::async_trait]
    impl ReportWriter for Layout {
        async fn write(&self, path: &Path, content: &str) -> crate::report::ReportResult<()> {
            crate::report::FsReportWriter.write(path, content).await
        }
        async fn read(&self, path: &Path) -> crate::report::ReportResult<String> {
            crate::report::FsReportWriter.read(path).await
        }
        async fn exists(&self, path: &Path) -> bool {
            crate::report::FsReportWriter.exists(path).await
        }
    }

    struct StubRenderer;
    impl PromptRenderer for StubRenderer {
        fn render(&self, _variant: PromptVariant, _params: &PromptParams) -> Result<String, crate::prompts::PromptError> {
            Ok("rendered prompt".to_string())
        }
    }

    #[tokio::test]
    async fn reconcile_adds_tasks_found_only_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().to_path_buf();
        tokio::fs::create_dir_all(run_dir.join("plan-phase/tasks")).await.unwrap();
        tokio::fs::write(run_dir.join("plan-phase/tasks/t2-extra.md"), "spec").await.unwrap();

        let planner = Planner::new(
            Arc::new(AgentRegistry::new("claude")),
            Arc::new(StubRenderer),
            Arc::new(Layout { run_dir }),
            RateLimiterRegistry::new(std::iter::empty()),
            RetryPolicy::default(),
            WorkflowConfig::default(),
        );

        let mut manifest = ComprehensiveTaskManifest {
            tasks: vec![ManifestTask {
                id: "t1".into(),
                name: "first".into(),
                file: PathBuf::from("t1-first.md"),
                dependencies: vec![],
                complexity: None,
                cli: None,
            }],
            execution_levels: vec![vec!["t1".to_string()]],
        };

        planner.reconcile_with_tasks_dir(&mut manifest).await;

        assert_eq!(manifest.tasks.len(), 2);
        assert!(manifest.tasks.iter().any(|t| t.id == "t2"));
    }
}
