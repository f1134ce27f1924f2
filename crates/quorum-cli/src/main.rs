//! `quorum` binary — wires subprocess agents, the shelled-out git/GitHub
//! clients, the filesystem report writer and a sled-backed state store into
//! the `coordination` engine, and exposes the CLI surface spec §6 names:
//! `run`, `resume`, `purge`, `delete`, `doctor`.

mod agents;
mod cli_config;
mod git;
mod github;
mod prompts;
mod shell_safety;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use coordination::{
    AgentRegistry, Analyzer, Control, Executor, Finalizer, Moderator, Planner, RateLimiterRegistry,
    ReportPaths, ReportWriter, RetryPolicy, Runner, SharedStateStore, SledStateStore, WatchdogConfig,
    WorkflowId, WorktreeManager,
};
use tracing_subscriber::EnvFilter;

use crate::agents::CliAgent;
use crate::cli_config::{rate_limit_tuples, CliConfig};
use crate::git::ShellGitClient;
use crate::github::OctocrabGitHubClient;
use crate::prompts::TemplateRenderer;

#[derive(Parser)]
#[command(name = "quorum", about = "Multi-agent workflow orchestrator")]
struct Cli {
    /// Path to the TOML config file (defaults to `quorum.toml` in the cwd).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a brand-new workflow run for `prompt`.
    Run {
        prompt: String,
        /// Run interactively, pausing before each phase for operator review.
        #[arg(long)]
        interactive: bool,
    },
    /// Resume an existing workflow from its last checkpoint.
    Resume { workflow_id: String },
    /// Delete every persisted workflow.
    Purge,
    /// Delete one persisted workflow.
    Delete { workflow_id: String },
    /// Validate configuration and probe every configured agent.
    Doctor,
}

/// A filesystem [`ReportWriter`] rooted at a run directory, combining the
/// default [`FsReportWriter`](coordination::FsReportWriter) behavior with
/// [`ReportPaths`] so `Runner`/`Analyzer`/`Planner`/`Executor` (generic over
/// a single `W: ReportWriter + ReportPaths`) have one concrete type to share.
struct RunReportWriter {
    run_dir: PathBuf,
    inner: coordination::FsReportWriter,
}

impl RunReportWriter {
    fn new(run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            inner: coordination::FsReportWriter,
        }
    }
}

impl ReportPaths for RunReportWriter {
    fn run_dir(&self) -> &std::path::Path {
        &self.run_dir
    }
}

#[async_trait::async_trait]
impl ReportWriter for RunReportWriter {
    async fn write(&self, path: &std::path::Path, content: &str) -> coordination::ReportResult<()> {
        self.inner.write(path, content).await
    }
    async fn read(&self, path: &std::path::Path) -> coordination::ReportResult<String> {
        self.inner.read(path).await
    }
    async fn exists(&self, path: &std::path::Path) -> bool {
        self.inner.exists(path).await
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(runner_err) = err.downcast_ref::<coordination::RunnerError>() {
        if let coordination::RunnerError::Phase(phase_err) = runner_err {
            if matches!(phase_err, coordination::PhaseError::HumanReviewRequired { .. }) {
                return 2;
            }
        }
    }
    1
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.unwrap_or_else(|| PathBuf::from("quorum.toml"));
    let cli_config = if config_path.exists() {
        CliConfig::load(&config_path)?
    } else {
        CliConfig::default()
    };

    let repo_root = cli_config
        .repo_root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().expect("cwd"));
    let state_dir = cli_config.state_dir.clone().unwrap_or_else(|| repo_root.join(".quorum/state"));
    let worktree_base = cli_config.worktree_base.clone().unwrap_or_else(|| repo_root.join(".quorum/worktrees"));
    let run_dir_base = cli_config.run_dir.clone().unwrap_or_else(|| repo_root.join(".quorum/runs"));

    let store: SharedStateStore = Arc::new(SledStateStore::open(state_dir)?);

    let mut registry = AgentRegistry::new(cli_config.workflow.default_agent.clone());
    for spec in &cli_config.agents {
        let phases: Vec<coordination::Phase> = spec.phases.iter().copied().map(Into::into).collect();
        registry.register(Arc::new(CliAgent::new(spec.clone(), Vec::new())), &phases);
    }
    let agents = Arc::new(registry);

    let git: Arc<dyn coordination::GitClient> = Arc::new(ShellGitClient::new(repo_root.clone()));
    let github: Option<Arc<dyn coordination::GitHubClient>> = match &cli_config.github {
        Some(gh) => Some(Arc::new(OctocrabGitHubClient::new(
            gh.token.clone(),
            gh.owner.clone(),
            gh.repo.clone(),
        )?)),
        None => None,
    };

    match cli.command {
        Command::Doctor => {
            let report = coordination::doctor::run(&agents, &cli_config.workflow, git.as_ref()).await;
            print_doctor_report(&report);
            if !report.is_healthy() {
                anyhow::bail!("one or more readiness checks failed");
            }
            Ok(())
        }
        Command::Purge => {
            store.acquire_global_lock().map_err(anyhow::Error::from)?;
            let result = store.purge_all_workflows();
            let _ = store.release_global_lock();
            result.map_err(anyhow::Error::from)?;
            println!("purged all workflows");
            Ok(())
        }
        Command::Delete { workflow_id } => {
            let id = WorkflowId::parse(workflow_id).map_err(|e| anyhow::anyhow!(e))?;
            store.delete_workflow(&id).map_err(anyhow::Error::from)?;
            println!("deleted workflow");
            Ok(())
        }
        Command::Run { prompt, interactive } => {
            // The engine's `Runner<W>` is generic over one concrete report
            // writer fixed at construction, but the writer's run directory
            // is keyed by workflow id (spec §6 filesystem layout is "under
            // a run directory", one per workflow). A brand-new run's id
            // only exists once `WorkflowState::new` has run, so the CLI
            // constructs the initial state itself (mirroring what
            // `Runner::run` does internally) before the writer - and
            // therefore the runner - can be built, then drives it via
            // `resume`, which is equivalent for a state with no
            // checkpoints yet.
            cli_config.workflow.validate_prompt(&prompt).map_err(anyhow::Error::from)?;
            let blueprint = interactive.then(|| coordination::Blueprint {
                execution_mode: coordination::ExecutionMode::Interactive,
            });
            let mut state = coordination::WorkflowState::new(prompt, blueprint);
            let run_dir = coordination::state::run_dir(&run_dir_base, state.id());
            state.run.report_path = Some(run_dir.clone());
            let id = state.id().clone();
            store.acquire_lock(&id).map_err(anyhow::Error::from)?;
            store.save(&state).map_err(anyhow::Error::from)?;
            let _ = store.release_lock(&id);

            let runner = build_runner(store, agents, cli_config.workflow.clone(), git, github, worktree_base, run_dir)?;
            let state = runner.resume(&id).await?;
            print_result(&state);
            Ok(())
        }
        Command::Resume { workflow_id } => {
            let id = WorkflowId::parse(&workflow_id).map_err(|e| anyhow::anyhow!(e))?;
            let run_dir = coordination::state::run_dir(&run_dir_base, &id);
            let runner = build_runner(store, agents, cli_config.workflow.clone(), git, github, worktree_base, run_dir)?;
            let state = runner.resume(&id).await?;
            print_result(&state);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_runner(
    store: SharedStateStore,
    agents: Arc<AgentRegistry>,
    config: coordination::WorkflowConfig,
    git: Arc<dyn coordination::GitClient>,
    github: Option<Arc<dyn coordination::GitHubClient>>,
    worktree_base: PathBuf,
    run_dir: PathBuf,
) -> anyhow::Result<Runner<RunReportWriter>> {
    let writer = Arc::new(RunReportWriter::new(run_dir));

    let renderer: Arc<dyn coordination::PromptRenderer> = Arc::new(TemplateRenderer);
    let limiters = RateLimiterRegistry::new(rate_limit_tuples(&config));
    let retry_policy = RetryPolicy {
        max_attempts: config.max_retries.max(1),
        ..RetryPolicy::default()
    };

    let moderator_agent_name = config
        .moderator
        .agent
        .clone()
        .ok_or_else(|| anyhow::anyhow!("moderator agent must be configured"))?;
    let moderator_agent = agents
        .get(&moderator_agent_name)
        .ok_or_else(|| anyhow::anyhow!("moderator agent '{moderator_agent_name}' is not registered"))?;
    let moderator = Moderator::new(
        moderator_agent,
        limiters.clone(),
        writer.clone(),
        retry_policy.clone(),
        WatchdogConfig::default(),
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

    let worktrees = Arc::new(WorktreeManager::new(git.clone(), worktree_base));
    let finalizer = Arc::new(Finalizer::new(git.clone(), github, config.finalize.clone()));

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

    let control = Control::new();

    Ok(Runner::new(store, agents, writer, analyzer, planner, executor, config, control))
}

fn print_doctor_report(report: &coordination::DoctorReport) {
    for (code, message) in &report.config_errors {
        println!("config error [{code}]: {message}");
    }
    for agent in &report.agents {
        if agent.reachable {
            println!("agent {}: reachable", agent.name);
        } else {
            println!("agent {}: UNREACHABLE ({})", agent.name, agent.error.clone().unwrap_or_default());
        }
    }
    println!("worktree support: {}", if report.worktree_support { "ok" } else { "unavailable" });
    println!("overall: {}", if report.is_healthy() { "healthy" } else { "unhealthy" });
}

fn print_result(state: &coordination::WorkflowState) {
    println!("workflow {}: {:?}", state.id().as_str(), state.run.status);
    if let Some(path) = &state.run.report_path {
        println!("report: {}", path.display());
    }
    if let Some(score) = state.run.metrics.consensus_score {
        println!("consensus score: {score:.3}");
    }
}
