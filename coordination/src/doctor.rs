//! Doctor (spec §4.12) — a readiness check a CLI can run before committing
//! to a workflow: the same config/agent validation the Runner does at step
//! 1, plus a live probe of every configured agent and a check that git
//! worktrees are usable in this environment.

use std::time::Duration;

use tracing::warn;

use crate::agent::{AgentRegistry, ExecuteRequest, Format};
use crate::config::WorkflowConfig;
use crate::git::GitClient;
use crate::runner::validate_agents_and_config;
use crate::state::Phase;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_PROMPT: &str = "respond with the single word: ready";

/// Reachability result for one configured agent.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub name: String,
    pub reachable: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub config_errors: Vec<(String, String)>,
    pub agents: Vec<AgentReport>,
    pub worktree_support: bool,
}

impl DoctorReport {
    /// Spec §4.12: a non-zero exit is warranted if config is invalid, any
    /// configured agent is unreachable, or worktrees can't be listed.
    pub fn is_healthy(&self) -> bool {
        self.config_errors.is_empty() && self.worktree_support && self.agents.iter().all(|a| a.reachable)
    }
}

/// Runs every check in spec §4.12 against `agents`/`config`/`git`. Never
/// returns an error itself — every failure mode is reported as data so the
/// caller can print a full diagnosis instead of bailing on the first
/// problem.
pub async fn run(agents: &AgentRegistry, config: &WorkflowConfig, git: &dyn GitClient) -> DoctorReport {
    let config_errors = validate_agents_and_config(agents, config)
        .into_iter()
        .map(|(code, message)| (code.to_string(), message))
        .collect();

    let mut probed = std::collections::HashSet::new();
    let mut reports = Vec::new();
    for phase in [Phase::Refine, Phase::Analyze, Phase::Plan, Phase::Execute] {
        for name in agents.enabled_for(phase) {
            if probed.insert(name.clone()) {
                reports.push(probe_agent(agents, name).await);
            }
        }
    }
    if probed.insert(agents.default_agent().to_string()) {
        reports.push(probe_agent(agents, agents.default_agent()).await);
    }

    let worktree_support = git.worktree_list().await.is_ok();
    if !worktree_support {
        warn!("git worktree listing failed; this environment may not support worktree isolation");
    }

    DoctorReport {
        config_errors,
        agents: reports,
        worktree_support,
    }
}

async fn probe_agent(agents: &AgentRegistry, name: &str) -> AgentReport {
    let Some(agent) = agents.get(name) else {
        return AgentReport {
            name: name.to_string(),
            reachable: false,
            error: Some("agent is referenced but not registered".to_string()),
        };
    };

    let request = ExecuteRequest {
        prompt: PROBE_PROMPT.to_string(),
        format: Format::Text,
        model: None,
        timeout: PROBE_TIMEOUT,
        sandbox: true,
        denied_tools: Vec::new(),
        work_dir: std::env::current_dir().unwrap_or_default(),
        phase: Phase::Execute,
    };

    match tokio::time::timeout(PROBE_TIMEOUT, agent.execute(request)).await {
        Ok(Ok(_)) => AgentReport {
            name: name.to_string(),
            reachable: true,
            error: None,
        },
        Ok(Err(e)) => AgentReport {
            name: name.to_string(),
            reachable: false,
            error: Some(e.to_string()),
        },
        Err(_) => AgentReport {
            name: name.to_string(),
            reachable: false,
            error: Some(format!("probe did not respond within {PROBE_TIMEOUT:?}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentResult, Capabilities, ExecuteResult, FinishReason};
    use crate::git::{GitChangesInfo, GitError, MergeStrategy};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    struct EchoAgent {
        name: String,
        fails: bool,
    }
    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_tools: false,
                supports_images: false,
                max_context_tokens: 10_000,
            }
        }
        async fn execute(&self, _request: ExecuteRequest) -> AgentResult<ExecuteResult> {
            if self.fails {
                return Err(crate::agent::AgentError::Subprocess {
                    agent: self.name.clone(),
                    message: "binary not found".to_string(),
                });
            }
            Ok(ExecuteResult {
                output: "ready".to_string(),
                model: None,
                tokens_in: 1,
                tokens_out: 1,
                cost_usd: 0.0,
                finish_reason: FinishReason::Stop,
                tool_calls: vec![],
            })
        }
    }

    struct FakeGit {
        worktrees_ok: bool,
    }
    #[async_trait]
    impl GitClient for FakeGit {
        fn repo_root(&self) -> PathBuf {
            PathBuf::from("/repo")
        }
        async fn current_branch(&self, _path: &Path) -> Result<String, GitError> {
            Ok("main".into())
        }
        async fn status(&self, _path: &Path) -> Result<GitChangesInfo, GitError> {
            Ok(GitChangesInfo::default())
        }
        async fn worktree_add(&self, _path: &Path, _branch: &str, _base: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn worktree_remove(&self, _path: &Path) -> Result<(), GitError> {
            Ok(())
        }
        async fn worktree_list(&self) -> Result<Vec<PathBuf>, GitError> {
            if self.worktrees_ok {
                Ok(vec![])
            } else {
                Err(GitError::Failed("worktree not supported".to_string()))
            }
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
            Ok("sha".to_string())
        }
        async fn push(&self, _path: &Path, _remote: &str, _branch: &str) -> Result<(), GitError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn healthy_when_every_agent_reachable_and_worktrees_supported() {
        let mut registry = AgentRegistry::new("claude");
        registry.register(
            Arc::new(EchoAgent { name: "claude".into(), fails: false }),
            &[Phase::Analyze, Phase::Plan, Phase::Execute],
        );
        let config = WorkflowConfig {
            default_agent: "claude".to_string(),
            ..WorkflowConfig::default()
        };
        let git = FakeGit { worktrees_ok: true };

        let report = run(&registry, &config, &git).await;

        assert!(report.is_healthy());
        assert_eq!(report.agents.len(), 1);
        assert!(report.agents[0].reachable);
    }

    #[tokio::test]
    async fn unreachable_agent_and_broken_worktrees_are_reported() {
        let mut registry = AgentRegistry::new("claude");
        registry.register(
            Arc::new(EchoAgent { name: "claude".into(), fails: true }),
            &[Phase::Execute],
        );
        let config = WorkflowConfig {
            default_agent: "claude".to_string(),
            ..WorkflowConfig::default()
        };
        let git = FakeGit { worktrees_ok: false };

        let report = run(&registry, &config, &git).await;

        assert!(!report.is_healthy());
        assert!(!report.worktree_support);
        assert!(!report.agents[0].reachable);
        assert!(report.agents[0].error.is_some());
    }

    #[tokio::test]
    async fn reports_missing_default_agent_as_a_config_error() {
        let registry = AgentRegistry::new("claude");
        let config = WorkflowConfig::default();
        let git = FakeGit { worktrees_ok: true };

        let report = run(&registry, &config, &git).await;

        assert!(!report.is_healthy());
        assert!(report.config_errors.iter().any(|(code, _)| code == "NO_AGENTS"));
    }
}
