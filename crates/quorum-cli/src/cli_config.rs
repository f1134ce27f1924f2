//! CLI-level configuration: the engine's [`WorkflowConfig`] plus everything
//! this binary needs that the engine itself stays agnostic to — which agent
//! binaries exist and how to invoke them, where state/reports live, and
//! optional GitHub credentials.

use std::collections::HashMap;
use std::path::PathBuf;

use coordination::{ConfigError, ConfigResult, Phase, WorkflowConfig};
use serde::Deserialize;

/// One configured agent CLI (spec §6's claude/gemini/codex/copilot are the
/// defaults; any other binary that speaks the same invocation shape can be
/// added without a code change).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub json_flag: Option<String>,
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseName>,
    #[serde(default)]
    pub supports_json: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Refine,
    Analyze,
    Plan,
    Execute,
}

impl From<PhaseName> for Phase {
    fn from(v: PhaseName) -> Self {
        match v {
            PhaseName::Refine => Phase::Refine,
            PhaseName::Analyze => Phase::Analyze,
            PhaseName::Plan => Phase::Plan,
            PhaseName::Execute => Phase::Execute,
        }
    }
}

fn default_phases() -> Vec<PhaseName> {
    vec![PhaseName::Analyze, PhaseName::Plan, PhaseName::Execute]
}

fn default_max_context_tokens() -> u64 {
    128_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    pub token: Option<String>,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub repo_root: Option<PathBuf>,
    #[serde(default)]
    pub worktree_base: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
    #[serde(default)]
    pub github: Option<GithubConfig>,
}

impl CliConfig {
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        toml::from_str(raw).map_err(ConfigError::from)
    }

    pub fn load(path: &std::path::Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// The default shipped wiring (spec §6): claude/gemini/codex/copilot,
    /// each invoked the same way — prompt as the last positional argument,
    /// stdout captured as the response.
    pub fn default_agents() -> Vec<AgentSpec> {
        vec![
            AgentSpec {
                name: "claude".to_string(),
                command: "claude".to_string(),
                args: vec!["-p".to_string()],
                model_flag: Some("--model".to_string()),
                json_flag: Some("--output-format=json".to_string()),
                phases: vec![PhaseName::Analyze, PhaseName::Plan, PhaseName::Execute],
                supports_json: true,
                supports_streaming: true,
                supports_tools: true,
                supports_images: true,
                max_context_tokens: 200_000,
            },
            AgentSpec {
                name: "gemini".to_string(),
                command: "gemini".to_string(),
                args: vec!["-p".to_string()],
                model_flag: Some("--model".to_string()),
                json_flag: Some("--output-format=json".to_string()),
                phases: vec![PhaseName::Analyze, PhaseName::Plan, PhaseName::Execute],
                supports_json: true,
                supports_streaming: false,
                supports_tools: true,
                supports_images: true,
                max_context_tokens: 1_000_000,
            },
            AgentSpec {
                name: "codex".to_string(),
                command: "codex".to_string(),
                args: vec!["exec".to_string()],
                model_flag: Some("--model".to_string()),
                json_flag: Some("--json".to_string()),
                phases: vec![PhaseName::Analyze, PhaseName::Plan, PhaseName::Execute],
                supports_json: true,
                supports_streaming: false,
                supports_tools: true,
                supports_images: false,
                max_context_tokens: 128_000,
            },
            AgentSpec {
                name: "copilot".to_string(),
                command: "copilot".to_string(),
                args: vec!["suggest".to_string()],
                model_flag: None,
                json_flag: None,
                phases: vec![PhaseName::Analyze, PhaseName::Execute],
                supports_json: false,
                supports_streaming: false,
                supports_tools: false,
                supports_images: false,
                max_context_tokens: 64_000,
            },
        ]
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig::default(),
            agents: Self::default_agents(),
            repo_root: None,
            worktree_base: None,
            state_dir: None,
            run_dir: None,
            github: None,
        }
    }
}

/// Per-agent rate limits keyed by agent name, reshaped from
/// [`WorkflowConfig::agent_rate_limits`] into the tuples
/// [`coordination::RateLimiterRegistry::new`] wants.
pub fn rate_limit_tuples(config: &WorkflowConfig) -> Vec<(String, usize, Option<std::time::Duration>)> {
    let mut limits: HashMap<String, (usize, Option<std::time::Duration>)> = HashMap::new();
    for (agent, limit) in &config.agent_rate_limits {
        limits.insert(agent.clone(), (limit.max_concurrent, limit.acquire_timeout));
    }
    limits.into_iter().map(|(name, (max, timeout))| (name, max, timeout)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agents_array_from_toml() {
        let raw = r#"
[workflow]
dry_run = false
sandbox = true
default_agent = "claude"
max_retries = 3
worktree_mode = "always"
worktree_auto_clean = true
max_prompt_length = 1000

[workflow.phase_timeouts]
refine = 60
analyze = 600
plan = 300
execute = 1200

[workflow.git_isolation]
enabled = false
merge_strategy = "squash"

[workflow.moderator]
enabled = true
threshold = 0.8
min_rounds = 1
max_rounds = 3
abort_threshold = 0.5
stagnation_threshold = 0.02
agent = "claude"

[workflow.analyze_synthesizer]
enabled = true
agent = "claude"

[workflow.finalize]
auto_commit = true
auto_push = false
auto_pr = false
auto_merge = false
merge_strategy = "squash"
remote = "origin"

[[agents]]
name = "claude"
command = "claude"
args = ["-p"]
phases = ["analyze", "plan", "execute"]
supports_json = true
"#;
        let config = CliConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].name, "claude");
        assert!(config.agents[0].supports_json);
        assert_eq!(config.workflow.default_agent, "claude");
    }

    #[test]
    fn default_agents_cover_the_four_named_clis() {
        let names: Vec<&str> = CliConfig::default_agents().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["claude", "gemini", "codex", "copilot"]);
    }
}
