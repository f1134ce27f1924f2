//! The `Agent` trait — the one primitive the engine consumes for actually
//! running an LLM-backed CLI tool (spec §6 "Agent interface").
//!
//! Concrete subprocess-backed implementations (claude/gemini/codex/copilot)
//! live in the `quorum-cli` crate; this module only defines the contract
//! plus the small value types every implementation must produce.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Timeout,
    Error,
    Cancelled,
}

/// One invocation request sent to an [`Agent`].
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub format: Format,
    pub model: Option<String>,
    pub timeout: Duration,
    pub sandbox: bool,
    pub denied_tools: Vec<String>,
    pub work_dir: PathBuf,
    pub phase: Phase,
}

/// Result of one [`Agent::execute`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub output: String,
    pub model: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub finish_reason: FinishReason,
    pub tool_calls: Vec<String>,
}

/// Capabilities an agent advertises (spec §6 and §4.11).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_json: bool,
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_images: bool,
    pub max_context_tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent {agent} timed out after {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    #[error("agent {agent} denied tool {tool:?}")]
    ToolDenied { agent: String, tool: String },

    #[error("agent {agent} subprocess failed: {message}")]
    Subprocess { agent: String, message: String },

    #[error("agent {agent} invocation cancelled")]
    Cancelled { agent: String },
}

pub type AgentResult<T> = Result<T, AgentError>;

/// The narrow interface the engine depends on for "run this prompt through
/// an LLM-backed tool" (spec §6). Implementations are out of scope for the
/// core engine — it only needs this trait boundary to compile and test
/// against fakes.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;
    async fn execute(&self, request: ExecuteRequest) -> AgentResult<ExecuteResult>;
}

/// Registry mapping agent name → implementation, plus which agents are
/// enabled for which phase (spec §4.2 "every agent enabled for the analyze
/// phase", §4.5 "every other agent enabled for execute").
pub struct AgentRegistry {
    agents: HashMap<String, std::sync::Arc<dyn Agent>>,
    enabled_for_phase: HashMap<Phase, Vec<String>>,
    default_agent: String,
}

impl AgentRegistry {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            agents: HashMap::new(),
            enabled_for_phase: HashMap::new(),
            default_agent: default_agent.into(),
        }
    }

    pub fn register(&mut self, agent: std::sync::Arc<dyn Agent>, phases: &[Phase]) {
        let name = agent.name().to_string();
        self.agents.insert(name.clone(), agent);
        for phase in phases {
            self.enabled_for_phase.entry(*phase).or_default().push(name.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn enabled_for(&self, phase: Phase) -> &[String] {
        self.enabled_for_phase
            .get(&phase)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Resolve a free-form CLI/agent field to a known agent name (spec §4.3
    /// step 6): shell-like aliases map to the default agent, anything else
    /// matches case-insensitively against agents enabled for `phase`, and
    /// an unrecognized value falls back to the default agent with a warning
    /// left to the caller to log.
    pub fn resolve_agent_name(&self, raw: &str, phase: Phase) -> String {
        const SHELL_ALIASES: &[&str] = &[
            "bash", "sh", "zsh", "fish", "powershell", "pwsh", "terminal", "shell", "command",
            "cli", "default", "auto",
        ];
        let lower = raw.trim().to_lowercase();
        if lower.is_empty() || SHELL_ALIASES.contains(&lower.as_str()) {
            return self.default_agent.clone();
        }
        for candidate in self.enabled_for(phase) {
            if candidate.to_lowercase() == lower {
                return candidate.clone();
            }
        }
        self.default_agent.clone()
    }
}
