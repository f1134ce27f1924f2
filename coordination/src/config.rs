//! `WorkflowConfig` — every tunable enumerated in spec §6, loaded from TOML
//! (serde derive + `toml::from_str`, `clap`-derived overrides applied by the
//! CLI binary).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::git::MergeStrategy;
use crate::moderator::ThresholdConfig;
use crate::state::Phase;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config [{code}]: {message}")]
    Invalid { code: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How aggressively the Executor isolates ready tasks into worktrees (spec
/// §4.5 step 3). Kept as an enum over the raw string space the config
/// format allows, with `Other` absorbing any unrecognized value (falls
/// through to `true`, matching the spec's "other -> true" default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeMode {
    Always,
    Parallel,
    Disabled,
    Off,
    #[serde(other)]
    Other,
}

impl Default for WorktreeMode {
    fn default() -> Self {
        WorktreeMode::Always
    }
}

impl WorktreeMode {
    /// Resolve whether worktrees are used for a ready-batch of `ready_count`
    /// tasks (spec §4.5 step 3).
    pub fn use_worktree(&self, ready_count: usize) -> bool {
        match self {
            WorktreeMode::Always => true,
            WorktreeMode::Parallel => ready_count > 1,
            WorktreeMode::Disabled | WorktreeMode::Off => false,
            WorktreeMode::Other => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    #[serde(with = "duration_secs")]
    pub refine: Duration,
    #[serde(with = "duration_secs")]
    pub analyze: Duration,
    #[serde(with = "duration_secs")]
    pub plan: Duration,
    #[serde(with = "duration_secs")]
    pub execute: Duration,
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Refine => self.refine,
            Phase::Analyze => self.analyze,
            Phase::Plan => self.plan,
            Phase::Execute => self.execute,
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            refine: Duration::from_secs(120),
            analyze: Duration::from_secs(900),
            plan: Duration::from_secs(600),
            execute: Duration::from_secs(1800),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
        v.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GitIsolationConfig {
    pub enabled: bool,
    pub merge_strategy: MergeStrategyConfig,
}

impl Default for GitIsolationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            merge_strategy: MergeStrategyConfig::Squash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategyConfig {
    Sequential,
    Squash,
    Rebase,
}

impl From<MergeStrategyConfig> for MergeStrategy {
    fn from(v: MergeStrategyConfig) -> Self {
        match v {
            MergeStrategyConfig::Sequential => MergeStrategy::Sequential,
            MergeStrategyConfig::Squash => MergeStrategy::Squash,
            MergeStrategyConfig::Rebase => MergeStrategy::Rebase,
        }
    }
}

/// Moderator config section (spec §6 `phases.analyze.moderator.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorConfig {
    pub enabled: bool,
    pub agent: Option<String>,
    pub threshold: f64,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub abort_threshold: f64,
    pub stagnation_threshold: f64,
    #[serde(default)]
    pub thresholds: HashMap<String, ThresholdConfigToml>,
}

impl Default for ModeratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent: None,
            threshold: 0.85,
            min_rounds: 1,
            max_rounds: 5,
            abort_threshold: 0.40,
            stagnation_threshold: 0.02,
            thresholds: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdConfigToml {
    pub threshold: f64,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub abort_threshold: f64,
    pub stagnation_threshold: f64,
}

impl From<ThresholdConfigToml> for ThresholdConfig {
    fn from(v: ThresholdConfigToml) -> Self {
        ThresholdConfig {
            threshold: v.threshold,
            min_rounds: v.min_rounds,
            max_rounds: v.max_rounds,
            abort_threshold: v.abort_threshold,
            stagnation_threshold: v.stagnation_threshold,
        }
    }
}

impl ModeratorConfig {
    pub fn base_threshold(&self) -> ThresholdConfig {
        ThresholdConfig {
            threshold: self.threshold,
            min_rounds: self.min_rounds,
            max_rounds: self.max_rounds,
            abort_threshold: self.abort_threshold,
            stagnation_threshold: self.stagnation_threshold,
        }
    }

    /// Build a [`ThresholdTable`](crate::moderator::ThresholdTable), selecting
    /// the `analysis|design|bugfix|refactor` buckets by key name.
    pub fn threshold_table(&self) -> crate::moderator::ThresholdTable {
        crate::moderator::ThresholdTable {
            default: self.base_threshold(),
            analysis: self.thresholds.get("analysis").copied().map(Into::into),
            design: self.thresholds.get("design").copied().map(Into::into),
            bugfix: self.thresholds.get("bugfix").copied().map(Into::into),
            refactor: self.thresholds.get("refactor").copied().map(Into::into),
        }
    }
}

/// Synthesizer config shared shape for both the analyze-phase consolidator
/// (`phases.analyze.synthesizer`, required, no default) and the optional
/// plan-phase multi-agent variant (`phases.plan.synthesizer`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    pub enabled: bool,
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    pub auto_commit: bool,
    pub auto_push: bool,
    pub auto_pr: bool,
    pub auto_merge: bool,
    pub pr_base_branch: Option<String>,
    pub merge_strategy: MergeStrategyConfig,
    pub remote: String,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            auto_push: false,
            auto_pr: false,
            auto_merge: false,
            pr_base_branch: None,
            merge_strategy: MergeStrategyConfig::Squash,
            remote: "origin".to_string(),
        }
    }
}

/// Per-agent rate limit: `(max_concurrent, acquire_timeout)`. Not named in
/// spec §6's enumerated option list, but required to construct a
/// [`RateLimiterRegistry`](crate::rate_limit::RateLimiterRegistry) per §5
/// "Rate limiters" — supplemented here, noted in DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRateLimit {
    pub max_concurrent: usize,
    #[serde(default, with = "duration_secs_opt")]
    pub acquire_timeout: Option<Duration>,
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_secs()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub dry_run: bool,
    pub sandbox: bool,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    pub default_agent: String,
    pub phase_timeouts: PhaseTimeouts,
    pub max_retries: u32,
    pub worktree_mode: WorktreeMode,
    pub worktree_auto_clean: bool,
    pub git_isolation: GitIsolationConfig,
    pub moderator: ModeratorConfig,
    #[serde(default)]
    pub plan_synthesizer: SynthesizerConfig,
    pub analyze_synthesizer: SynthesizerConfig,
    pub finalize: FinalizeConfig,
    #[serde(default)]
    pub agent_phase_models: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub agent_default_model: HashMap<String, String>,
    #[serde(default)]
    pub agent_rate_limits: HashMap<String, AgentRateLimit>,
    pub max_prompt_length: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            sandbox: true,
            deny_tools: Vec::new(),
            default_agent: "claude".to_string(),
            phase_timeouts: PhaseTimeouts::default(),
            max_retries: 3,
            worktree_mode: WorktreeMode::Always,
            worktree_auto_clean: true,
            git_isolation: GitIsolationConfig::default(),
            moderator: ModeratorConfig::default(),
            plan_synthesizer: SynthesizerConfig::default(),
            analyze_synthesizer: SynthesizerConfig::default(),
            finalize: FinalizeConfig::default(),
            agent_phase_models: HashMap::new(),
            agent_default_model: HashMap::new(),
            agent_rate_limits: HashMap::new(),
            max_prompt_length: 32_000,
        }
    }
}

impl WorkflowConfig {
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &std::path::Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Resolve the model for one agent invocation (spec §4.9), precedence
    /// `task_model > agent_phase_models[agent][phase] > agent_default_model[agent] > None`.
    pub fn resolve_phase_model(&self, agent: &str, phase: Phase, task_model: Option<&str>) -> Option<String> {
        if let Some(m) = task_model {
            if !m.trim().is_empty() {
                return Some(m.to_string());
            }
        }
        if let Some(m) = self
            .agent_phase_models
            .get(agent)
            .and_then(|by_phase| by_phase.get(&phase.to_string()))
        {
            return Some(m.clone());
        }
        self.agent_default_model.get(agent).cloned()
    }

    /// Validation checks the Runner performs before acquiring the workflow
    /// lock (spec §4.10 step 1).
    pub fn validate_prompt(&self, prompt: &str) -> ConfigResult<()> {
        if prompt.trim().is_empty() {
            return Err(ConfigError::Invalid {
                code: "EMPTY_PROMPT".to_string(),
                message: "workflow prompt must not be empty".to_string(),
            });
        }
        if prompt.len() > self.max_prompt_length {
            return Err(ConfigError::Invalid {
                code: "PROMPT_TOO_LONG".to_string(),
                message: format!(
                    "prompt is {} chars, exceeds max_prompt_length {}",
                    prompt.len(),
                    self.max_prompt_length
                ),
            });
        }
        Ok(())
    }
}
