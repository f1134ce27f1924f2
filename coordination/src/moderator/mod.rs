//! Semantic Moderator (spec §4.1) — evaluates one round of analyses and
//! decides whether consensus is reached.
//!
//! `Moderator::evaluate` wires together the rate limiter, the output
//! watchdog, the retry executor and file enforcement exactly the way the
//! Analyzer calls it: acquire a slot, launch the watchdog against the
//! round's attempt file, run the agent under retry with a stale-file/race
//! adoption path, fall back to writing stdout to disk if the agent didn't,
//! parse, validate, and promote the attempt file to the canonical round
//! file. Score parsing itself lives in [`parse`], kept separate since it is
//! pure and independently testable.

pub mod parse;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agent::{Agent, ExecuteRequest, Format};
use crate::control::Control;
use crate::file_enforce::verify_or_write_fallback;
use crate::rate_limit::RateLimiterRegistry;
use crate::report::{ReportPaths, ReportWriter};
use crate::retry::{retry, NoopNotify, RetryPolicy};
use crate::state::{ModeratorEvaluationResult, Phase};
use crate::watchdog::{OutputWatchdog, WatchdogConfig};

use self::parse::{parse_moderator_response, validate_output, ValidationOutcome};

#[derive(Debug, thiserror::Error)]
pub enum ModeratorError {
    #[error("rate limiter: {0}")]
    RateLimit(#[from] crate::rate_limit::RateLimitError),

    #[error("report writer: {0}")]
    Report(#[from] crate::report::ReportError),

    #[error("moderator agent {agent} exhausted all retries: {source}")]
    Exhausted {
        agent: String,
        source: crate::agent::AgentError,
    },

    #[error("moderator output failed validation: {0}")]
    InvalidOutput(String),

    #[error("workflow cancelled during moderation")]
    Cancelled,
}

pub type ModeratorResult<T> = Result<T, ModeratorError>;

/// Threshold configuration for one task-type bucket (spec §4.1 "Thresholds").
#[derive(Debug, Clone, Copy)]
pub struct ThresholdConfig {
    pub threshold: f64,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub abort_threshold: f64,
    pub stagnation_threshold: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            min_rounds: 1,
            max_rounds: 5,
            abort_threshold: 0.40,
            stagnation_threshold: 0.02,
        }
    }
}

/// Per-task-type threshold table with a deterministic keyword tie-break
/// order (spec §4.1: analysis|design|bugfix|refactor), falling back to the
/// default bucket when the prompt doesn't match any keyword.
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    pub default: ThresholdConfig,
    pub analysis: Option<ThresholdConfig>,
    pub design: Option<ThresholdConfig>,
    pub bugfix: Option<ThresholdConfig>,
    pub refactor: Option<ThresholdConfig>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            default: ThresholdConfig::default(),
            analysis: None,
            design: None,
            bugfix: None,
            refactor: None,
        }
    }
}

impl ThresholdTable {
    /// Selects a bucket for `prompt` by keyword, in the fixed priority order
    /// analysis, design, bugfix, refactor, so that a prompt matching more
    /// than one keyword resolves deterministically rather than by map
    /// iteration order.
    pub fn select(&self, prompt: &str) -> ThresholdConfig {
        let lower = prompt.to_lowercase();
        if lower.contains("analy") {
            if let Some(c) = self.analysis {
                return c;
            }
        }
        if lower.contains("design") {
            if let Some(c) = self.design {
                return c;
            }
        }
        if lower.contains("bug") || lower.contains("fix") {
            if let Some(c) = self.bugfix {
                return c;
            }
        }
        if lower.contains("refactor") {
            if let Some(c) = self.refactor {
                return c;
            }
        }
        self.default
    }
}

/// Outcome of a termination check after one round (spec §4.1 step 7).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoundOutcome {
    /// Score >= threshold and round >= min_rounds.
    Converged,
    /// Score < abort_threshold: escalate to human review.
    AbortForHumanReview,
    /// round >= max_rounds without converging: stop, take best effort.
    MaxRoundsReached,
    /// Improvement since the previous round is below stagnation_threshold.
    Stagnated,
    /// None of the above: run another refinement round.
    Continue,
}

/// Decide what happens after round `round` scored `score`, given the
/// previous round's score (`None` for round 1).
pub fn check_termination(
    config: &ThresholdConfig,
    round: u32,
    score: f64,
    previous_score: Option<f64>,
) -> RoundOutcome {
    if score < config.abort_threshold {
        return RoundOutcome::AbortForHumanReview;
    }
    if score >= config.threshold && round >= config.min_rounds {
        return RoundOutcome::Converged;
    }
    if round >= config.max_rounds {
        return RoundOutcome::MaxRoundsReached;
    }
    if let Some(prev) = previous_score {
        if (score - prev).abs() < config.stagnation_threshold {
            return RoundOutcome::Stagnated;
        }
    }
    RoundOutcome::Continue
}

/// Evaluates one moderation round by invoking `agent` over `outputs`
/// (spec §4.1 steps 1-7).
pub struct Moderator<W: ReportWriter + ReportPaths> {
    agent: Arc<dyn Agent>,
    limiters: RateLimiterRegistry,
    writer: Arc<W>,
    retry_policy: RetryPolicy,
    watchdog_config: WatchdogConfig,
}

impl<W: ReportWriter + ReportPaths> Moderator<W> {
    pub fn new(
        agent: Arc<dyn Agent>,
        limiters: RateLimiterRegistry,
        writer: Arc<W>,
        retry_policy: RetryPolicy,
        watchdog_config: WatchdogConfig,
    ) -> Self {
        Self {
            agent,
            limiters,
            writer,
            retry_policy,
            watchdog_config,
        }
    }

    /// Run one evaluation round. `prompt` is the already-rendered moderator
    /// prompt; `round` and `attempt` select the on-disk attempt path, which
    /// is promoted to the canonical `round-N.md` file on success.
    pub async fn evaluate(
        &self,
        control: &Control,
        prompt: String,
        round: u32,
        attempt: u32,
        work_dir: std::path::PathBuf,
        timeout: Duration,
    ) -> ModeratorResult<ModeratorEvaluationResult> {
        control.check_cancelled().map_err(|_| ModeratorError::Cancelled)?;
        let started_at = std::time::Instant::now();

        let attempt_path = self.writer.moderator_attempt_path(round, attempt, self.agent.name());
        let round_path = self.writer.moderator_round_path(round);

        let mut watchdog = OutputWatchdog::new(attempt_path.clone(), self.watchdog_config);
        let mut stable_rx = watchdog.start();

        let limiter = self.limiters.get(self.agent.name())?;
        let agent = self.agent.clone();
        let attempt_path_for_op = attempt_path.clone();
        let prompt_for_op = prompt.clone();
        let work_dir_for_op = work_dir.clone();

        let execute_once = move |_n: u32| {
            let agent = agent.clone();
            let limiter = limiter.clone();
            let attempt_path = attempt_path_for_op.clone();
            let prompt = prompt_for_op.clone();
            let work_dir = work_dir_for_op.clone();
            async move {
                // A prior attempt may have crashed or lost its `wait` after the
                // agent process had already written its output file. Adopt it
                // instead of burning another attempt on a fresh subprocess.
                if let Ok(metadata) = tokio::fs::metadata(&attempt_path).await {
                    if metadata.len() > 1024 {
                        if let Ok(stale) = tokio::fs::read_to_string(&attempt_path).await {
                            warn!(
                                agent = agent.name(),
                                path = %attempt_path.display(),
                                "found existing moderator output before executing; adopting stale file"
                            );
                            return Ok((
                                crate::agent::ExecuteResult {
                                    output: stale,
                                    model: None,
                                    tokens_in: 0,
                                    tokens_out: 0,
                                    cost_usd: 0.0,
                                    finish_reason: crate::agent::FinishReason::Stop,
                                    tool_calls: Vec::new(),
                                },
                                attempt_path,
                            ));
                        }
                    }
                }

                let _permit = limiter.acquire(agent.name()).await.map_err(|e| {
                    crate::agent::AgentError::Subprocess {
                        agent: agent.name().to_string(),
                        message: e.to_string(),
                    }
                })?;
                let request = ExecuteRequest {
                    prompt,
                    format: Format::Text,
                    model: None,
                    timeout,
                    sandbox: true,
                    denied_tools: Vec::new(),
                    work_dir,
                    phase: Phase::Analyze,
                };
                agent.execute(request).await.map(|result| (result, attempt_path))
            }
        };

        let race = tokio::select! {
            result = retry(control, &self.retry_policy, NoopNotify, execute_once) => {
                RaceOutcome::Agent(result)
            }
            Some(stable_content) = stable_rx.recv() => {
                RaceOutcome::WatchdogStable(stable_content)
            }
        };
        watchdog.stop();

        let (raw_text, tokens_in, tokens_out) = match race {
            RaceOutcome::Agent(Ok((result, _path))) => (result.output, result.tokens_in, result.tokens_out),
            RaceOutcome::Agent(Err(e)) => {
                return Err(ModeratorError::Exhausted {
                    agent: self.agent.name().to_string(),
                    source: match e {
                        crate::retry::RetryError::Cancelled => {
                            return Err(ModeratorError::Cancelled);
                        }
                        crate::retry::RetryError::Exhausted { source, .. } => source,
                    },
                });
            }
            RaceOutcome::WatchdogStable(content) => {
                warn!(
                    agent = self.agent.name(),
                    round, "moderator output stabilized before the agent exited; adopting stale file"
                );
                // The watchdog detected stability from file size alone, not
                // from the agent's own completion report, so there is no
                // token count to attribute here.
                (content, 0, 0)
            }
        };

        let wrote_fallback = verify_or_write_fallback(&attempt_path, &raw_text).await?;
        if wrote_fallback {
            info!(path = %attempt_path.display(), "moderator agent printed to stdout; wrote fallback file");
        }
        let on_disk = self.writer.read(&attempt_path).await?;

        let score = parse::parse_score(&on_disk);
        match validate_output(&on_disk, &score) {
            ValidationOutcome::Valid => {}
            ValidationOutcome::Invalid(reason) => return Err(ModeratorError::InvalidOutput(reason)),
        }

        self.writer.write(&round_path, &on_disk).await?;

        let mut result = parse_moderator_response(&on_disk);
        result.tokens_in = tokens_in;
        result.tokens_out = tokens_out;
        result.duration = started_at.elapsed();
        Ok(result)
    }
}

enum RaceOutcome {
    Agent(Result<(crate::agent::ExecuteResult, std::path::PathBuf), crate::retry::RetryError<crate::agent::AgentError>>),
    WatchdogStable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentResult, Capabilities, ExecuteResult, FinishReason};
    use crate::report::{FsReportWriter, ReportPaths};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    struct FakeModeratorAgent {
        response: String,
    }

    #[async_trait]
    impl Agent for FakeModeratorAgent {
        fn name(&self) -> &str {
            "claude"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_tools: false,
                supports_images: false,
                max_context_tokens: 100_000,
            }
        }
        async fn execute(&self, _request: ExecuteRequest) -> AgentResult<ExecuteResult> {
            Ok(ExecuteResult {
                output: self.response.clone(),
                model: None,
                tokens_in: 10,
                tokens_out: 20,
                cost_usd: 0.0,
                finish_reason: FinishReason::Stop,
                tool_calls: vec![],
            })
        }
    }

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

    #[test]
    fn threshold_table_selects_by_keyword_priority() {
        let mut table = ThresholdTable::default();
        table.analysis = Some(ThresholdConfig {
            threshold: 0.9,
            ..ThresholdConfig::default()
        });
        table.bugfix = Some(ThresholdConfig {
            threshold: 0.7,
            ..ThresholdConfig::default()
        });
        // Matches both "analy" and "fix" keywords; analysis wins by priority order.
        let selected = table.select("please analyze and fix this bug");
        assert_eq!(selected.threshold, 0.9);
    }

    #[test]
    fn termination_checks_in_spec_order() {
        let config = ThresholdConfig {
            threshold: 0.85,
            min_rounds: 2,
            max_rounds: 4,
            abort_threshold: 0.4,
            stagnation_threshold: 0.02,
        };
        assert_eq!(check_termination(&config, 1, 0.3, None), RoundOutcome::AbortForHumanReview);
        assert_eq!(check_termination(&config, 1, 0.9, None), RoundOutcome::Continue); // below min_rounds
        assert_eq!(check_termination(&config, 2, 0.9, Some(0.6)), RoundOutcome::Converged);
        assert_eq!(check_termination(&config, 4, 0.5, Some(0.48)), RoundOutcome::MaxRoundsReached);
        assert_eq!(check_termination(&config, 3, 0.6, Some(0.59)), RoundOutcome::Stagnated);
    }

    #[tokio::test]
    async fn evaluate_parses_and_promotes_round_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(Layout {
            run_dir: dir.path().to_path_buf(),
        });
        let response = "## Agreements\n- agree on scope\n\n## Divergences\n- none\n\n\
                         **CONSENSUS_SCORE:** 88%\n\nThis moderator response is long enough to pass \
                         the minimum length validation comfortably with room to spare.";
        let agent: Arc<dyn Agent> = Arc::new(FakeModeratorAgent {
            response: response.to_string(),
        });
        let limiters = RateLimiterRegistry::new(vec![("claude".to_string(), 2, None)]);
        let moderator = Moderator::new(
            agent,
            limiters,
            layout.clone(),
            RetryPolicy {
                max_attempts: 1,
                backoff: crate::retry::Backoff::Fixed(Duration::from_millis(1)),
            },
            WatchdogConfig {
                poll_interval: Duration::from_secs(60),
                stability_window: Duration::from_secs(60),
                min_file_size: u64::MAX,
            },
        );
        let control = Control::new();
        let result = moderator
            .evaluate(&control, "evaluate these".to_string(), 1, 1, dir.path().to_path_buf(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!((result.score - 0.88).abs() < 1e-9);
        assert_eq!(result.agreements, vec!["agree on scope"]);
        assert!(layout.exists(&layout.moderator_round_path(1)).await);
    }
}
