//! Analyzer — orchestrates the V1 fan-out, the always-run V2 refinement,
//! the moderator-driven refinement loop, and consolidation (spec §4.2).
//!
//! Only the moderator-loop flow is implemented; V1/V2/V3 names are retained
//! purely as round labels, per spec §9 Open Questions ("implement ONLY the
//! moderator-loop flow").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::agent::{AgentRegistry, ExecuteRequest, Format};
use crate::config::WorkflowConfig;
use crate::control::Control;
use crate::error::{PhaseError, PhaseResult};
use crate::moderator::{check_termination, Moderator, RoundOutcome};
use crate::prompts::{PromptParams, PromptRenderer, PromptVariant};
use crate::rate_limit::RateLimiterRegistry;
use crate::report::{ReportPaths, ReportWriter};
use crate::retry::{retry, NoopNotify, RetryPolicy};
use crate::state::{
    AnalysisCheckpointMetadata, AnalysisOutput, Checkpoint, Phase, WorkflowState,
};

/// Per-field item caps applied to the consolidation prompt (spec §4.2 step
/// 6 "20/15/15").
const MAX_CLAIMS_PER_INPUT: usize = 20;
const MAX_RISKS_PER_INPUT: usize = 15;
const MAX_RECOMMENDATIONS_PER_INPUT: usize = 15;
/// Max raw chars of each agent's analysis fed to the synthesizer.
const MAX_CHARS_PER_INPUT: usize = 80_000;

pub struct Analyzer<W: ReportWriter + ReportPaths> {
    agents: Arc<AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    writer: Arc<W>,
    moderator: Moderator<W>,
    limiters: RateLimiterRegistry,
    retry_policy: RetryPolicy,
    config: WorkflowConfig,
}

impl<W: ReportWriter + ReportPaths + 'static> Analyzer<W> {
    pub fn new(
        agents: Arc<AgentRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        writer: Arc<W>,
        moderator: Moderator<W>,
        limiters: RateLimiterRegistry,
        retry_policy: RetryPolicy,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            agents,
            renderer,
            writer,
            moderator,
            limiters,
            retry_policy,
            config,
        }
    }

    /// Cheap clone bundle so a fanned-out per-agent future owns its own
    /// handles without borrowing `&self` across the `.await` inside
    /// `tokio::spawn` (mirrors `Executor::clone_shared`).
    fn clone_shared(&self) -> AnalyzerHandles<W> {
        AnalyzerHandles {
            agents: self.agents.clone(),
            renderer: self.renderer.clone(),
            writer: self.writer.clone(),
            limiters: self.limiters.clone(),
            retry_policy: self.retry_policy.clone(),
            config: self.config.clone(),
        }
    }

    /// Runs `agent_names` for one round concurrently (spec §4.2 step 3:
    /// "query every agent enabled for the analyze phase in parallel").
    /// Sibling failures are logged and drop that agent from the round
    /// rather than cancelling the others. Checkpoints produced by cache
    /// misses are appended to `state` in task-completion order once every
    /// spawned future has joined, since `WorkflowState` isn't `Send`-shared
    /// across the concurrent futures themselves.
    #[allow(clippy::too_many_arguments)]
    async fn run_round(
        &self,
        control: &Control,
        state: &mut WorkflowState,
        agent_names: impl IntoIterator<Item = &str>,
        round: u32,
        previous: &HashMap<String, AnalysisOutput>,
        agreements: &[String],
        divergences: &[String],
        missing_perspectives: &[String],
        warn_context: &'static str,
    ) -> HashMap<String, AnalysisOutput> {
        let prompt = state.definition.prompt.clone();
        let checkpoints = state.run.checkpoints.clone();

        let mut handles = Vec::new();
        for agent_name in agent_names {
            let agent_name = agent_name.to_string();
            let this = self.clone_shared();
            let control = control.clone();
            let prompt = prompt.clone();
            let checkpoints = checkpoints.clone();
            let previous_output = previous.get(&agent_name).cloned();
            let agreements = agreements.to_vec();
            let divergences = divergences.to_vec();
            let missing_perspectives = missing_perspectives.to_vec();
            handles.push(tokio::spawn(async move {
                let result = this
                    .run_one(
                        &control,
                        &prompt,
                        &checkpoints,
                        &agent_name,
                        round,
                        previous_output.as_ref(),
                        &agreements,
                        &divergences,
                        &missing_perspectives,
                    )
                    .await;
                (agent_name, result)
            }));
        }

        let mut outputs = HashMap::new();
        for handle in handles {
            let (agent_name, result) = match handle.await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "analysis task panicked");
                    continue;
                }
            };
            match result {
                Ok((output, checkpoint)) => {
                    if let Some(checkpoint) = checkpoint {
                        state.append_checkpoint(checkpoint);
                    }
                    state.run.metrics.total_tokens_in += output.tokens_in;
                    state.run.metrics.total_tokens_out += output.tokens_out;
                    state.run.metrics.total_cost_usd += output.cost_usd;
                    outputs.insert(agent_name, output);
                }
                Err(e) => warn!(agent = agent_name, round, error = %e, "{}", warn_context),
            }
        }
        outputs
    }

    pub async fn run(&self, control: &Control, state: &mut WorkflowState) -> PhaseResult<()> {
        if state.phase_complete(Phase::Analyze) {
            return Ok(());
        }

        if !self.config.moderator.enabled || self.config.moderator.agent.is_none() {
            return Err(PhaseError::validation(
                "MISSING_MODERATOR_AGENT",
                "moderator must be enabled and configured with an agent",
            ));
        }
        if self.config.analyze_synthesizer.agent.is_none() {
            return Err(PhaseError::validation(
                "MISSING_SYNTHESIZER_AGENT",
                "phases.analyze.synthesizer.agent has no configured default and must be set explicitly",
            ));
        }

        state.append_checkpoint(Checkpoint::new(Phase::Analyze, "phase_start", serde_json::json!({})));

        let agent_names: Vec<String> = self.agents.enabled_for(Phase::Analyze).to_vec();

        // --- V1 fan-out ---
        control.check_cancelled().map_err(|_| PhaseError::Cancelled)?;
        let outputs = self
            .run_round(
                control,
                state,
                agent_names.iter().map(String::as_str),
                1,
                &HashMap::new(),
                &[],
                &[],
                &[],
                "V1 analysis failed, continuing with remaining agents",
            )
            .await;

        let required = if agent_names.len() <= 1 { agent_names.len() } else { 2 };
        if outputs.len() < required {
            return Err(PhaseError::Partial {
                got: outputs.len(),
                need: required,
            });
        }

        // --- V2 refinement (always runs before any moderator call) ---
        control.check_cancelled().map_err(|_| PhaseError::Cancelled)?;
        let mut round = 2u32;
        let agent_names_v1: Vec<&str> = outputs.keys().map(String::as_str).collect();
        let mut current = self
            .run_round(
                control,
                state,
                agent_names_v1,
                round,
                &outputs,
                &[],
                &[],
                &[],
                "V2 refinement failed, agent drops out of this round",
            )
            .await;
        if current.is_empty() {
            return Err(PhaseError::Partial { got: 0, need: 1 });
        }

        // --- Moderator loop ---
        let threshold_table = self.config.moderator.threshold_table();
        let thresholds = threshold_table.select(&state.definition.prompt);
        let mut previous_score: Option<f64> = None;
        let mut last_result = None;

        loop {
            control.check_cancelled().map_err(|_| PhaseError::Cancelled)?;
            let values: Vec<AnalysisOutput> = current.values().cloned().collect();
            let prompt = self.render_moderator_prompt(round, &values);
            let work_dir = self.writer.run_dir().to_path_buf();
            let timeout = self.config.phase_timeouts.analyze;

            let result = self
                .moderator
                .evaluate(control, prompt, round, 1, work_dir, timeout)
                .await
                .map_err(|e| PhaseError::Execution(format!("moderator round {round}: {e}")))?;

            state.run.metrics.consensus_score = Some(result.score);
            state.run.metrics.total_tokens_in += result.tokens_in;
            state.run.metrics.total_tokens_out += result.tokens_out;
            state.append_checkpoint(Checkpoint::new(
                Phase::Analyze,
                "consensus",
                serde_json::json!({
                    "round": round,
                    "score": result.score,
                    "agreements": result.agreements,
                    "divergences": result.divergences,
                }),
            ));

            let outcome = check_termination(&thresholds, round, result.score, previous_score);
            info!(round, score = result.score, ?outcome, "moderator round evaluated");

            match outcome {
                RoundOutcome::Converged | RoundOutcome::MaxRoundsReached | RoundOutcome::Stagnated => {
                    last_result = Some(result);
                    break;
                }
                RoundOutcome::AbortForHumanReview => {
                    return Err(PhaseError::HumanReviewRequired {
                        score: result.score,
                        threshold: thresholds.abort_threshold,
                    });
                }
                RoundOutcome::Continue => {
                    previous_score = Some(result.score);
                    round += 1;
                    let agent_names: Vec<&str> = current.keys().map(String::as_str).collect();
                    let next_round = self
                        .run_round(
                            control,
                            state,
                            agent_names,
                            round,
                            &current,
                            &result.agreements,
                            &result.divergences,
                            &result.missing_perspectives,
                            "refinement round failed",
                        )
                        .await;
                    if next_round.is_empty() {
                        // Nothing refined further; take the last moderator
                        // result as best-effort rather than looping forever.
                        last_result = Some(result);
                        break;
                    }
                    current = next_round;
                }
            }
        }
        let final_score = last_result.as_ref().map(|r| r.score);

        // --- Consolidation ---
        let consolidated = self.consolidate(control, state, &current).await?;
        self.writer
            .write(&self.writer.consolidated_analysis_path(), &consolidated.content)
            .await
            .map_err(|e| PhaseError::Execution(e.to_string()))?;

        state.append_checkpoint(Checkpoint::new(
            Phase::Analyze,
            "consolidated_analysis",
            serde_json::json!({
                "content": consolidated.content,
                "agent_count": current.len(),
                "synthesized": consolidated.synthesized,
                "agent": consolidated.agent,
                "model": consolidated.model,
                "tokens_in": consolidated.tokens_in,
                "tokens_out": consolidated.tokens_out,
                "final_consensus_score": final_score,
            }),
        ));

        state.append_checkpoint(Checkpoint::new(Phase::Analyze, "analysis_complete", serde_json::json!({})));
        state.append_checkpoint(Checkpoint::new(Phase::Analyze, "phase_complete", serde_json::json!({})));
        Ok(())
    }

    fn render_moderator_prompt(&self, round: u32, outputs: &[AnalysisOutput]) -> String {
        let paths: Vec<String> = outputs
            .iter()
            .map(|o| {
                if round == 1 {
                    self.writer.v1_analysis_path(&o.agent_name, o.model.as_deref().unwrap_or_default())
                } else {
                    self.writer.vn_analysis_path(&o.agent_name, o.model.as_deref().unwrap_or_default(), round)
                }
                .display()
                .to_string()
            })
            .collect();
        let params = PromptParams::new()
            .with_list("analysis_file_paths", paths)
            .with_output_file(self.writer.moderator_attempt_path(round, 1, "moderator"));
        self.renderer
            .render(PromptVariant::ModeratorEvaluate, &params)
            .unwrap_or_else(|_| format!("Evaluate round {round} analyses."))
    }

    async fn consolidate(
        &self,
        control: &Control,
        state: &mut WorkflowState,
        outputs: &HashMap<String, AnalysisOutput>,
    ) -> PhaseResult<Consolidated> {
        let synthesizer = self.config.analyze_synthesizer.agent.clone().expect("checked at entry");
        let agent = self.agents.get(&synthesizer);

        let summaries: Vec<String> = outputs
            .values()
            .map(|o| truncate_summary(o))
            .collect();

        let result = match agent {
            Some(agent) => {
                let limiter = self.limiters.get(&synthesizer);
                match limiter {
                    Ok(limiter) => {
                        let permit = limiter.acquire(&synthesizer).await;
                        match permit {
                            Ok(_permit) => {
                                let params = PromptParams::new()
                                    .with_string("prompt", state.definition.prompt.clone())
                                    .with_list("analyses", summaries.clone())
                                    .with_output_file(self.writer.consolidated_analysis_path());
                                match self.renderer.render(PromptVariant::SynthesizeAnalysis, &params) {
                                    Ok(rendered) => {
                                        let request = ExecuteRequest {
                                            prompt: rendered,
                                            format: Format::Text,
                                            model: self.config.resolve_phase_model(&synthesizer, Phase::Analyze, None),
                                            timeout: self.config.phase_timeouts.analyze,
                                            sandbox: self.config.sandbox,
                                            denied_tools: self.config.deny_tools.clone(),
                                            work_dir: self.writer.run_dir().to_path_buf(),
                                            phase: Phase::Analyze,
                                        };
                                        match retry(control, &self.retry_policy, NoopNotify, move |_n| {
                                            let agent = agent.clone();
                                            let req = request.clone();
                                            async move { agent.execute(req).await }
                                        })
                                        .await
                                        {
                                            Ok(res) => Some(Consolidated {
                                                content: res.output,
                                                synthesized: true,
                                                agent: Some(synthesizer.clone()),
                                                model: res.model,
                                                tokens_in: res.tokens_in,
                                                tokens_out: res.tokens_out,
                                            }),
                                            Err(_) => None,
                                        }
                                    }
                                    Err(_) => None,
                                }
                            }
                            Err(_) => None,
                        }
                    }
                    Err(_) => None,
                }
            }
            None => None,
        };

        Ok(result.unwrap_or_else(|| {
            // Fallback to concatenation (spec §4.2 step 6: only when the
            // synthesizer errors at rate-limit or render stages).
            warn!("synthesizer unavailable, falling back to concatenated analyses");
            let content = summaries.join("\n\n---\n\n");
            Consolidated {
                content,
                synthesized: false,
                agent: None,
                model: None,
                tokens_in: 0,
                tokens_out: 0,
            }
        }))
    }
}

/// Everything a fanned-out per-agent future needs, cloned out of the
/// `Analyzer` so each agent's attempt is independent of its siblings
/// (spec §4.2 step 3: sibling failure drops that agent, not the round).
struct AnalyzerHandles<W: ReportWriter + ReportPaths> {
    agents: Arc<AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    writer: Arc<W>,
    limiters: RateLimiterRegistry,
    retry_policy: RetryPolicy,
    config: WorkflowConfig,
}

impl<W: ReportWriter + ReportPaths + 'static> AnalyzerHandles<W> {
    /// Run one agent for one round, honoring the resume cache (spec §4.2
    /// "Caching on resume"): if a prior `analysis_complete` checkpoint
    /// matches `{agent, round, prompt_hash}` and the on-disk content hash
    /// still matches, reconstruct without calling the agent. Returns the
    /// checkpoint to append on a cache miss; `None` on a cache hit, since
    /// the checkpoint that produced it is already in `checkpoints`.
    #[allow(clippy::too_many_arguments)]
    async fn run_one(
        &self,
        control: &Control,
        prompt: &str,
        checkpoints: &[Checkpoint],
        agent_name: &str,
        round: u32,
        previous: Option<&AnalysisOutput>,
        agreements: &[String],
        divergences: &[String],
        missing_perspectives: &[String],
    ) -> PhaseResult<(AnalysisOutput, Option<Checkpoint>)> {
        control.check_cancelled().map_err(|_| PhaseError::Cancelled)?;

        let agent = self
            .agents
            .get(agent_name)
            .ok_or_else(|| PhaseError::validation("UNKNOWN_AGENT", format!("agent {agent_name:?} not registered")))?;
        let model = self
            .config
            .resolve_phase_model(agent_name, Phase::Analyze, None)
            .unwrap_or_default();

        let variant = if round == 1 { PromptVariant::AnalyzeV1 } else { PromptVariant::VnRefine };
        let mut params = PromptParams::new()
            .with_string("prompt", prompt.to_string())
            .with_string("round", round.to_string())
            .with_string("has_arbiter", (round > 2).to_string());
        if let Some(prev) = previous {
            params = params.with_string("previous_analysis", prev.raw_output.clone());
        }
        if !agreements.is_empty() {
            params = params.with_list("agreements", agreements.to_vec());
        }
        if !divergences.is_empty() {
            params = params.with_list("divergences", divergences.to_vec());
        }
        if !missing_perspectives.is_empty() {
            params = params.with_list("missing_perspectives", missing_perspectives.to_vec());
        }

        let prompt_hash = hash_prompt(prompt, previous, round, agent_name);
        let file_path = if round == 1 {
            self.writer.v1_analysis_path(agent_name, &model)
        } else {
            self.writer.vn_analysis_path(agent_name, &model, round)
        };

        if let Some(cached) = self.cached_output(checkpoints, agent_name, round, &prompt_hash, &file_path).await {
            return Ok((cached, None));
        }

        params = params.with_output_file(file_path.clone());
        let rendered = self
            .renderer
            .render(variant, &params)
            .map_err(|e| PhaseError::Execution(e.to_string()))?;

        let limiter = self.limiters.get(agent_name).map_err(|e| PhaseError::Execution(e.to_string()))?;
        let work_dir = self.writer.run_dir().to_path_buf();
        let request = ExecuteRequest {
            prompt: rendered,
            format: Format::Text,
            model: Some(model.clone()).filter(|m| !m.is_empty()),
            timeout: self.config.phase_timeouts.analyze,
            sandbox: self.config.sandbox,
            denied_tools: self.config.deny_tools.clone(),
            work_dir,
            phase: Phase::Analyze,
        };

        let started = Instant::now();
        let agent_for_op = agent.clone();
        let request_for_op = request.clone();
        let _permit = limiter.acquire(agent_name).await.map_err(|e| PhaseError::Execution(e.to_string()))?;
        let result = retry(control, &self.retry_policy, NoopNotify, move |_n| {
            let agent = agent_for_op.clone();
            let req = request_for_op.clone();
            async move { agent.execute(req).await }
        })
        .await
        .map_err(|e| PhaseError::Execution(format!("agent {agent_name} exhausted retries: {e}")))?;
        let duration = started.elapsed();

        self.writer
            .write(&file_path, &result.output)
            .await
            .map_err(|e| PhaseError::Execution(e.to_string()))?;

        let content_hash = hash_bytes(result.output.as_bytes());
        let checkpoint = Checkpoint::new(
            Phase::Analyze,
            "analysis_complete",
            serde_json::to_value(AnalysisCheckpointMetadata {
                agent_name: agent_name.to_string(),
                model: Some(model.clone()).filter(|m| !m.is_empty()),
                round,
                file_path: file_path.clone(),
                prompt_hash,
                tokens_in: result.tokens_in,
                tokens_out: result.tokens_out,
                duration_ms: duration.as_millis() as u64,
                content_hash,
            })
            .expect("AnalysisCheckpointMetadata always serializes"),
        );

        let claims = extract_list(&result.output, "Claims");
        let risks = extract_list(&result.output, "Risks");
        let recommendations = extract_list(&result.output, "Recommendations");

        Ok((
            AnalysisOutput {
                agent_name: if round == 1 { agent_name.to_string() } else { format!("v{round}-{agent_name}") },
                model: Some(model).filter(|m| !m.is_empty()),
                raw_output: result.output,
                claims,
                risks,
                recommendations,
                tokens_in: result.tokens_in,
                tokens_out: result.tokens_out,
                cost_usd: result.cost_usd,
                duration,
            },
            Some(checkpoint),
        ))
    }

    async fn cached_output(
        &self,
        checkpoints: &[Checkpoint],
        agent_name: &str,
        round: u32,
        prompt_hash: &str,
        expected_path: &std::path::Path,
    ) -> Option<AnalysisOutput> {
        let metadata = checkpoints
            .iter()
            .rev()
            .filter(|c| c.phase == Phase::Analyze && c.kind == "analysis_complete")
            .filter_map(|c| serde_json::from_value::<AnalysisCheckpointMetadata>(c.data.clone()).ok())
            .find(|m| m.agent_name == agent_name && m.round == round && m.prompt_hash == prompt_hash)?;

        if metadata.file_path != expected_path {
            return None;
        }
        let content = self.writer.read(&metadata.file_path).await.ok()?;
        if hash_bytes(content.as_bytes()) != metadata.content_hash {
            return None;
        }
        info!(agent = agent_name, round, "reusing cached analysis on resume");
        Some(AnalysisOutput {
            agent_name: if round == 1 { agent_name.to_string() } else { format!("v{round}-{agent_name}") },
            model: metadata.model,
            claims: extract_list(&content, "Claims"),
            risks: extract_list(&content, "Risks"),
            recommendations: extract_list(&content, "Recommendations"),
            raw_output: content,
            tokens_in: metadata.tokens_in,
            tokens_out: metadata.tokens_out,
            cost_usd: 0.0,
            duration: Duration::from_millis(metadata.duration_ms),
        })
    }
}

struct Consolidated {
    content: String,
    synthesized: bool,
    agent: Option<String>,
    model: Option<String>,
    tokens_in: u64,
    tokens_out: u64,
}

fn truncate_summary(output: &AnalysisOutput) -> String {
    let claims: Vec<&String> = output.claims.iter().take(MAX_CLAIMS_PER_INPUT).collect();
    let risks: Vec<&String> = output.risks.iter().take(MAX_RISKS_PER_INPUT).collect();
    let recs: Vec<&String> = output.recommendations.iter().take(MAX_RECOMMENDATIONS_PER_INPUT).collect();

    if !claims.is_empty() || !risks.is_empty() || !recs.is_empty() {
        let mut text = format!("### {}\n", output.agent_name);
        if !claims.is_empty() {
            text.push_str("Claims:\n");
            for c in claims {
                text.push_str(&format!("- {c}\n"));
            }
        }
        if !risks.is_empty() {
            text.push_str("Risks:\n");
            for r in risks {
                text.push_str(&format!("- {r}\n"));
            }
        }
        if !recs.is_empty() {
            text.push_str("Recommendations:\n");
            for r in recs {
                text.push_str(&format!("- {r}\n"));
            }
        }
        text
    } else {
        let mut raw = output.raw_output.clone();
        raw.truncate(MAX_CHARS_PER_INPUT);
        format!("### {}\n{}", output.agent_name, raw)
    }
}

fn extract_list(text: &str, header: &str) -> Vec<String> {
    crate::moderator::parse::extract_section(text, header)
}

fn hash_prompt(prompt: &str, previous: Option<&AnalysisOutput>, round: u32, agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    if let Some(prev) = previous {
        hasher.update(prev.raw_output.as_bytes());
    }
    hasher.update(round.to_le_bytes());
    hasher.update(agent.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_prompt_is_deterministic_and_sensitive_to_inputs() {
        let a = hash_prompt("do the thing", None, 1, "claude");
        let b = hash_prompt("do the thing", None, 1, "claude");
        let c = hash_prompt("do the thing", None, 2, "claude");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn truncate_summary_caps_item_counts() {
        let output = AnalysisOutput {
            agent_name: "claude".to_string(),
            model: None,
            raw_output: String::new(),
            claims: (0..30).map(|i| format!("claim {i}")).collect(),
            risks: vec![],
            recommendations: vec![],
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            duration: Duration::ZERO,
        };
        let summary = truncate_summary(&output);
        assert_eq!(summary.matches("claim ").count(), MAX_CLAIMS_PER_INPUT);
    }
}
