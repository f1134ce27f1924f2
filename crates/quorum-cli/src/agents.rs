//! Subprocess-backed `Agent` implementations (spec §6) — one per configured
//! CLI tool (claude/gemini/codex/copilot by default), all sharing the same
//! invocation shape: `command [args...] [model_flag model] [json_flag] prompt`,
//! run via `tokio::process::Command`, stdout captured as the response and
//! exit status mapped to [`FinishReason`].

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use coordination::{AgentError, AgentResult, Capabilities, ExecuteRequest, ExecuteResult, Format, FinishReason};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::cli_config::AgentSpec;
use crate::shell_safety::validate_arg;

/// A configured CLI tool, wired to the engine's `Agent` trait.
pub struct CliAgent {
    spec: AgentSpec,
    extra_args: Vec<String>,
}

impl CliAgent {
    pub fn new(spec: AgentSpec, extra_args: Vec<String>) -> Self {
        Self { spec, extra_args }
    }

    fn build_args(&self, request: &ExecuteRequest) -> AgentResult<Vec<String>> {
        let mut args = self.spec.args.clone();
        args.extend(self.extra_args.clone());

        if let (Some(flag), Some(model)) = (&self.spec.model_flag, &request.model) {
            args.push(flag.clone());
            args.push(model.clone());
        }

        if matches!(request.format, Format::Json) {
            if let Some(flag) = &self.spec.json_flag {
                args.push(flag.clone());
            } else if !self.spec.supports_json {
                return Err(AgentError::Subprocess {
                    agent: self.spec.name.clone(),
                    message: "JSON output requested but this agent has no json_flag configured".to_string(),
                });
            }
        }

        for tool in &request.denied_tools {
            args.push("--deny-tool".to_string());
            args.push(tool.clone());
        }

        for arg in &args {
            validate_arg(arg).map_err(|e| AgentError::Subprocess {
                agent: self.spec.name.clone(),
                message: format!("refusing to invoke with unsafe argument: {e}"),
            })?;
        }

        Ok(args)
    }
}

#[async_trait]
impl coordination::Agent for CliAgent {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_json: self.spec.supports_json,
            supports_streaming: self.spec.supports_streaming,
            supports_tools: self.spec.supports_tools,
            supports_images: self.spec.supports_images,
            max_context_tokens: self.spec.max_context_tokens,
        }
    }

    async fn execute(&self, request: ExecuteRequest) -> AgentResult<ExecuteResult> {
        let args = self.build_args(&request)?;
        let prompt = request.prompt.clone();
        let timeout = request.timeout;
        let work_dir: PathBuf = request.work_dir.clone();

        let mut child = Command::new(&self.spec.command)
            .args(&args)
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Subprocess {
                agent: self.spec.name.clone(),
                message: format!("failed to spawn {}: {e}", self.spec.command),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt.as_bytes()).await;
        }

        let outcome = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AgentError::Subprocess {
                    agent: self.spec.name.clone(),
                    message: format!("waiting on {}: {e}", self.spec.command),
                })
            }
            Err(_) => {
                return Err(AgentError::Timeout {
                    agent: self.spec.name.clone(),
                    timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(AgentError::Subprocess {
                agent: self.spec.name.clone(),
                message: format!("{} exited with {:?}: {stderr}", self.spec.command, output.status.code()),
            });
        }

        let tokens_out = estimate_tokens(&stdout);
        Ok(ExecuteResult {
            output: stdout,
            model: request.model.clone(),
            tokens_in: estimate_tokens(&prompt),
            tokens_out,
            cost_usd: 0.0,
            finish_reason: FinishReason::Stop,
            tool_calls: Vec::new(),
        })
    }
}

/// No CLI tool's `output()` reports token counts without an extra API
/// round-trip this binary doesn't make; approximate at 4 chars/token, the
/// same rough ratio every model provider quotes for English prose.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

/// Builds the registry from `specs`, enabling each agent for the phases its
/// config names.
pub fn build_registry(
    default_agent: &str,
    specs: Vec<AgentSpec>,
    extra_args: Vec<String>,
) -> coordination::AgentRegistry {
    let mut registry = coordination::AgentRegistry::new(default_agent);
    for spec in specs {
        let phases: Vec<coordination::Phase> = spec.phases.iter().map(|p| (*p).into()).collect();
        let agent = std::sync::Arc::new(CliAgent::new(spec, extra_args.clone()));
        registry.register(agent, &phases);
    }
    registry
}
