//! Minimal concrete `PromptRenderer` (spec §6) — turns the engine's
//! structured [`PromptParams`] into a plain-text prompt per variant so the
//! workspace runs end to end without an external template store.

use coordination::{PromptError, PromptParams, PromptRenderer, PromptResult, PromptVariant};

pub struct TemplateRenderer;

impl PromptRenderer for TemplateRenderer {
    fn render(&self, variant: PromptVariant, params: &PromptParams) -> PromptResult<String> {
        let require = |key: &str| -> PromptResult<&str> {
            params
                .strings
                .get(key)
                .map(|s| s.as_str())
                .ok_or_else(|| PromptError::MissingParam(key.to_string(), variant))
        };

        let mut out = String::new();
        match variant {
            PromptVariant::AnalyzeV1 => {
                out.push_str("# Analysis request\n\n");
                out.push_str(require("prompt")?);
                out.push_str("\n\nProvide your independent analysis: claims, risks and recommendations, each under its own markdown header.\n");
            }
            PromptVariant::AnalyzeV2 | PromptVariant::VnRefine => {
                out.push_str("# Analysis refinement (round ");
                out.push_str(require("round")?);
                out.push_str(")\n\n");
                out.push_str(require("prompt")?);
                out.push('\n');
                if let Some(prev) = params.strings.get("previous_analysis") {
                    out.push_str("\n## Your previous analysis\n\n");
                    out.push_str(prev);
                    out.push('\n');
                }
                push_list(&mut out, "## Agreements so far", params.string_lists.get("agreements"));
                push_list(&mut out, "## Open divergences", params.string_lists.get("divergences"));
                push_list(&mut out, "## Perspectives not yet covered", params.string_lists.get("missing_perspectives"));
                if params.strings.get("has_arbiter").map(|s| s == "true").unwrap_or(false) {
                    out.push_str("\nYou are acting as an arbiter: reconcile the divergences above with a final position.\n");
                }
            }
            PromptVariant::ModeratorEvaluate => {
                out.push_str("# Consensus evaluation\n\n");
                out.push_str("Read the analyses at the paths below and score agreement from 0 to 100.\n\n");
                push_list(&mut out, "## Analysis files", params.string_lists.get("analysis_file_paths"));
                out.push_str("\nRespond with `## Agreements`, `## Divergences`, and a line `**CONSENSUS_SCORE:** <0-100>%`.\n");
            }
            PromptVariant::SynthesizeAnalysis => {
                out.push_str("# Consolidate analyses\n\n");
                out.push_str(require("prompt")?);
                out.push('\n');
                push_list(&mut out, "## Analyses to merge", params.string_lists.get("analyses"));
                out.push_str("\nProduce one consolidated analysis covering every claim, risk and recommendation worth keeping.\n");
            }
            PromptVariant::PlanComprehensive | PromptVariant::PlanGenerate => {
                out.push_str("# Produce a task plan\n\n");
                out.push_str(require("prompt")?);
                out.push_str("\n\n## Consolidated analysis\n\n");
                out.push_str(require("consolidated_analysis")?);
                out.push_str(
                    "\n\nRespond with a JSON object: \
                     {\"tasks\":[{\"id\":str,\"name\":str,\"file\":str,\"dependencies\":[str],\"complexity\":str|null,\"cli\":str|null}],\
                     \"execution_levels\":[[str]]}. Write one markdown spec file per task under the tasks directory.\n",
                );
            }
            PromptVariant::SynthesizePlans => {
                out.push_str("# Reconcile candidate plans\n\n");
                push_list(&mut out, "## Candidate plans", params.string_lists.get("plans"));
                out.push_str("\nMerge these into one dependency-consistent task plan, in the same JSON shape each candidate used.\n");
            }
            PromptVariant::TaskExecute => {
                out.push_str("# Implement this task\n\n");
                out.push_str(require("prompt")?);
                out.push_str("\n\nWorking directory: ");
                out.push_str(require("work_dir")?);
                out.push('\n');
            }
        }

        if let Some(path) = &params.output_file_path {
            out.push_str(&format!("\nWrite your complete response to {} as well as stdout.\n", path.display()));
        }

        Ok(out)
    }
}

fn push_list(out: &mut String, header: &str, items: Option<&Vec<String>>) {
    let Some(items) = items else { return };
    if items.is_empty() {
        return;
    }
    out.push('\n');
    out.push_str(header);
    out.push('\n');
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_execute_requires_prompt_and_work_dir() {
        let renderer = TemplateRenderer;
        let err = renderer.render(PromptVariant::TaskExecute, &PromptParams::new()).unwrap_err();
        assert!(matches!(err, PromptError::MissingParam(ref k, PromptVariant::TaskExecute) if k == "prompt"));

        let params = PromptParams::new().with_string("prompt", "add a widget").with_string("work_dir", "/repo");
        let rendered = renderer.render(PromptVariant::TaskExecute, &params).unwrap();
        assert!(rendered.contains("add a widget"));
        assert!(rendered.contains("/repo"));
    }

    #[test]
    fn plan_comprehensive_embeds_consolidated_analysis_and_json_instructions() {
        let renderer = TemplateRenderer;
        let params = PromptParams::new()
            .with_string("prompt", "build the thing")
            .with_string("consolidated_analysis", "findings go here");
        let rendered = renderer.render(PromptVariant::PlanComprehensive, &params).unwrap();
        assert!(rendered.contains("findings go here"));
        assert!(rendered.contains("execution_levels"));
    }

    #[test]
    fn moderator_evaluate_lists_every_analysis_file() {
        let renderer = TemplateRenderer;
        let params = PromptParams::new().with_list(
            "analysis_file_paths",
            vec!["v1/claude.md".to_string(), "v1/gemini.md".to_string()],
        );
        let rendered = renderer.render(PromptVariant::ModeratorEvaluate, &params).unwrap();
        assert!(rendered.contains("v1/claude.md"));
        assert!(rendered.contains("v1/gemini.md"));
        assert!(rendered.contains("CONSENSUS_SCORE"));
    }
}
