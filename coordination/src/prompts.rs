//! Prompt renderer interface (spec §6 "Prompt renderer") — a pure-function
//! boundary the engine calls into, never implements: `render` takes
//! structured parameters for one named variant and returns the rendered
//! string. Concrete template rendering lives outside the core (the
//! `quorum-cli` crate ships a minimal implementation so the workspace runs
//! end-to-end).

use std::collections::HashMap;
use std::path::PathBuf;

/// The prompt variants the engine renders, named exactly as spec §6 lists
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptVariant {
    AnalyzeV1,
    AnalyzeV2,
    VnRefine,
    ModeratorEvaluate,
    SynthesizeAnalysis,
    PlanComprehensive,
    PlanGenerate,
    SynthesizePlans,
    TaskExecute,
}

/// Structured parameters passed to a render call. Kept as a loosely typed
/// bag (rather than one struct per variant) because the renderer is an
/// external, out-of-scope collaborator — the engine only needs to supply
/// and name its inputs consistently, never interpret the rendered text.
#[derive(Debug, Clone, Default)]
pub struct PromptParams {
    pub strings: HashMap<String, String>,
    pub string_lists: HashMap<String, Vec<String>>,
    pub output_file_path: Option<PathBuf>,
}

impl PromptParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    pub fn with_list(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.string_lists.insert(key.into(), values);
        self
    }

    pub fn with_output_file(mut self, path: PathBuf) -> Self {
        self.output_file_path = Some(path);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("missing required parameter {0:?} for variant {1:?}")]
    MissingParam(String, PromptVariant),
}

pub type PromptResult<T> = Result<T, PromptError>;

/// Pure-function prompt template renderer (spec §6).
pub trait PromptRenderer: Send + Sync {
    fn render(&self, variant: PromptVariant, params: &PromptParams) -> PromptResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRenderer;
    impl PromptRenderer for EchoRenderer {
        fn render(&self, variant: PromptVariant, params: &PromptParams) -> PromptResult<String> {
            Ok(format!("{variant:?}:{:?}", params.strings))
        }
    }

    #[test]
    fn params_builder_accumulates_fields() {
        let params = PromptParams::new()
            .with_string("prompt", "do the thing")
            .with_list("agreements", vec!["a".into()])
            .with_output_file(PathBuf::from("/tmp/out.md"));
        assert_eq!(params.strings.get("prompt").unwrap(), "do the thing");
        assert_eq!(params.string_lists.get("agreements").unwrap(), &vec!["a".to_string()]);
        assert_eq!(params.output_file_path, Some(PathBuf::from("/tmp/out.md")));

        let renderer = EchoRenderer;
        let rendered = renderer.render(PromptVariant::AnalyzeV1, &params).unwrap();
        assert!(rendered.contains("AnalyzeV1"));
    }
}
