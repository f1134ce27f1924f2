//! Robust, ordered score parsing and output validation (spec §4.1.1, §4.1.2).
//!
//! Regexes are compiled once via `std::sync::LazyLock` rather than
//! recompiled per call.

use std::sync::LazyLock;

use regex::Regex;

use crate::state::ModeratorEvaluationResult;

/// Parsed score plus whether a score was actually found (spec §4.1.1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedScore {
    pub value: f64,
    pub found: bool,
}

fn normalize(raw: f64) -> f64 {
    if raw <= 1.0 {
        raw
    } else {
        raw / 100.0
    }
}

fn parse_numeric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('%');
    let trimmed = trimmed.split('/').next().unwrap_or(trimmed);
    trimmed.trim().parse::<f64>().ok()
}

static FRONTMATTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*(?:```(?:\w+)?\s*)?---\s*\n(?:.*\n)*?\s*consensus_score\s*:\s*"?([0-9.]+%?/?1?0?0?)"?\s*\n(?:.*\n)*?---"#)
        .expect("static regex")
});

static DOUBLE_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)>>\s*FINAL SCORE:\s*([0-9.]+)\s*<<").expect("static regex"));

static FLEXIBLE_KV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:consensus|semantic|overall)\s+score\s*[:=]\s*([0-9.]+)\s*(%|/100)?")
        .expect("static regex")
});

static BOLDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\*\*CONSENSUS_SCORE:?\*\*\s*([0-9.]+)\s*%?").expect("static regex"));

static DELIMITER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=-=-=-=\s*([0-9.]+)\s*%\s*=-=-=-=-=").expect("static regex"));

static PROSE_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:overall|semantic|consensus)\s+score\s+is\s+([0-9.]+)\s*%?").expect("static regex")
});

static PROSE_DECIMAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:semantic|consensus|overall)\s+score\s+(0\.\d+)").expect("static regex")
});

/// Try each extraction strategy in the order mandated by spec §4.1.1; the
/// first success wins.
pub fn parse_score(text: &str) -> ParsedScore {
    if let Some(caps) = FRONTMATTER.captures(text) {
        if let Some(n) = parse_numeric(&caps[1]) {
            return ParsedScore {
                value: normalize(n),
                found: true,
            };
        }
    }
    if let Some(caps) = DOUBLE_ANCHOR.captures(text) {
        if let Some(n) = parse_numeric(&caps[1]) {
            return ParsedScore {
                value: normalize(n),
                found: true,
            };
        }
    }
    if let Some(caps) = FLEXIBLE_KV.captures(text) {
        if let Some(n) = parse_numeric(&caps[1]) {
            return ParsedScore {
                value: normalize(n),
                found: true,
            };
        }
    }
    if let Some(caps) = BOLDED.captures(text) {
        if let Some(n) = parse_numeric(&caps[1]) {
            return ParsedScore {
                value: normalize(n),
                found: true,
            };
        }
    }
    if let Some(caps) = DELIMITER.captures(text) {
        if let Some(n) = parse_numeric(&caps[1]) {
            return ParsedScore {
                value: normalize(n),
                found: true,
            };
        }
    }
    if let Some(caps) = PROSE_PERCENT.captures(text) {
        if let Some(n) = parse_numeric(&caps[1]) {
            return ParsedScore {
                value: normalize(n),
                found: true,
            };
        }
    }
    if let Some(caps) = PROSE_DECIMAL.captures(text) {
        if let Some(n) = parse_numeric(&caps[1]) {
            return ParsedScore {
                value: normalize(n),
                found: true,
            };
        }
    }
    ParsedScore {
        value: 0.0,
        found: false,
    }
}

/// Extract the bullet items under a Markdown header named `header`
/// (case-insensitive), e.g. `## Agreements`.
pub(crate) fn extract_section(text: &str, header: &str) -> Vec<String> {
    let header_re = Regex::new(&format!(r"(?im)^#{{1,6}}\s*{}\s*$", regex::escape(header)))
        .unwrap_or_else(|_| Regex::new("$^").unwrap());
    let Some(m) = header_re.find(text) else {
        return Vec::new();
    };
    let rest = &text[m.end()..];
    let next_header = Regex::new(r"(?m)^#{1,6}\s+\S").unwrap();
    let section = match next_header.find(rest) {
        Some(next) => &rest[..next.start()],
        None => rest,
    };

    section
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let stripped = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
                .or_else(|| trimmed.strip_prefix("• "));
            stripped.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        })
        .collect()
}

const REFUSAL_PHRASES: &[&str] = &[
    "cannot evaluate",
    "refuse to score",
    "unable to assess",
    "insufficient information",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(String),
}

/// Reject outputs that are too short, an explicit refusal with no score, or
/// lack any structural markers at all (spec §4.1.2).
pub fn validate_output(text: &str, score: &ParsedScore) -> ValidationOutcome {
    if text.len() < 100 {
        return ValidationOutcome::Invalid(format!(
            "output too short ({} chars, need >= 100)",
            text.len()
        ));
    }

    if !score.found {
        let lower = text.to_lowercase();
        if REFUSAL_PHRASES.iter().any(|p| lower.contains(p)) {
            return ValidationOutcome::Invalid(
                "moderator refused to score the analyses".to_string(),
            );
        }
    }

    let has_structure = text.contains("##") || text.contains("Agreement") || text.contains("Divergen");
    if !has_structure {
        return ValidationOutcome::Invalid(
            "output has no structural markers (no ## headers, no Agreement/Divergence sections)"
                .to_string(),
        );
    }

    ValidationOutcome::Valid
}

/// Parse a full moderator response into a [`ModeratorEvaluationResult`],
/// without token/duration metadata (the caller fills those in from the
/// `Agent::execute` result).
pub fn parse_moderator_response(text: &str) -> ModeratorEvaluationResult {
    let score = parse_score(text);
    ModeratorEvaluationResult {
        score: score.value,
        score_found: score.found,
        agreements: extract_section(text, "Agreements"),
        divergences: extract_section(text, "Divergences"),
        missing_perspectives: extract_section(text, "Missing Perspectives"),
        recommendations: extract_section(text, "Recommendations"),
        tokens_in: 0,
        tokens_out: 0,
        duration: std::time::Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_frontmatter_ratio() {
        let text = "---\nconsensus_score: 0.87\nother: x\n---\n\nbody";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.87).abs() < 1e-9);
    }

    #[test]
    fn parses_yaml_frontmatter_percent_in_fence() {
        let text = "```markdown\n---\nconsensus_score: \"82%\"\n---\n```\nbody";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.82).abs() < 1e-9);
    }

    #[test]
    fn parses_double_anchor() {
        let text = "analysis here\n>> FINAL SCORE: 91 <<\nmore text";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.91).abs() < 1e-9);
    }

    #[test]
    fn parses_flexible_kv_with_percent() {
        let text = "The consensus score: 76% based on review";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.76).abs() < 1e-9);
    }

    #[test]
    fn parses_bolded_form() {
        let text = "summary\n**CONSENSUS_SCORE:** 64%\nmore";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.64).abs() < 1e-9);
    }

    #[test]
    fn parses_distinctive_delimiter() {
        let text = "reasoning trace\n=-=-=-=72%=-=-=-=-=\nend";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.72).abs() < 1e-9);
    }

    #[test]
    fn parses_prose_percent_form() {
        let text = "In my judgement the overall score is 88%, given the analyses.";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.88).abs() < 1e-9);
    }

    #[test]
    fn parses_prose_decimal_form() {
        let text = "The semantic score 0.93 reflects strong agreement.";
        let score = parse_score(text);
        assert!(score.found);
        assert!((score.value - 0.93).abs() < 1e-9);
    }

    #[test]
    fn missing_score_is_reported() {
        let score = parse_score("no score anywhere in this text at all");
        assert!(!score.found);
    }

    #[test]
    fn extracts_bulleted_sections() {
        let text = "## Agreements\n- both agree on X\n- both agree on Y\n\n## Divergences\n- disagree on Z\n";
        let result = parse_moderator_response(text);
        assert_eq!(result.agreements, vec!["both agree on X", "both agree on Y"]);
        assert_eq!(result.divergences, vec!["disagree on Z"]);
    }

    #[test]
    fn rejects_short_output() {
        let outcome = validate_output("too short", &ParsedScore { value: 0.0, found: false });
        assert!(matches!(outcome, ValidationOutcome::Invalid(_)));
    }

    #[test]
    fn rejects_explicit_refusal_without_score() {
        let text = "I cannot evaluate these analyses because they reference different files and \
                     the context I was given lacks sufficient detail to compare them meaningfully at all.";
        let outcome = validate_output(text, &ParsedScore { value: 0.0, found: false });
        match outcome {
            ValidationOutcome::Invalid(reason) => assert!(reason.contains("refused to score")),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn accepts_structured_output_with_score() {
        let text = "## Agreements\n- agree on approach\n\n## Divergences\n- none\n\n**CONSENSUS_SCORE:** 90%\n\
                     This is a sufficiently long analysis body to pass the length check comfortably.";
        let score = parse_score(text);
        let outcome = validate_output(text, &score);
        assert_eq!(outcome, ValidationOutcome::Valid);
    }
}
