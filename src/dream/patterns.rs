//! Synthesised strategy patterns and the prompts/parsers around them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::board::ValidationOutcome;
use crate::experience::Experience;
use crate::prompt::aisp;
use crate::prompt::AispMode;

/// What goes wrong in an anti-pattern cluster, and how to avoid it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiPattern {
    pub what_goes_wrong: String,
    pub why_it_fails: String,
    pub prevention_steps: Vec<String>,
    pub frequency: String,
}

/// One strategy distilled from a cluster of experiences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedPattern {
    pub strategy_name: String,
    pub when_to_use: String,
    pub reasoning_steps: Vec<String>,
    pub reasoning_template: String,
    pub success_insight: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_pattern: Option<AntiPattern>,
    pub source_cluster: String,
    pub source_cluster_size: usize,
}

static FIELD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(name|when|steps|template|insight|confidence|wrong|why|prevent|frequency)\s*:\s*(.+)$")
        .expect("invalid regex")
});

/// Whether a cluster is dominated by failed moves and should be synthesised
/// as an anti-pattern.
pub fn is_anti_pattern_cluster(members: &[Experience]) -> bool {
    if members.is_empty() {
        return false;
    }
    let failed = members
        .iter()
        .filter(|e| e.validation.outcome != ValidationOutcome::Correct)
        .count();
    failed * 2 > members.len()
}

/// Build the synthesis prompt for one cluster.
pub fn synthesis_prompt(
    cluster_name: &str,
    sample: &[&Experience],
    anti_pattern: bool,
    mode: AispMode,
) -> String {
    let label = if mode.is_aisp() {
        aisp::encode_cluster_name(cluster_name)
    } else {
        cluster_name.to_string()
    };
    let mut prompt = format!(
        "Distil ONE solving strategy from the cluster \"{label}\" below.\n\
         Answer with exactly these lines:\n\
         NAME: <short strategy name>\n\
         WHEN: <when to use it>\n\
         STEPS: <ordered steps, separated by ;>\n\
         TEMPLATE: <a reasoning template for future moves>\n\
         INSIGHT: <why it works>\n\
         CONFIDENCE: <0.0 to 1.0>\n"
    );
    if anti_pattern {
        prompt.push_str(
            "This cluster is dominated by failed moves; also answer:\n\
             WRONG: <what goes wrong>\n\
             WHY: <why it fails>\n\
             PREVENT: <prevention steps, separated by ;>\n\
             FREQUENCY: <how often it happens>\n",
        );
    }
    prompt.push_str("\nSampled experiences:\n");
    for exp in sample {
        let reasoning = exp.mv.reasoning.replace('\n', " ");
        prompt.push_str(&format!(
            "- ({}, {}) = {} [{}] {}\n",
            exp.mv.row, exp.mv.col, exp.mv.value, exp.validation.outcome, reasoning
        ));
    }
    prompt
}

/// Parse a synthesis response into a pattern. Returns `None` when the
/// response carries none of the expected fields.
pub fn parse_pattern(
    text: &str,
    cluster_name: &str,
    cluster_size: usize,
) -> Option<SynthesizedPattern> {
    let mut name = None;
    let mut when = None;
    let mut steps = Vec::new();
    let mut template = None;
    let mut insight = None;
    let mut confidence = None;
    let mut wrong = None;
    let mut why = None;
    let mut prevent = Vec::new();
    let mut frequency = None;

    for caps in FIELD_LINE.captures_iter(text) {
        let value = caps[2].trim().to_string();
        match caps[1].to_lowercase().as_str() {
            "name" => name = Some(value),
            "when" => when = Some(value),
            "steps" => steps = split_steps(&value),
            "template" => template = Some(value),
            "insight" => insight = Some(value),
            "confidence" => confidence = value.parse::<f64>().ok(),
            "wrong" => wrong = Some(value),
            "why" => why = Some(value),
            "prevent" => prevent = split_steps(&value),
            "frequency" => frequency = Some(value),
            _ => {}
        }
    }

    name.as_ref()?;
    let anti_pattern = wrong.map(|what_goes_wrong| AntiPattern {
        what_goes_wrong,
        why_it_fails: why.unwrap_or_default(),
        prevention_steps: prevent,
        frequency: frequency.unwrap_or_else(|| "unknown".to_string()),
    });

    Some(SynthesizedPattern {
        strategy_name: name.unwrap_or_else(|| cluster_name.to_string()),
        when_to_use: when.unwrap_or_default(),
        reasoning_steps: steps,
        reasoning_template: template.unwrap_or_default(),
        success_insight: insight.unwrap_or_default(),
        confidence: confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        anti_pattern,
        source_cluster: cluster_name.to_string(),
        source_cluster_size: cluster_size,
    })
}

fn split_steps(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a response carrying several patterns, one `NAME:`-led block each.
/// Used by secondary refinement; unparseable blocks are dropped.
pub fn parse_patterns_multi(text: &str, source: &str) -> Vec<SynthesizedPattern> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_start().to_lowercase().starts_with("name:") && !current.trim().is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        blocks.push(current);
    }
    blocks
        .iter()
        .filter_map(|block| parse_pattern(block, source, 0))
        .collect()
}

/// The reduced-information pattern used when synthesis fails: the cluster
/// label becomes the strategy, with low confidence.
pub fn skeleton_pattern(cluster_name: &str, cluster_size: usize) -> SynthesizedPattern {
    SynthesizedPattern {
        strategy_name: cluster_name.to_string(),
        when_to_use: format!("situations resembling the '{cluster_name}' cluster"),
        reasoning_steps: Vec::new(),
        reasoning_template: String::new(),
        success_insight: String::new(),
        confidence: 0.3,
        anti_pattern: None,
        source_cluster: cluster_name.to_string(),
        source_cluster_size: cluster_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::tests::sample_experience;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_response() {
        let pattern = parse_pattern(
            "NAME: last in row\n\
             WHEN: a row has one empty cell\n\
             STEPS: find the row; list missing values; place it\n\
             TEMPLATE: Row <r> is missing <v>\n\
             INSIGHT: rows are permutations\n\
             CONFIDENCE: 0.9",
            "missing from row",
            42,
        )
        .unwrap();
        assert_eq!(pattern.strategy_name, "last in row");
        assert_eq!(pattern.reasoning_steps.len(), 3);
        assert_eq!(pattern.confidence, 0.9);
        assert_eq!(pattern.source_cluster, "missing from row");
        assert_eq!(pattern.source_cluster_size, 42);
        assert!(pattern.anti_pattern.is_none());
    }

    #[test]
    fn test_parse_anti_pattern_fields() {
        let pattern = parse_pattern(
            "NAME: premature guess\nWHEN: unsure\nCONFIDENCE: 0.4\n\
             WRONG: guessing without elimination\nWHY: ignores constraints\n\
             PREVENT: enumerate candidates; eliminate first\nFREQUENCY: often",
            "guess",
            10,
        )
        .unwrap();
        let anti = pattern.anti_pattern.unwrap();
        assert_eq!(anti.what_goes_wrong, "guessing without elimination");
        assert_eq!(anti.prevention_steps.len(), 2);
        assert_eq!(anti.frequency, "often");
    }

    #[test]
    fn test_confidence_clamped_and_defaulted() {
        let high = parse_pattern("NAME: x\nCONFIDENCE: 3.5", "c", 1).unwrap();
        assert_eq!(high.confidence, 1.0);
        let missing = parse_pattern("NAME: x", "c", 1).unwrap();
        assert_eq!(missing.confidence, 0.5);
    }

    #[test]
    fn test_unparseable_response_is_none() {
        assert!(parse_pattern("nothing useful here", "c", 1).is_none());
    }

    #[test]
    fn test_anti_pattern_detection() {
        let mut members = vec![sample_experience("default", "s1", 1)];
        assert!(!is_anti_pattern_cluster(&members));
        for i in 2..=4 {
            let mut e = sample_experience("default", "s1", i);
            e.validation = crate::board::Validation::invalid("conflict");
            members.push(e);
        }
        assert!(is_anti_pattern_cluster(&members));
        assert!(!is_anti_pattern_cluster(&[]));
    }

    #[test]
    fn test_parse_patterns_multi() {
        let patterns = parse_patterns_multi(
            "NAME: a\nWHEN: w1\nCONFIDENCE: 0.7\n\nNAME: b\nWHEN: w2\nCONFIDENCE: 0.6",
            "refinement",
        );
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].strategy_name, "a");
        assert_eq!(patterns[1].strategy_name, "b");
        assert!(parse_patterns_multi("no blocks", "refinement").is_empty());
    }

    #[test]
    fn test_skeleton_pattern() {
        let skeleton = skeleton_pattern("elimination", 7);
        assert_eq!(skeleton.strategy_name, "elimination");
        assert_eq!(skeleton.confidence, 0.3);
        assert_eq!(skeleton.source_cluster_size, 7);
    }

    #[test]
    fn test_synthesis_prompt_mentions_anti_fields_only_when_asked() {
        let exp = sample_experience("default", "s1", 1);
        let sample = vec![&exp];
        let normal = synthesis_prompt("row", &sample, false, AispMode::Off);
        assert!(!normal.contains("WRONG:"));
        let anti = synthesis_prompt("row", &sample, true, AispMode::Off);
        assert!(anti.contains("WRONG:"));
        assert!(anti.contains("PREVENT:"));
    }
}
