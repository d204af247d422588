//! Four-level abstraction hierarchies and the tolerant parser for the
//! LLM's hierarchy responses.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::dream::SynthesizedPattern;

/// Level names, L0 through L3.
pub const LEVEL_NAMES: [&str; 4] = ["specifics", "techniques", "categories", "principles"];

/// A cross-level generalization edge: `from` (lower level) is generalized
/// by `to` (higher level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generalization {
    pub from: String,
    pub to: String,
}

/// Four ordered abstraction levels plus generalization edges; a sidecar to
/// a learning unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractionHierarchy {
    /// L0: concrete board situations.
    pub specifics: Vec<String>,
    /// L1: named techniques.
    pub techniques: Vec<String>,
    /// L2: technique categories.
    pub categories: Vec<String>,
    /// L3: governing principles.
    pub principles: Vec<String>,
    pub generalizations: Vec<Generalization>,
}

impl AbstractionHierarchy {
    pub fn is_empty(&self) -> bool {
        self.specifics.is_empty()
            && self.techniques.is_empty()
            && self.categories.is_empty()
            && self.principles.is_empty()
    }

    pub fn level(&self, index: usize) -> &[String] {
        match index {
            0 => &self.specifics,
            1 => &self.techniques,
            2 => &self.categories,
            _ => &self.principles,
        }
    }
}

// Level markers; each block body runs to the next marker or the end.
static LEVEL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"L(\d)\s*[≔=]").expect("invalid regex"));

static FIELD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\s*≔\s*⟨([\s\S]*?)⟩").expect("invalid regex"));

static EDGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^;⟨⟩\n]+?)\s*(?:→|->)\s*([^;⟨⟩\n]+)").expect("invalid regex"));

/// Parse a hierarchy response.
///
/// Tolerates multi-line level blocks, optional angle-bracket item wrappers,
/// and `=` in place of `≔`. Levels the model omitted stay empty; a response
/// with no level markers at all yields an empty hierarchy.
pub fn parse_hierarchy(text: &str) -> AbstractionHierarchy {
    let mut hierarchy = AbstractionHierarchy::default();

    let markers: Vec<(usize, usize, usize)> = LEVEL_MARKER
        .captures_iter(text)
        .filter_map(|caps| {
            let m = caps.get(0)?;
            let level: usize = caps[1].parse().ok()?;
            Some((level, m.start(), m.end()))
        })
        .collect();

    for (i, &(level, _, body_start)) in markers.iter().enumerate() {
        if level > 3 {
            continue;
        }
        let body_end = markers
            .get(i + 1)
            .map(|&(_, next_start, _)| next_start)
            .unwrap_or(text.len());
        let body = &text[body_start..body_end];

        let mut items = Vec::new();
        let mut had_fields = false;
        for field in FIELD_PATTERN.captures_iter(body) {
            had_fields = true;
            let field_name = field[1].to_lowercase();
            let field_body = &field[2];
            if field_name.starts_with("generaliz") {
                for edge in EDGE_PATTERN.captures_iter(field_body) {
                    hierarchy.generalizations.push(Generalization {
                        from: edge[1].trim().to_string(),
                        to: edge[2].trim().to_string(),
                    });
                }
            } else {
                items.extend(split_items(field_body));
            }
        }
        if !had_fields {
            items.extend(split_items(body));
        }

        let slot = match level {
            0 => &mut hierarchy.specifics,
            1 => &mut hierarchy.techniques,
            2 => &mut hierarchy.categories,
            _ => &mut hierarchy.principles,
        };
        slot.extend(items);
    }

    hierarchy
}

fn split_items(body: &str) -> Vec<String> {
    body.split([';', '\n'])
        .map(|s| s.trim().trim_start_matches('-').trim_matches(['⟨', '⟩']).trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the prompt asking the LLM to abstract selected patterns into four
/// levels.
pub fn hierarchy_prompt(patterns: &[SynthesizedPattern]) -> String {
    let mut prompt = String::from(
        "Abstract the following solving strategies into a four-level hierarchy.\n\
         Answer with one block per level in exactly this form:\n\
         L0≔items≔⟨specific situation; specific situation⟩\n\
         L1≔items≔⟨technique; technique⟩generalizes≔⟨situation→technique⟩\n\
         L2≔items≔⟨category⟩generalizes≔⟨technique→category⟩\n\
         L3≔items≔⟨principle⟩generalizes≔⟨category→principle⟩\n\n\
         Strategies:\n",
    );
    for p in patterns {
        prompt.push_str(&format!("- {}: {}\n", p.strategy_name, p.when_to_use));
    }
    prompt
}
