//! AISP surface syntax: encoding, detection, and validation tiers.
//!
//! AISP is a dense mathematical notation used as an alternative prompt
//! surface. The core never interprets it beyond the tier check here; raw
//! AISP text is stored alongside its decoded human-readable form.

use regex::Regex;
use std::sync::LazyLock;

use crate::experience::FewShot;

/// Glyphs that mark AISP notation.
pub const AISP_GLYPHS: [char; 8] = ['⟦', '⟧', '≔', '∧', '∃', '∀', '∈', '⊢'];

static BLOCK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"⟦[ΓΛΣΕΨ]:[A-Za-z0-9.]+⟧").expect("invalid regex"));

/// How well a piece of text conforms to AISP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AispTier {
    /// No AISP notation at all.
    Plain,
    /// Stray glyphs without block structure.
    Glyphs,
    /// At least one well-formed `⟦Κ:Name⟧` block.
    Structured,
}

/// Classify text into an AISP conformance tier.
pub fn aisp_tier(text: &str) -> AispTier {
    if BLOCK_PATTERN.is_match(text) {
        AispTier::Structured
    } else if text.chars().any(|c| AISP_GLYPHS.contains(&c)) {
        AispTier::Glyphs
    } else {
        AispTier::Plain
    }
}

/// Whether reasoning text is written in AISP notation rather than English.
pub fn is_aisp(text: &str) -> bool {
    aisp_tier(text) > AispTier::Plain
}

/// Convert a free-form cluster label to PascalCase.
pub fn pascal_case(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect()
}

/// Encode a cluster name as an AISP cluster block.
pub fn encode_cluster_name(name: &str) -> String {
    format!("⟦Λ:Cluster.{}⟧", pascal_case(name))
}

/// Encode a few-shot as an AISP strategy block.
pub fn encode_few_shot(fs: &FewShot) -> String {
    let name = fs
        .strategy_name
        .as_deref()
        .map(pascal_case)
        .unwrap_or_else(|| "Anon".to_string());
    format!(
        "⟦Σ:Strategy.{name}⟧{{when≔⟨{}⟩;steps≔⟨{}⟩;act≔({},{},{});level≔{}}}",
        fs.situation,
        fs.analysis,
        fs.example_move.row,
        fs.example_move.col,
        fs.example_move.value,
        fs.abstraction_level
    )
}

/// The AISP generation specification embedded in `aisp-full` headers:
/// required blocks plus the substitution table from prose idioms to
/// operators.
pub fn generation_spec() -> String {
    let mut spec = String::from(
        "⟦Γ:Spec⟧ Respond with AISP blocks. Required blocks:\n\
         ⟦Ψ:State⟧{…}   board reading\n\
         ⟦Λ:Apply⟧{…}   strategy selection\n\
         ⟦Ε:Move⟧{(r,c,v)⊢justification}   the move itself\n\
         Substitutions (prose → operator):\n",
    );
    for (idiom, op) in SUBSTITUTIONS {
        spec.push_str(&format!("  \"{idiom}\" → {op}\n"));
    }
    spec
}

const SUBSTITUTIONS: [(&str, &str); 6] = [
    ("is defined as", "≔"),
    ("and", "∧"),
    ("there exists", "∃"),
    ("for all", "∀"),
    ("is in", "∈"),
    ("therefore", "⊢"),
];
