//! Move extraction from free-form model output.
//!
//! The contract is syntactic regardless of prompt mode: a parseable answer
//! carries `ROW:`, `COL:`, and `VALUE:` lines (any order, any case) and an
//! optional `REASONING:` tail. AISP-mode responses may instead embed a
//! `⟦Ε:Move⟧{(r,c,v)⊢…}` form, and pattern references come in several
//! tolerated spellings (`P1`, `P{1}`, `exp[0]→P1`).

use regex::Regex;
use std::sync::LazyLock;

use crate::board::Move;
use crate::error::{Error, Result};

static ROW_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)\brow\b\s*:\s*(\d+)").expect("invalid regex"));

static COL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)\bcol(?:umn)?\b\s*:\s*(\d+)").expect("invalid regex"));

static VALUE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)\bvalue\b\s*:\s*(\d+)").expect("invalid regex"));

static REASONING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\breasoning\b\s*:\s*(.+)$").expect("invalid regex"));

// ⟦Ε:Move⟧{(r,c,v)⊢justification}
static AISP_MOVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"⟦Ε:Move⟧\{\s*\(\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*\)(?:⊢([^}]*))?\}")
        .expect("invalid regex")
});

// P1, P{1}, exp[0]→P1, exp[0]->P{1}, any case.
static PATTERN_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:exp\[\d+\]\s*(?:→|->)\s*)?\bp\{?(\d+)\}?").expect("invalid regex")
});

/// Whether the model refused or deflected rather than answering.
static REFUSAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(i can(?:no|')t|i'm (?:unable|sorry)|cannot (?:determine|solve|help))\b")
        .expect("invalid regex")
});

/// A parsed move attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMove {
    pub mv: Move,
    /// 1-based few-shot pattern the model says it applied, when referenced.
    pub pattern_ref: Option<usize>,
}

/// Extract a move from `text` for a grid of size `n`.
///
/// The extraction is structural: numbers that merely fall outside [1..N]
/// still parse, and the rules oracle rejects them as out of bounds so the
/// attempt lands on the forbidden list under its real coordinates. Only
/// text with no decodable move, or numbers too large to represent at all,
/// is a parse failure. Callers record those as sentinel experiences rather
/// than propagating them.
pub fn parse_move(text: &str, n: usize) -> Result<ParsedMove> {
    let (row, col, value, reasoning) = extract_fields(text)?;

    if value > u8::MAX as usize {
        return Err(Error::Parse(format!(
            "value {value} is not representable on a {n}x{n} board"
        )));
    }

    Ok(ParsedMove {
        mv: Move::new(row, col, value as u8, reasoning),
        pattern_ref: parse_pattern_ref(text),
    })
}

fn extract_fields(text: &str) -> Result<(usize, usize, usize, String)> {
    let field = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok())
    };

    if let (Some(row), Some(col), Some(value)) = (
        field(&ROW_PATTERN),
        field(&COL_PATTERN),
        field(&VALUE_PATTERN),
    ) {
        let reasoning = REASONING_PATTERN
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        return Ok((row, col, value, reasoning));
    }

    if let Some(caps) = AISP_MOVE_PATTERN.captures(text) {
        let get = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<usize>().ok());
        if let (Some(row), Some(col), Some(value)) = (get(1), get(2), get(3)) {
            let reasoning = caps
                .get(4)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            return Ok((row, col, value, reasoning));
        }
    }

    if REFUSAL_PATTERN.is_match(text) {
        return Err(Error::Parse(
            "model refused to propose a move".to_string(),
        ));
    }
    Err(Error::Parse(
        "no ROW/COL/VALUE lines or AISP move form found".to_string(),
    ))
}

/// Extract a 1-based few-shot pattern reference, tolerant to the `P1`,
/// `P{1}`, `exp[k]→P1`, and `exp[k]→P{1}` spellings in any case and with
/// surrounding whitespace. Returns `None` when no marker is present.
pub fn parse_pattern_ref(text: &str) -> Option<usize> {
    PATTERN_REF
        .captures(text.trim())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
}
