//! Experience records, few-shots, and learning units.
//!
//! An experience is the immutable record of one LLM turn. Experiences start
//! life owned by a play session, move into the global store on persistence,
//! and may later be absorbed into a learning unit by consolidation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::board::{Board, Move, Validation, ValidationOutcome};
use crate::prompt::AispMode;

/// Snapshot of what learning material was live when a move was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningContext {
    /// Few-shots injected into the prompt.
    pub few_shot_count: usize,
    /// Experiences already consolidated for this profile.
    pub consolidated_count: usize,
    /// Whether any synthesised patterns existed at all.
    pub patterns_available: bool,
}

/// Contextual features of a move, captured for downstream ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveContext {
    /// Empty cells on the board when the move was proposed.
    pub empty_cells: usize,
    /// Length of the model's reasoning text, in characters.
    pub reasoning_len: usize,
    /// Mean filled-peer count over the target cell's row, column, and box.
    pub constraint_density: f64,
}

/// An immutable record of one LLM turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub session_id: String,
    pub puzzle_id: String,
    /// Stable hash of the board the move was proposed against.
    pub puzzle_fingerprint: String,
    /// 1-based, monotonic within a session.
    pub move_number: u32,
    /// Board state before the attempt.
    pub board_before: Board,
    #[serde(rename = "move")]
    pub mv: Move,
    pub validation: Validation,
    /// True when the response could not be decoded and `mv` is the
    /// (0,0,0) sentinel. A parsed move with zero coordinates is NOT a
    /// sentinel; the oracle rejects it as out of bounds and it stays on
    /// the forbidden list.
    #[serde(default)]
    pub parse_failure: bool,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub memory_enabled: bool,
    pub profile_name: String,
    pub learning_unit_id: String,
    pub learning_context: LearningContext,
    /// Importance score in [0, 1].
    pub importance: f64,
    pub context: MoveContext,
    /// Literal prompt string, kept only when prompt capture is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub consolidated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_to_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_version: Option<u32>,
}

impl Experience {
    /// Generate a fresh experience id.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Whether this record has been absorbed into a learning unit.
    pub fn is_bound(&self) -> bool {
        self.bound_to_unit.is_some()
    }

    /// Stamp unit-binding metadata onto a copy.
    pub fn bound_copy(&self, unit: &str, version: u32) -> Self {
        let mut copy = self.clone();
        copy.bound_to_unit = Some(unit.to_string());
        copy.bound_at = Some(Utc::now());
        copy.unit_version = Some(version);
        copy
    }

    /// Strip binding metadata, restoring the record to its global form.
    pub fn unbound_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.bound_to_unit = None;
        copy.bound_at = None;
        copy.unit_version = None;
        copy.consolidated = false;
        copy
    }
}

/// A move rejected earlier in the session, with its rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForbiddenMove {
    pub row: usize,
    pub col: usize,
    pub value: u8,
    pub reason: String,
}

/// Derive the forbidden list from a session's FULL experience list: every
/// distinct (row, col, value) whose outcome was invalid or valid-but-wrong.
/// Parse-failure sentinels are skipped (their (0,0,0) move was never
/// proposed); genuinely-parsed moves keep their real coordinates here even
/// when those are out of bounds. This is always computed over the whole
/// session, never the truncated display history.
pub fn forbidden_moves(experiences: &[Experience]) -> Vec<ForbiddenMove> {
    let mut seen = std::collections::HashSet::new();
    experiences
        .iter()
        .filter(|e| !e.validation.is_correct() && !e.parse_failure)
        .filter(|e| seen.insert(e.mv.key()))
        .map(|e| ForbiddenMove {
            row: e.mv.row,
            col: e.mv.col,
            value: e.mv.value,
            reason: e
                .validation
                .reason
                .clone()
                .unwrap_or_else(|| "rejected".to_string()),
        })
        .collect()
}

/// A worked example injected into future prompts.
///
/// Few-shots are regenerated by consolidation; they are never authored by
/// hand, and their outcome is always `correct`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShot {
    /// When the pattern applies.
    pub situation: String,
    /// The reasoning steps or analysis to follow.
    pub analysis: String,
    /// AISP-encoded form, present when the unit's mode calls for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aisp: Option<String>,
    pub example_move: Move,
    pub outcome: ValidationOutcome,
    /// Strategy name, or an anonymised tag when anonymous patterns are on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_name: Option<String>,
    /// Abstraction level 0..3 (specifics up to principles).
    pub abstraction_level: u8,
}

/// Counters describing a learning unit's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMetadata {
    /// Monotonic version, incremented by each successful consolidation.
    pub version: u32,
    /// Total experiences ever absorbed.
    pub total_experiences: usize,
    /// Absorbed-experience histogram by puzzle size.
    pub by_puzzle_size: BTreeMap<usize, usize>,
    /// Identifier of the clustering algorithm frozen for this unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

/// A named, per-profile, versioned container of distilled knowledge.
///
/// Few-shots and the abstraction hierarchy live under their own storage keys
/// and are copied alongside the unit by `clone_unit`; the unit record itself
/// carries identity, the absorbed-id list, and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningUnit {
    /// Unique within a profile.
    pub unit_id: String,
    pub name: String,
    pub profile: String,
    pub description: String,
    pub aisp_mode: AispMode,
    pub absorbed_experience_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: UnitMetadata,
}

impl LearningUnit {
    pub fn new(unit_id: impl Into<String>, profile: impl Into<String>) -> Self {
        let unit_id = unit_id.into();
        let now = Utc::now();
        Self {
            name: unit_id.clone(),
            unit_id,
            profile: profile.into(),
            description: String::new(),
            aisp_mode: AispMode::Off,
            absorbed_experience_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: UnitMetadata::default(),
        }
    }
}
