//! Play-session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::board::ValidationOutcome;
use crate::experience::{Experience, LearningContext};
use crate::prompt::AispMode;

/// Why a session was closed without solving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// Hit the per-session move cap.
    MaxMoves,
    /// Too many consecutive forbidden proposals; the loop-prevention bound.
    ConsecutiveForbidden,
    /// The LLM returned an unrecoverable error.
    LlmError(String),
    /// Persistence failed; the in-memory session state is still valid.
    StoreError(String),
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxMoves => write!(f, "max_moves"),
            Self::ConsecutiveForbidden => write!(f, "consecutive_forbidden"),
            Self::LlmError(detail) => write!(f, "llm_error:{detail}"),
            Self::StoreError(detail) => write!(f, "store_error:{detail}"),
        }
    }
}

/// One play of one puzzle: counters, experiences, and lifecycle flags.
/// Never mutated after close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaySession {
    pub id: String,
    pub puzzle_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub solved: bool,
    pub abandoned: bool,
    pub abandon_reason: Option<String>,
    pub total_moves: u32,
    pub correct_moves: u32,
    pub invalid_moves: u32,
    pub valid_but_wrong_moves: u32,
    pub profile_name: String,
    pub learning_unit_id: String,
    pub memory_enabled: bool,
    pub aisp_mode: AispMode,
    pub experiences: Vec<Experience>,
    /// Captured once at session start.
    pub learning_context: LearningContext,
}

impl PlaySession {
    pub fn new(
        puzzle_id: impl Into<String>,
        profile_name: impl Into<String>,
        learning_unit_id: impl Into<String>,
        memory_enabled: bool,
        aisp_mode: AispMode,
        learning_context: LearningContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            puzzle_id: puzzle_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            solved: false,
            abandoned: false,
            abandon_reason: None,
            total_moves: 0,
            correct_moves: 0,
            invalid_moves: 0,
            valid_but_wrong_moves: 0,
            profile_name: profile_name.into(),
            learning_unit_id: learning_unit_id.into(),
            memory_enabled,
            aisp_mode,
            experiences: Vec::new(),
            learning_context,
        }
    }

    /// Append an experience and bump the matching counter.
    pub fn record(&mut self, experience: Experience) {
        match experience.validation.outcome {
            ValidationOutcome::Correct => self.correct_moves += 1,
            ValidationOutcome::Invalid => self.invalid_moves += 1,
            ValidationOutcome::ValidButWrong => self.valid_but_wrong_moves += 1,
        }
        self.total_moves += 1;
        self.experiences.push(experience);
    }

    pub fn close_solved(&mut self) {
        self.solved = true;
        self.ended_at = Some(Utc::now());
    }

    pub fn close_abandoned(&mut self, reason: AbandonReason) {
        self.abandoned = true;
        self.abandon_reason = Some(reason.to_string());
        self.ended_at = Some(Utc::now());
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// `total == correct + invalid + wrong == experiences.len()`.
    pub fn counters_consistent(&self) -> bool {
        self.total_moves == self.correct_moves + self.invalid_moves + self.valid_but_wrong_moves
            && self.total_moves as usize == self.experiences.len()
    }

    /// One-line summary with the abandon reason and the counter triad.
    pub fn summary(&self) -> String {
        let state = if self.solved {
            "solved".to_string()
        } else if self.abandoned {
            format!(
                "abandoned ({})",
                self.abandon_reason.as_deref().unwrap_or("unknown")
            )
        } else {
            "active".to_string()
        };
        format!(
            "session {} {state}: {} moves ({} correct, {} invalid, {} wrong)",
            self.id, self.total_moves, self.correct_moves, self.invalid_moves,
            self.valid_but_wrong_moves
        )
    }
}
