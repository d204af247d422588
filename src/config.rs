//! Play-loop configuration.
//!
//! Transport settings live in [`crate::llm::LlmConfig`]; consolidation
//! options in [`crate::dream::DreamOptions`]. This is everything the play
//! loop itself can be told.

use serde::{Deserialize, Serialize};

use crate::prompt::{AispMode, PromptOptions};

/// Configuration for a play session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayConfig {
    /// When false, no experiences are persisted and no few-shots loaded.
    pub memory_enabled: bool,
    /// Cap on the displayed move history. The forbidden list always uses
    /// the full history regardless.
    pub max_history_moves: usize,
    /// Surface reasoning text from past moves in the prompt.
    pub include_reasoning: bool,
    /// Namespace for experiences and few-shots.
    pub profile_name: String,
    pub learning_unit_id: String,
    pub aisp_mode: AispMode,
    pub anonymous_patterns: bool,
    pub reasoning_template: bool,
    /// Few-shot budget; pass 10/6 for a doubled unit or its bundle will be
    /// silently truncated on load.
    pub few_shot_max: usize,
    pub few_shot_min: usize,
    /// Consecutive forbidden proposals before the session is abandoned.
    pub max_consecutive_forbidden: u32,
    /// Per-session hard cap on moves.
    pub max_moves: u32,
    /// Optional system-prompt overlay from the profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Keep the literal prompt string on each experience, for debugging.
    pub capture_prompts: bool,
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            memory_enabled: true,
            max_history_moves: 10,
            include_reasoning: true,
            profile_name: "default".to_string(),
            learning_unit_id: "default".to_string(),
            aisp_mode: AispMode::Off,
            anonymous_patterns: false,
            reasoning_template: false,
            few_shot_max: 5,
            few_shot_min: 3,
            max_consecutive_forbidden: 10,
            max_moves: 100,
            system_prompt: None,
            capture_prompts: false,
        }
    }
}

impl PlayConfig {
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile_name = profile.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.learning_unit_id = unit.into();
        self
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    pub fn with_aisp_mode(mut self, mode: AispMode) -> Self {
        self.aisp_mode = mode;
        self
    }

    pub fn with_max_moves(mut self, max: u32) -> Self {
        self.max_moves = max;
        self
    }

    pub fn with_max_history_moves(mut self, max: usize) -> Self {
        self.max_history_moves = max;
        self
    }

    /// Doubled few-shot budget (10 max, 6 min).
    pub fn doubled(mut self) -> Self {
        self.few_shot_max = 10;
        self.few_shot_min = 6;
        self
    }

    /// The prompt-style options this configuration implies.
    pub fn prompt_options(&self) -> PromptOptions {
        PromptOptions {
            mode: self.aisp_mode,
            anonymous_patterns: self.anonymous_patterns,
            reasoning_template: self.reasoning_template,
            include_reasoning: self.include_reasoning,
            max_history_moves: self.max_history_moves,
        }
    }
}
