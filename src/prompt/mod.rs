//! Prompt construction in four surface syntaxes.
//!
//! Every mode assembles the same logical sections — header, board,
//! strategies, forbidden list, history, execute — and differs only in
//! surface syntax. The output contract never changes: the model must answer
//! with ROW/COL/VALUE lines, because parsing stays syntactic.

pub mod aisp;
mod builder;

pub use builder::{PromptBuilder, PromptOptions};

use serde::{Deserialize, Serialize};

/// Prompt surface syntax. `Off` renders natural-language prose; the AISP
/// modes vary only in header verbosity and validator strictness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AispMode {
    #[default]
    Off,
    AispLite,
    Aisp,
    AispFull,
}

impl AispMode {
    /// Whether any AISP rendering is active.
    pub fn is_aisp(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl std::fmt::Display for AispMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::AispLite => write!(f, "aisp-lite"),
            Self::Aisp => write!(f, "aisp"),
            Self::AispFull => write!(f, "aisp-full"),
        }
    }
}
