//! # dream-core
//!
//! An experience-driven learning loop for LLM agents playing
//! fully-observable constraint games (Sudoku, sizes 4/9/16/25).
//!
//! The agent has no solver and no hints: it proposes moves by prompting a
//! chat-completion model, validates each proposal against the rules and the
//! known solution, records every attempt, and periodically consolidates
//! ("dreams") large pools of attempts into compact few-shot strategy
//! libraries that are reinjected into future prompts.
//!
//! ## Core Components
//!
//! - **Play**: the prompt → response → parse → validate → record loop, with
//!   forbidden-move enforcement and loop-prevention
//! - **Store**: append-only SQLite persistence of every attempt with full
//!   provenance, namespaced by (profile, learning unit)
//! - **Cluster + Dream**: the versioned clustering registry and the
//!   consolidation pipeline that distils experiences into ranked few-shots
//!   and a four-level abstraction hierarchy
//! - **Prompt**: four surface syntaxes (prose and three AISP variants) over
//!   the same logical sections
//!
//! ## Example
//!
//! ```rust,ignore
//! use dream_core::{HttpLlmClient, LlmConfig, PlayConfig, PlayEngine};
//!
//! let client = Arc::new(HttpLlmClient::new(LlmConfig::new(
//!     "http://localhost:1234",
//!     "qwen2.5-7b-instruct",
//! )));
//! let engine = PlayEngine::new(client, PlayConfig::default()).with_store(store);
//! let session = engine.play(&puzzle).await?;
//! println!("{}", session.summary());
//! ```

pub mod board;
pub mod cluster;
pub mod config;
pub mod dream;
pub mod error;
pub mod experience;
pub mod llm;
pub mod parser;
pub mod play;
pub mod prompt;
pub mod scoring;
pub mod store;

// Re-exports for convenience
pub use board::{
    is_solved, validate_move, Board, Move, Puzzle, Validation, ValidationOutcome,
};
pub use cluster::{
    deep::DeepCluster, fast::FastCluster, llm::LlmCluster, AlgorithmInfo, ClusterConfig,
    ClusterRegistry, ClusterRun, ClusteringAlgorithm, Clusters,
};
pub use config::PlayConfig;
pub use dream::{
    AbstractionHierarchy, AntiPattern, Consolidator, DreamOptions, DreamReport, FewShotBudget,
    Generalization, SynthesizedPattern, UnitLocks,
};
pub use error::{Error, Result};
pub use experience::{
    forbidden_moves, Experience, FewShot, ForbiddenMove, LearningContext, LearningUnit,
    MoveContext, UnitMetadata,
};
pub use llm::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, FinishReason, HttpLlmClient,
    LlmClient, LlmConfig, NullSink, RetryConfig, ThinkingFilter, TokenSink, TokenUsage,
};
pub use parser::{parse_move, parse_pattern_ref, ParsedMove};
pub use play::{AbandonReason, NullObserver, PlayEngine, PlayObserver, PlaySession};
pub use prompt::{AispMode, PromptBuilder, PromptOptions};
pub use scoring::{move_context, score_importance};
pub use store::{ExperienceStore, StoreStats, TrajectoryStep};
