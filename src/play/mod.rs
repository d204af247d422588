//! The play loop engine and its session/observer types.

mod engine;
pub mod events;
mod types;

pub use engine::PlayEngine;
pub use events::{NullObserver, PlayObserver};
pub use types::{AbandonReason, PlaySession};
