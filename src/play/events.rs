//! Play lifecycle observer.
//!
//! An explicit interface with named methods, in place of string-keyed event
//! subscriptions. Every method has a no-op default; implementers override
//! what they render.

use crate::board::{Move, Validation};
use crate::play::PlaySession;

/// Receives play lifecycle events.
#[allow(unused_variables)]
pub trait PlayObserver: Send + Sync {
    /// A prompt is about to be sent.
    fn on_request(&self, session_id: &str, move_number: u32) {}

    /// The full model response arrived.
    fn on_response(&self, session_id: &str, content: &str) {}

    /// One streamed token arrived.
    fn on_token(&self, session_id: &str, token: &str) {}

    /// A move was decoded from the response.
    fn on_move_proposed(&self, session_id: &str, mv: &Move) {}

    /// The rules oracle judged a move.
    fn on_move_validated(&self, session_id: &str, mv: &Move, validation: &Validation) {}

    /// The response could not be decoded into a move.
    fn on_parse_failure(&self, session_id: &str, reason: &str) {}

    /// A proposal was rejected from the forbidden list without
    /// re-validation.
    fn on_forbidden_rejected(&self, session_id: &str, mv: &Move, streak: u32) {}

    /// An experience was persisted.
    fn on_experience_stored(&self, session_id: &str, experience_id: &str) {}

    /// The puzzle was solved.
    fn on_session_complete(&self, session: &PlaySession) {}

    /// The session was closed without solving.
    fn on_session_abandoned(&self, session: &PlaySession) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl PlayObserver for NullObserver {}
