//! The play loop: prompt → response → parse → validate → record.

use std::sync::Arc;
use tracing::{info, warn};

use crate::board::{is_solved, validate_move, Board, Move, Puzzle, Validation};
use crate::config::PlayConfig;
use crate::dream::UnitLocks;
use crate::error::Result;
use crate::experience::{forbidden_moves, Experience, FewShot, LearningContext};
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient};
use crate::parser::parse_move;
use crate::play::events::{NullObserver, PlayObserver};
use crate::play::types::{AbandonReason, PlaySession};
use crate::prompt::PromptBuilder;
use crate::scoring::{move_context, score_importance};
use crate::store::ExperienceStore;

const FORBIDDEN_REASON: &str = "already attempted and proven wrong";

/// Orchestrates play sessions against one LLM and one store.
pub struct PlayEngine {
    client: Arc<dyn LlmClient>,
    store: Option<Arc<ExperienceStore>>,
    config: PlayConfig,
    observer: Arc<dyn PlayObserver>,
    locks: Option<Arc<UnitLocks>>,
}

impl PlayEngine {
    pub fn new(client: Arc<dyn LlmClient>, config: PlayConfig) -> Self {
        Self {
            client,
            store: None,
            config,
            observer: Arc::new(NullObserver),
            locks: None,
        }
    }

    pub fn with_store(mut self, store: Arc<ExperienceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PlayObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share unit locks with a consolidator so dreams wait out live plays.
    pub fn with_locks(mut self, locks: Arc<UnitLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    fn memory_on(&self) -> bool {
        self.config.memory_enabled && self.store.is_some()
    }

    /// Play one puzzle to completion.
    ///
    /// Runtime failures close the session rather than erroring: the
    /// returned session carries an abandon reason whenever it is not
    /// solved.
    pub async fn play(&self, puzzle: &Puzzle) -> Result<PlaySession> {
        let _guard = match (&self.locks, self.memory_on()) {
            (Some(locks), true) => Some(
                locks
                    .play_guard(&self.config.profile_name, &self.config.learning_unit_id)
                    .await,
            ),
            _ => None,
        };

        let initial_few_shots = self.load_few_shots()?;
        let learning_context = self.learning_context(&initial_few_shots)?;
        let mut session = PlaySession::new(
            &puzzle.id,
            &self.config.profile_name,
            &self.config.learning_unit_id,
            self.memory_on(),
            self.config.aisp_mode,
            learning_context,
        );
        let builder = PromptBuilder::new(self.config.prompt_options());
        let mut board = puzzle.initial.clone();
        let mut consecutive_forbidden = 0u32;
        let mut recent_errors = 0u32;

        info!(
            session = %session.id,
            puzzle = %puzzle.id,
            size = puzzle.size(),
            few_shots = initial_few_shots.len(),
            "session started"
        );

        loop {
            if is_solved(&board) {
                session.close_solved();
                self.observer.on_session_complete(&session);
                break;
            }
            if session.total_moves >= self.config.max_moves {
                self.abandon(&mut session, AbandonReason::MaxMoves);
                break;
            }

            let few_shots = self.load_few_shots()?;
            let prompt = builder.build(&board, &few_shots, &session.experiences);
            let request = match &self.config.system_prompt {
                Some(system) => CompletionRequest::with_system(system.clone(), prompt.clone()),
                None => CompletionRequest::from_prompt(prompt.clone()),
            };

            self.observer.on_request(&session.id, session.total_moves + 1);
            let response = match self.client.complete(request).await {
                Ok(response) => response,
                Err(e) => {
                    self.abandon(&mut session, AbandonReason::LlmError(e.to_string()));
                    break;
                }
            };
            self.observer.on_response(&session.id, &response.content);

            let parsed = match parse_move(&response.content, puzzle.size()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let reason = e.to_string();
                    self.observer.on_parse_failure(&session.id, &reason);
                    // The full response is preserved as the sentinel's
                    // reasoning.
                    let mv = Move::sentinel(response.content.clone());
                    let mut experience = self.build_experience(
                        &session,
                        &board,
                        puzzle,
                        mv,
                        Validation::invalid(reason),
                        recent_errors,
                        &prompt,
                        &response,
                    );
                    experience.parse_failure = true;
                    recent_errors += 1;
                    session.record(experience.clone());
                    if !self.persist(&mut session, &experience) {
                        break;
                    }
                    continue;
                }
            };
            self.observer.on_move_proposed(&session.id, &parsed.mv);

            // Forbidden moves are rejected before the oracle ever sees
            // them; the list covers the whole session, not the display
            // window.
            let forbidden = forbidden_moves(&session.experiences);
            let is_forbidden = forbidden
                .iter()
                .any(|f| (f.row, f.col, f.value) == parsed.mv.key());
            let validation = if is_forbidden {
                consecutive_forbidden += 1;
                self.observer
                    .on_forbidden_rejected(&session.id, &parsed.mv, consecutive_forbidden);
                Validation::invalid(FORBIDDEN_REASON)
            } else {
                consecutive_forbidden = 0;
                let validation = validate_move(&board, &parsed.mv, &puzzle.solution);
                self.observer
                    .on_move_validated(&session.id, &parsed.mv, &validation);
                validation
            };

            let experience = self.build_experience(
                &session,
                &board,
                puzzle,
                parsed.mv.clone(),
                validation.clone(),
                recent_errors,
                &prompt,
                &response,
            );
            if validation.is_correct() {
                recent_errors = 0;
                // Only correct moves touch the board; applying a
                // valid-but-wrong move would corrupt later validation
                // against the solution.
                board.set(parsed.mv.row, parsed.mv.col, parsed.mv.value);
            } else {
                recent_errors += 1;
            }
            session.record(experience.clone());
            if !self.persist(&mut session, &experience) {
                break;
            }

            if consecutive_forbidden >= self.config.max_consecutive_forbidden {
                self.abandon(&mut session, AbandonReason::ConsecutiveForbidden);
                break;
            }
        }

        info!(session = %session.id, "{}", session.summary());
        Ok(session)
    }

    fn abandon(&self, session: &mut PlaySession, reason: AbandonReason) {
        warn!(session = %session.id, %reason, "session abandoned");
        session.close_abandoned(reason);
        self.observer.on_session_abandoned(session);
    }

    fn load_few_shots(&self) -> Result<Vec<FewShot>> {
        match (&self.store, self.memory_on()) {
            (Some(store), true) => store.get_few_shots(
                &self.config.profile_name,
                &self.config.learning_unit_id,
                self.config.few_shot_max,
            ),
            _ => Ok(Vec::new()),
        }
    }

    fn learning_context(&self, few_shots: &[FewShot]) -> Result<LearningContext> {
        let consolidated_count = match (&self.store, self.memory_on()) {
            (Some(store), true) => store
                .get_learning_unit(&self.config.profile_name, &self.config.learning_unit_id)?
                .map(|unit| unit.metadata.total_experiences)
                .unwrap_or(0),
            _ => 0,
        };
        Ok(LearningContext {
            few_shot_count: few_shots.len(),
            consolidated_count,
            patterns_available: !few_shots.is_empty(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_experience(
        &self,
        session: &PlaySession,
        board: &Board,
        puzzle: &Puzzle,
        mv: Move,
        validation: Validation,
        recent_errors: u32,
        prompt: &str,
        response: &CompletionResponse,
    ) -> Experience {
        let n = board.size();
        let importance = score_importance(
            validation.outcome,
            recent_errors,
            board.empty_count(),
            n * n,
        );
        let context = move_context(board, &mv, &mv.reasoning);
        Experience {
            id: Experience::new_id(),
            session_id: session.id.clone(),
            puzzle_id: puzzle.id.clone(),
            puzzle_fingerprint: board.fingerprint(),
            move_number: session.total_moves + 1,
            board_before: board.clone(),
            mv,
            validation,
            parse_failure: false,
            timestamp: chrono::Utc::now(),
            model: response.model.clone(),
            memory_enabled: self.memory_on(),
            profile_name: session.profile_name.clone(),
            learning_unit_id: session.learning_unit_id.clone(),
            learning_context: session.learning_context,
            importance,
            context,
            prompt: self.config.capture_prompts.then(|| prompt.to_string()),
            consolidated: false,
            bound_to_unit: None,
            bound_at: None,
            unit_version: None,
        }
    }

    /// Persist if memory is on. A store failure abandons the session with
    /// the original message preserved; in-memory state stays valid.
    fn persist(&self, session: &mut PlaySession, experience: &Experience) -> bool {
        if !self.memory_on() {
            return true;
        }
        let store = self.store.as_ref().expect("memory_on checked store");
        match store.save_experience(experience) {
            Ok(()) => {
                self.observer.on_experience_stored(&session.id, &experience.id);
                true
            }
            Err(e) => {
                self.abandon(session, AbandonReason::StoreError(e.to_string()));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ValidationOutcome;
    use crate::llm::testutil::{ScriptStep, ScriptedClient};
    use pretty_assertions::assert_eq;

    fn solved_4x4() -> Board {
        Board::new(vec![
            vec![1, 2, 3, 4],
            vec![3, 4, 1, 2],
            vec![2, 1, 4, 3],
            vec![4, 3, 2, 1],
        ])
        .unwrap()
    }

    /// The trivial puzzle of scenario S1: one empty cell at (4,4).
    fn one_cell_puzzle() -> Puzzle {
        let mut initial = solved_4x4();
        initial.set(4, 4, 0);
        Puzzle::new("p-one", initial, solved_4x4()).unwrap()
    }

    /// Diagonal cleared; every empty cell has a forced correct value.
    fn diagonal_puzzle() -> Puzzle {
        let mut initial = solved_4x4();
        for i in 1..=4 {
            initial.set(i, i, 0);
        }
        Puzzle::new("p-diag", initial, solved_4x4()).unwrap()
    }

    fn engine(client: Arc<ScriptedClient>, config: PlayConfig) -> PlayEngine {
        PlayEngine::new(client, config)
    }

    #[tokio::test]
    async fn test_solves_trivial_puzzle() {
        let client = Arc::new(ScriptedClient::new(vec!["ROW: 4\nCOL: 4\nVALUE: 1"]));
        let session = engine(client, PlayConfig::default())
            .play(&one_cell_puzzle())
            .await
            .unwrap();

        assert!(session.solved);
        assert!(!session.abandoned);
        assert_eq!(session.total_moves, 1);
        assert_eq!(session.correct_moves, 1);
        assert!(session.counters_consistent());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_forbidden_loop_abandons_after_threshold() {
        // The model proposes the same out-of-range move every turn: first
        // turn invalid, every later turn forbidden, abandonment once the
        // streak hits the threshold.
        let client = Arc::new(ScriptedClient::new(vec!["ROW: 1\nCOL: 1\nVALUE: 5"]));
        let mut initial = solved_4x4();
        initial.set(1, 1, 0);
        let puzzle = Puzzle::new("p-loop", initial, solved_4x4()).unwrap();

        let session = engine(client, PlayConfig::default())
            .play(&puzzle)
            .await
            .unwrap();

        assert!(session.abandoned);
        assert!(session
            .abandon_reason
            .as_deref()
            .unwrap()
            .starts_with("consecutive_forbidden"));
        // 1 ordinary invalid + 10 consecutive forbidden rejections.
        assert_eq!(session.total_moves, 11);
        assert_eq!(session.invalid_moves, 11);
        assert!(session.counters_consistent());

        let first = &session.experiences[0];
        assert_eq!(first.mv.key(), (1, 1, 5));
        assert!(first.validation.reason.as_deref().unwrap().contains("out of bounds"));
        let second = &session.experiences[1];
        assert_eq!(
            second.validation.reason.as_deref(),
            Some(FORBIDDEN_REASON)
        );
    }

    #[tokio::test]
    async fn test_parse_failure_recorded_and_session_continues() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        let client = Arc::new(ScriptedClient::new(vec![
            "I'm thinking about it.",
            "ROW: 4\nCOL: 4\nVALUE: 1",
        ]));
        let session = engine(client, PlayConfig::default())
            .with_store(store.clone())
            .play(&one_cell_puzzle())
            .await
            .unwrap();

        assert!(session.solved);
        assert_eq!(session.total_moves, 2);
        assert_eq!(session.invalid_moves, 1);

        let failure = &session.experiences[0];
        assert_eq!(failure.mv.key(), (0, 0, 0));
        assert!(failure.parse_failure);
        assert_eq!(failure.validation.outcome, ValidationOutcome::Invalid);
        assert!(failure
            .validation
            .reason
            .as_deref()
            .unwrap()
            .starts_with("Parse failure:"));
        // The full response text is preserved as the sentinel's reasoning.
        assert_eq!(failure.mv.reasoning, "I'm thinking about it.");
        // And the failure was persisted.
        assert!(store.get_experience(&failure.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_row_move_lands_on_forbidden_list() {
        // "ROW: 0" parses structurally and is rejected by the oracle, not
        // the parser; repeating it must hit the forbidden list.
        let client = Arc::new(ScriptedClient::new(vec![
            "ROW: 0\nCOL: 5\nVALUE: 3",
            "ROW: 0\nCOL: 5\nVALUE: 3",
            "ROW: 4\nCOL: 4\nVALUE: 1",
        ]));
        let session = engine(client, PlayConfig::default())
            .play(&one_cell_puzzle())
            .await
            .unwrap();

        assert!(session.solved);
        assert_eq!(session.total_moves, 3);

        let first = &session.experiences[0];
        assert_eq!(first.mv.key(), (0, 5, 3));
        assert!(!first.parse_failure);
        assert!(first
            .validation
            .reason
            .as_deref()
            .unwrap()
            .contains("out of bounds"));
        assert_eq!(
            session.experiences[1].validation.reason.as_deref(),
            Some(FORBIDDEN_REASON)
        );
    }

    #[tokio::test]
    async fn test_forbidden_outlives_history_window() {
        // maxHistoryMoves=2: the bad move from turn 1 scrolls out of the
        // displayed history, but turn 5 must still be rejected from the
        // forbidden list.
        let client = Arc::new(ScriptedClient::new(vec![
            "ROW: 1\nCOL: 1\nVALUE: 5",
            "ROW: 2\nCOL: 2\nVALUE: 4",
            "ROW: 3\nCOL: 3\nVALUE: 4",
            "ROW: 4\nCOL: 4\nVALUE: 1",
            "ROW: 1\nCOL: 1\nVALUE: 5",
            "ROW: 1\nCOL: 1\nVALUE: 1",
        ]));
        let config = PlayConfig::default().with_max_history_moves(2);
        let session = engine(client, config)
            .play(&diagonal_puzzle())
            .await
            .unwrap();

        assert!(session.solved);
        assert_eq!(session.total_moves, 6);
        let replay = &session.experiences[4];
        assert_eq!(replay.mv.key(), (1, 1, 5));
        assert_eq!(replay.validation.reason.as_deref(), Some(FORBIDDEN_REASON));
        assert!(session.counters_consistent());
    }

    #[tokio::test]
    async fn test_valid_but_wrong_leaves_board_untouched() {
        let mut initial = Board::empty(4).unwrap();
        initial.set(1, 1, 1);
        let puzzle = Puzzle::new("p-sparse", initial, solved_4x4()).unwrap();

        let client = Arc::new(ScriptedClient::new(vec![
            "ROW: 2\nCOL: 3\nVALUE: 2", // legal but not the solution
            "ROW: 1\nCOL: 2\nVALUE: 2", // correct
        ]));
        let config = PlayConfig::default().with_max_moves(2);
        let session = engine(client, config).play(&puzzle).await.unwrap();

        assert_eq!(session.valid_but_wrong_moves, 1);
        assert_eq!(session.correct_moves, 1);
        // The wrong move was not applied: the next attempt saw an
        // identical board.
        assert_eq!(
            session.experiences[1].board_before,
            session.experiences[0].board_before
        );
        assert!(session.abandoned);
        assert_eq!(session.abandon_reason.as_deref(), Some("max_moves"));
    }

    #[tokio::test]
    async fn test_llm_error_abandons_with_detail() {
        let client = Arc::new(ScriptedClient::with_steps(vec![ScriptStep::Fail(
            "connection refused".to_string(),
        )]));
        let session = engine(client, PlayConfig::default())
            .play(&one_cell_puzzle())
            .await
            .unwrap();

        assert!(session.abandoned);
        let reason = session.abandon_reason.unwrap();
        assert!(reason.starts_with("llm_error:"));
        assert!(reason.contains("connection refused"));
        assert_eq!(session.total_moves, 0);
    }

    #[tokio::test]
    async fn test_memory_disabled_skips_store_and_few_shots() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        store
            .save_few_shots(
                "default",
                "default",
                &[FewShot {
                    situation: "s".into(),
                    analysis: "a".into(),
                    aisp: None,
                    example_move: Move::new(1, 1, 1, ""),
                    outcome: ValidationOutcome::Correct,
                    strategy_name: Some("visible-strategy".into()),
                    abstraction_level: 0,
                }],
            )
            .unwrap();

        let client = Arc::new(ScriptedClient::new(vec!["ROW: 4\nCOL: 4\nVALUE: 1"]));
        let config = PlayConfig::default().with_memory(false);
        let mut engine = PlayEngine::new(client.clone(), config).with_store(store.clone());
        engine.config.capture_prompts = true;
        let session = engine.play(&one_cell_puzzle()).await.unwrap();

        assert!(session.solved);
        assert_eq!(session.learning_context.few_shot_count, 0);
        // Nothing persisted, nothing injected.
        assert_eq!(
            store
                .stats()
                .unwrap()
                .by_type
                .get(crate::store::keys::TYPE_EXPERIENCE),
            None
        );
        let prompt = session.experiences[0].prompt.as_deref().unwrap();
        assert!(!prompt.contains("visible-strategy"));
    }

    #[tokio::test]
    async fn test_few_shots_injected_when_memory_on() {
        let store = Arc::new(ExperienceStore::in_memory().unwrap());
        store
            .save_few_shots(
                "default",
                "default",
                &[FewShot {
                    situation: "one cell left in a row".into(),
                    analysis: "fill it".into(),
                    aisp: None,
                    example_move: Move::new(1, 1, 1, ""),
                    outcome: ValidationOutcome::Correct,
                    strategy_name: Some("last-in-row".into()),
                    abstraction_level: 1,
                }],
            )
            .unwrap();

        let client = Arc::new(ScriptedClient::new(vec!["ROW: 4\nCOL: 4\nVALUE: 1"]));
        let mut config = PlayConfig::default();
        config.capture_prompts = true;
        let session = PlayEngine::new(client, config)
            .with_store(store)
            .play(&one_cell_puzzle())
            .await
            .unwrap();

        assert_eq!(session.learning_context.few_shot_count, 1);
        assert!(session.learning_context.patterns_available);
        let prompt = session.experiences[0].prompt.as_deref().unwrap();
        assert!(prompt.contains("last-in-row"));
    }

    #[tokio::test]
    async fn test_importance_and_context_captured() {
        let client = Arc::new(ScriptedClient::new(vec!["ROW: 4\nCOL: 4\nVALUE: 1"]));
        let session = engine(client, PlayConfig::default())
            .play(&one_cell_puzzle())
            .await
            .unwrap();

        let exp = &session.experiences[0];
        assert!(exp.importance > 0.0 && exp.importance <= 1.0);
        assert_eq!(exp.context.empty_cells, 1);
        assert!(exp.context.constraint_density > 0.0);
        assert_eq!(exp.move_number, 1);
        assert_eq!(exp.puzzle_fingerprint.len(), 16);
    }
}
