//! Assembles the play-time prompt from board state, learning material, and
//! session history.

use crate::board::{Board, ValidationOutcome};
use crate::experience::{forbidden_moves, Experience, FewShot};

use super::aisp;
use super::AispMode;

/// Style toggles for prompt rendering.
#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub mode: AispMode,
    /// Strip strategy names and present patterns as `P1..Pn`.
    pub anonymous_patterns: bool,
    /// Insist on a structured constraint-intersection reasoning form.
    pub reasoning_template: bool,
    /// Surface past-move reasoning text in the history section.
    pub include_reasoning: bool,
    /// Cap on displayed history; the forbidden list ignores this cap.
    pub max_history_moves: usize,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            mode: AispMode::Off,
            anonymous_patterns: false,
            reasoning_template: false,
            include_reasoning: true,
            max_history_moves: 10,
        }
    }
}

/// Renders prompts for the play loop.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    options: PromptOptions,
}

impl PromptBuilder {
    pub fn new(options: PromptOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PromptOptions {
        &self.options
    }

    /// Build the full prompt.
    ///
    /// `experiences` is the session's FULL experience list: the history
    /// section shows only the last `max_history_moves` of it, but the
    /// forbidden section is derived from all of it so that moves proven
    /// wrong long ago are never reproposed.
    pub fn build(&self, board: &Board, few_shots: &[FewShot], experiences: &[Experience]) -> String {
        let mut prompt = String::new();
        self.push_header(&mut prompt, board.size());
        self.push_board(&mut prompt, board);
        self.push_strategies(&mut prompt, few_shots);
        self.push_forbidden(&mut prompt, experiences);
        self.push_history(&mut prompt, experiences);
        self.push_execute(&mut prompt);
        prompt
    }

    fn push_header(&self, out: &mut String, n: usize) {
        let bs = (n as f64).sqrt() as usize;
        match self.options.mode {
            AispMode::Off => {
                out.push_str(&format!(
                    "You are solving a {n}x{n} Sudoku puzzle.\n\
                     Rules: every row, every column, and every {bs}x{bs} box must \
                     contain each number from 1 to {n} exactly once. Empty cells \
                     are shown as 0. Rows and columns are numbered from 1.\n\n"
                ));
            }
            AispMode::AispLite => {
                out.push_str(&format!(
                    "⟦Γ:Sudoku.{n}⟧ ∀row,col,box: values 1..{n} once ∧ 0 ≔ empty ∧ index base 1\n\n"
                ));
            }
            AispMode::Aisp | AispMode::AispFull => {
                out.push_str(&format!(
                    "⟦Γ:Sudoku.{n}⟧{{grid≔{n}×{n};box≔{bs}×{bs};∀u∈rows∪cols∪boxes:u≡perm(1..{n});0≔empty;base≔1}}\n"
                ));
                if self.options.mode == AispMode::AispFull {
                    out.push('\n');
                    out.push_str(&aisp::generation_spec());
                }
                out.push('\n');
            }
        }
    }

    fn push_board(&self, out: &mut String, board: &Board) {
        out.push_str("Current board:\n");
        for row in board.rows() {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        out.push('\n');
    }

    fn push_strategies(&self, out: &mut String, few_shots: &[FewShot]) {
        if few_shots.is_empty() {
            return;
        }
        out.push_str("Learned strategies:\n");
        for (i, fs) in few_shots.iter().enumerate() {
            let label = if self.options.anonymous_patterns {
                format!("P{}", i + 1)
            } else {
                fs.strategy_name
                    .clone()
                    .unwrap_or_else(|| format!("P{}", i + 1))
            };
            out.push_str(&format!("[{label}] (level {})\n", fs.abstraction_level));
            out.push_str(&format!("  Situation: {}\n", fs.situation));
            match (&fs.aisp, self.options.mode.is_aisp()) {
                (Some(encoded), true) => out.push_str(&format!("  {encoded}\n")),
                _ => out.push_str(&format!("  Steps: {}\n", fs.analysis)),
            }
            out.push_str(&format!(
                "  Example: ROW: {} COL: {} VALUE: {}\n",
                fs.example_move.row, fs.example_move.col, fs.example_move.value
            ));
        }
        out.push('\n');
    }

    fn push_forbidden(&self, out: &mut String, experiences: &[Experience]) {
        let forbidden = forbidden_moves(experiences);
        if forbidden.is_empty() {
            return;
        }
        out.push_str(
            "FORBIDDEN MOVES (hard constraint — never propose any of these again):\n",
        );
        for f in &forbidden {
            out.push_str(&format!(
                "  ({}, {}) = {} — {}\n",
                f.row, f.col, f.value, f.reason
            ));
        }
        out.push('\n');
    }

    fn push_history(&self, out: &mut String, experiences: &[Experience]) {
        if experiences.is_empty() {
            return;
        }
        let start = experiences
            .len()
            .saturating_sub(self.options.max_history_moves);
        out.push_str("Recent moves:\n");
        for exp in &experiences[start..] {
            let marker = match exp.validation.outcome {
                ValidationOutcome::Correct => "[OK]",
                ValidationOutcome::Invalid => "[INVALID]",
                ValidationOutcome::ValidButWrong => "[WRONG]",
            };
            out.push_str(&format!(
                "  #{} ({}, {}) = {} {marker}",
                exp.move_number, exp.mv.row, exp.mv.col, exp.mv.value
            ));
            if self.options.include_reasoning && !exp.mv.reasoning.is_empty() {
                let reasoning = exp.mv.reasoning.replace('\n', " ");
                out.push_str(&format!(" — {reasoning}"));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    fn push_execute(&self, out: &mut String) {
        out.push_str("Propose exactly one move. Answer in this format:\n");
        out.push_str("ROW: <row number>\nCOL: <column number>\nVALUE: <value>\n");
        if self.options.reasoning_template {
            out.push_str(
                "REASONING: Row <r> already contains <...>; column <c> already \
                 contains <...>; box <b> already contains <...>; the only value \
                 that fits is <v>.\n",
            );
        } else {
            out.push_str("REASONING: <why this move follows from the board>\n");
        }
    }
}
