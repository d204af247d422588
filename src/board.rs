//! Board, move, and validation types plus the rules oracle.
//!
//! All public coordinates are 1-based; row 1/column 1 is the top-left cell
//! and values run 1..=N. Internal storage is a dense row-major grid with 0
//! meaning empty.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Supported grid sizes.
pub const SUPPORTED_SIZES: [usize; 4] = [4, 9, 16, 25];

/// An N×N grid of cell values in [0, N]; 0 means empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    cells: Vec<Vec<u8>>,
}

impl Board {
    /// Create a board from raw cells. The grid must be square with a
    /// supported size and every value in [0, N].
    pub fn new(cells: Vec<Vec<u8>>) -> Result<Self> {
        let n = cells.len();
        if !SUPPORTED_SIZES.contains(&n) {
            return Err(Error::Config(format!(
                "unsupported board size {n}; expected one of {SUPPORTED_SIZES:?}"
            )));
        }
        for (i, row) in cells.iter().enumerate() {
            if row.len() != n {
                return Err(Error::Config(format!(
                    "row {} has {} cells, expected {n}",
                    i + 1,
                    row.len()
                )));
            }
            if let Some(v) = row.iter().find(|&&v| v as usize > n) {
                return Err(Error::Config(format!(
                    "cell value {v} out of range for a {n}x{n} board"
                )));
            }
        }
        Ok(Self { cells })
    }

    /// Create an empty board of the given size.
    pub fn empty(size: usize) -> Result<Self> {
        Self::new(vec![vec![0; size]; size])
    }

    /// Grid size N.
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// Side length of a box (√N).
    pub fn box_size(&self) -> usize {
        (self.size() as f64).sqrt() as usize
    }

    /// Value at 1-based (row, col).
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.cells[row - 1][col - 1]
    }

    /// Set the value at 1-based (row, col).
    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        self.cells[row - 1][col - 1] = value;
    }

    /// Whether 1-based (row, col) is inside the grid.
    pub fn in_bounds(&self, row: usize, col: usize) -> bool {
        (1..=self.size()).contains(&row) && (1..=self.size()).contains(&col)
    }

    /// Number of empty cells.
    pub fn empty_count(&self) -> usize {
        self.cells
            .iter()
            .flat_map(|r| r.iter())
            .filter(|&&v| v == 0)
            .count()
    }

    /// Raw rows, for rendering.
    pub fn rows(&self) -> &[Vec<u8>] {
        &self.cells
    }

    /// Stable fingerprint of the current state: SHA-256 over the
    /// row-concatenated cell values, truncated to 16 hex characters.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for row in &self.cells {
            hasher.update(row);
        }
        let digest = hasher.finalize();
        digest
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Filled-peer counts of 1-based (row, col) along its row, column, and
    /// box, the cell itself excluded from each.
    pub fn peer_fill_counts(&self, row: usize, col: usize) -> (usize, usize, usize) {
        let n = self.size();
        let bs = self.box_size();
        let row_filled = (1..=n).filter(|&c| c != col && self.get(row, c) != 0).count();
        let col_filled = (1..=n).filter(|&r| r != row && self.get(r, col) != 0).count();
        let br = (row - 1) / bs * bs;
        let bc = (col - 1) / bs * bs;
        let mut box_filled = 0;
        for r in br + 1..=br + bs {
            for c in bc + 1..=bc + bs {
                if (r, c) != (row, col) && self.get(r, c) != 0 {
                    box_filled += 1;
                }
            }
        }
        (row_filled, col_filled, box_filled)
    }
}

/// A puzzle: an initial board plus its known solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Puzzle {
    pub id: String,
    pub initial: Board,
    pub solution: Board,
}

impl Puzzle {
    /// Create a puzzle, checking that the boards agree in size and the
    /// solution is complete and satisfies the Sudoku constraints.
    pub fn new(id: impl Into<String>, initial: Board, solution: Board) -> Result<Self> {
        if initial.size() != solution.size() {
            return Err(Error::Config(format!(
                "initial board is {}x{} but solution is {}x{}",
                initial.size(),
                initial.size(),
                solution.size(),
                solution.size()
            )));
        }
        if !is_solved(&solution) {
            return Err(Error::Config(
                "solution board is incomplete or violates constraints".into(),
            ));
        }
        Ok(Self {
            id: id.into(),
            initial,
            solution,
        })
    }

    /// Grid size N.
    pub fn size(&self) -> usize {
        self.initial.size()
    }
}

/// A proposed move: 1-based coordinates, value, and the model's free-text
/// reasoning. Parse failures are recorded as the (0,0,0) sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub row: usize,
    pub col: usize,
    pub value: u8,
    #[serde(default)]
    pub reasoning: String,
}

impl Move {
    pub fn new(row: usize, col: usize, value: u8, reasoning: impl Into<String>) -> Self {
        Self {
            row,
            col,
            value,
            reasoning: reasoning.into(),
        }
    }

    /// The sentinel move recorded for unparseable responses.
    pub fn sentinel(reasoning: impl Into<String>) -> Self {
        Self::new(0, 0, 0, reasoning)
    }

    /// The (row, col, value) triple, as tracked by the forbidden list.
    pub fn key(&self) -> (usize, usize, u8) {
        (self.row, self.col, self.value)
    }
}

/// Outcome of validating a move against the rules and the known solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Matches the solution.
    Correct,
    /// Violates a row/column/box constraint, targets a filled cell, or is
    /// out of bounds.
    Invalid,
    /// Legal under Sudoku rules but not the solution's value for that cell.
    ValidButWrong,
}

impl std::fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Correct => write!(f, "correct"),
            Self::Invalid => write!(f, "invalid"),
            Self::ValidButWrong => write!(f, "valid_but_wrong"),
        }
    }
}

/// A validation verdict with its human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub outcome: ValidationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validation {
    pub fn correct() -> Self {
        Self {
            outcome: ValidationOutcome::Correct,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            outcome: ValidationOutcome::Invalid,
            reason: Some(reason.into()),
        }
    }

    pub fn valid_but_wrong(reason: impl Into<String>) -> Self {
        Self {
            outcome: ValidationOutcome::ValidButWrong,
            reason: Some(reason.into()),
        }
    }

    /// A move is valid unless its outcome is `Invalid`.
    pub fn is_valid(&self) -> bool {
        self.outcome != ValidationOutcome::Invalid
    }

    pub fn is_correct(&self) -> bool {
        self.outcome == ValidationOutcome::Correct
    }
}

/// Validate a candidate move against the current board and the solution.
///
/// Checks short-circuit in order: bounds, already-filled target, row/column/
/// box conflicts (the violated axis is named in the reason), then solution
/// agreement.
pub fn validate_move(board: &Board, mv: &Move, solution: &Board) -> Validation {
    let n = board.size();

    if !board.in_bounds(mv.row, mv.col) || mv.value == 0 || mv.value as usize > n {
        return Validation::invalid(format!(
            "out of bounds: ({}, {}) value {} on a {n}x{n} board",
            mv.row, mv.col, mv.value
        ));
    }

    if board.get(mv.row, mv.col) != 0 {
        return Validation::invalid(format!(
            "cell ({}, {}) is already filled with {}",
            mv.row,
            mv.col,
            board.get(mv.row, mv.col)
        ));
    }

    for c in 1..=n {
        if board.get(mv.row, c) == mv.value {
            return Validation::invalid(format!("{} already appears in row {}", mv.value, mv.row));
        }
    }
    for r in 1..=n {
        if board.get(r, mv.col) == mv.value {
            return Validation::invalid(format!(
                "{} already appears in column {}",
                mv.value, mv.col
            ));
        }
    }
    let bs = board.box_size();
    let br = (mv.row - 1) / bs * bs;
    let bc = (mv.col - 1) / bs * bs;
    for r in br + 1..=br + bs {
        for c in bc + 1..=bc + bs {
            if board.get(r, c) == mv.value {
                return Validation::invalid(format!(
                    "{} already appears in the box containing ({}, {})",
                    mv.value, mv.row, mv.col
                ));
            }
        }
    }

    if mv.value != solution.get(mv.row, mv.col) {
        return Validation::valid_but_wrong(format!(
            "{} at ({}, {}) is legal but does not match the solution",
            mv.value, mv.row, mv.col
        ));
    }

    Validation::correct()
}

/// Whether the board is complete and satisfies every row, column, and box
/// constraint.
pub fn is_solved(board: &Board) -> bool {
    let n = board.size();
    let bs = board.box_size();
    let full = |values: &mut dyn Iterator<Item = u8>| -> bool {
        let mut seen = vec![false; n + 1];
        for v in values {
            if v == 0 || seen[v as usize] {
                return false;
            }
            seen[v as usize] = true;
        }
        true
    };

    for r in 1..=n {
        if !full(&mut (1..=n).map(|c| board.get(r, c))) {
            return false;
        }
    }
    for c in 1..=n {
        if !full(&mut (1..=n).map(|r| board.get(r, c))) {
            return false;
        }
    }
    for br in 0..bs {
        for bc in 0..bs {
            let mut values = (1..=bs)
                .flat_map(|r| (1..=bs).map(move |c| (br * bs + r, bc * bs + c)))
                .map(|(r, c)| board.get(r, c));
            if !full(&mut values) {
                return false;
            }
        }
    }
    true
}
