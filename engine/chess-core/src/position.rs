//! Board state plus the history the bare board does not remember.
//!
//! The `chess` crate's `Board` is a pure position: it knows nothing about
//! how it was reached, so it cannot detect threefold repetition or the
//! 50-move rule on its own. `PositionWithHistory` carries the move line,
//! the halfmove clock, and the window of position hashes since the last
//! irreversible move.

use std::str::FromStr;

use chess::{Board, BoardStatus, ChessMove, Color, MoveGen, Piece};
use thiserror::Error;

/// Hash perturbations folded in per repetition count, so that a position
/// seen for the second time keys differently in the evaluation cache than
/// its first occurrence.
const REPETITION_KEYS: [u64; 3] = [0, 0x9e37_79b9_7f4a_7c15, 0xbf58_476d_1ce4_e5b9];

/// Terminal classification of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    NonTerminal,
    /// Side to move is checkmated.
    Checkmate,
    /// Drawn by the 50-move rule, threefold repetition, or bare kings.
    Draw,
    Stalemate,
}

impl TerminalKind {
    #[inline]
    pub fn is_terminal(self) -> bool {
        self != TerminalKind::NonTerminal
    }
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),

    #[error("illegal move {mv} in position {fen}")]
    IllegalMove { mv: String, fen: String },
}

/// A chess position together with the line that produced it.
#[derive(Debug, Clone)]
pub struct PositionWithHistory {
    start: Board,
    board: Board,
    moves: Vec<ChessMove>,
    /// Hashes of every position since the last irreversible move, most
    /// recent last. The current position's hash is always the last entry.
    repetition_window: Vec<u64>,
    halfmove_clock: u32,
}

impl PositionWithHistory {
    /// The standard starting position.
    pub fn startpos() -> Self {
        Self::new(Board::default())
    }

    /// A fresh history rooted at `board`. The halfmove clock starts at zero;
    /// use [`PositionWithHistory::from_fen`] when the clock matters.
    pub fn new(board: Board) -> Self {
        Self {
            start: board,
            board,
            moves: Vec::new(),
            repetition_window: vec![board.get_hash()],
            halfmove_clock: 0,
        }
    }

    /// Parse a FEN string, preserving its halfmove-clock field.
    pub fn from_fen(fen: &str) -> Result<Self, PositionError> {
        let board = Board::from_str(fen).map_err(|_| PositionError::InvalidFen(fen.into()))?;
        let halfmove_clock = fen
            .split_whitespace()
            .nth(4)
            .and_then(|f| f.parse().ok())
            .unwrap_or(0);
        let mut pos = Self::new(board);
        pos.halfmove_clock = halfmove_clock;
        Ok(pos)
    }

    #[inline]
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// The board this history started from (before any pushed moves).
    #[inline]
    pub fn start_board(&self) -> &Board {
        &self.start
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    /// Moves pushed since the starting board.
    #[inline]
    pub fn moves(&self) -> &[ChessMove] {
        &self.moves
    }

    #[inline]
    pub fn halfmove_clock(&self) -> u32 {
        self.halfmove_clock
    }

    /// 64-bit position key: the board's incremental hash (piece placement,
    /// side to move, castling, en passant) folded with the repetition count
    /// so repeats key differently from first occurrences.
    pub fn hash(&self) -> u64 {
        let reps = self.repetitions().min(2) as usize;
        self.board.get_hash() ^ REPETITION_KEYS[reps]
    }

    /// How many times the current position has occurred before in the
    /// reversible window (0 for a first occurrence).
    pub fn repetitions(&self) -> u32 {
        let current = self.board.get_hash();
        let seen = self
            .repetition_window
            .iter()
            .filter(|&&h| h == current)
            .count() as u32;
        seen.saturating_sub(1)
    }

    /// Legal moves in the generator's stable order.
    pub fn legal_moves(&self) -> Vec<ChessMove> {
        MoveGen::new_legal(&self.board).collect()
    }

    /// Apply a move, updating the clock and repetition window. The move is
    /// assumed legal; use [`PositionWithHistory::try_push`] to verify.
    pub fn push(&mut self, mv: ChessMove) {
        let is_pawn = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        let dest_occupied = self.board.piece_on(mv.get_dest()).is_some();
        // A pawn changing file onto an empty square is an en-passant capture.
        let en_passant = is_pawn
            && !dest_occupied
            && mv.get_source().get_file() != mv.get_dest().get_file();
        let irreversible = is_pawn || dest_occupied || en_passant;

        self.board = self.board.make_move_new(mv);
        self.moves.push(mv);

        if irreversible {
            self.halfmove_clock = 0;
            self.repetition_window.clear();
        } else {
            self.halfmove_clock += 1;
        }
        self.repetition_window.push(self.board.get_hash());
    }

    /// Apply a move only if it is legal in the current position.
    pub fn try_push(&mut self, mv: ChessMove) -> Result<(), PositionError> {
        if MoveGen::new_legal(&self.board).any(|m| m == mv) {
            self.push(mv);
            Ok(())
        } else {
            Err(PositionError::IllegalMove {
                mv: mv.to_string(),
                fen: format!("{}", self.board),
            })
        }
    }

    /// Terminal classification, including the history-dependent draws the
    /// bare board cannot see.
    pub fn terminal(&self) -> TerminalKind {
        match self.board.status() {
            BoardStatus::Checkmate => TerminalKind::Checkmate,
            BoardStatus::Stalemate => TerminalKind::Stalemate,
            BoardStatus::Ongoing => {
                if self.halfmove_clock >= 100
                    || self.repetitions() >= 2
                    || self.board.combined().popcnt() == 2
                {
                    TerminalKind::Draw
                } else {
                    TerminalKind::NonTerminal
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::{File, Rank, Square};

    fn mv(from: (File, Rank), to: (File, Rank)) -> ChessMove {
        ChessMove::new(
            Square::make_square(from.1, from.0),
            Square::make_square(to.1, to.0),
            None,
        )
    }

    #[test]
    fn startpos_has_twenty_moves() {
        let pos = PositionWithHistory::startpos();
        assert_eq!(pos.legal_moves().len(), 20);
        assert_eq!(pos.terminal(), TerminalKind::NonTerminal);
    }

    #[test]
    fn push_updates_clock_and_window() {
        let mut pos = PositionWithHistory::startpos();
        pos.push(mv((File::E, Rank::Second), (File::E, Rank::Fourth)));
        // Pawn move resets the clock and the repetition window.
        assert_eq!(pos.halfmove_clock(), 0);
        assert_eq!(pos.repetitions(), 0);

        pos.push(mv((File::G, Rank::Eighth), (File::F, Rank::Sixth)));
        assert_eq!(pos.halfmove_clock(), 1);
    }

    #[test]
    fn threefold_repetition_is_draw() {
        let mut pos = PositionWithHistory::startpos();
        // Shuffle knights back and forth until the start position (with the
        // same side to move) has occurred three times.
        let shuffle = [
            mv((File::G, Rank::First), (File::F, Rank::Third)),
            mv((File::G, Rank::Eighth), (File::F, Rank::Sixth)),
            mv((File::F, Rank::Third), (File::G, Rank::First)),
            mv((File::F, Rank::Sixth), (File::G, Rank::Eighth)),
        ];
        for _ in 0..2 {
            for m in shuffle {
                pos.push(m);
            }
        }
        assert_eq!(pos.repetitions(), 2);
        assert_eq!(pos.terminal(), TerminalKind::Draw);
    }

    #[test]
    fn repetition_changes_cache_key() {
        let mut pos = PositionWithHistory::startpos();
        let first = pos.hash();
        let shuffle = [
            mv((File::G, Rank::First), (File::F, Rank::Third)),
            mv((File::G, Rank::Eighth), (File::F, Rank::Sixth)),
            mv((File::F, Rank::Third), (File::G, Rank::First)),
            mv((File::F, Rank::Sixth), (File::G, Rank::Eighth)),
        ];
        for m in shuffle {
            pos.push(m);
        }
        assert_eq!(pos.board().get_hash(), PositionWithHistory::startpos().board().get_hash());
        assert_ne!(pos.hash(), first);
    }

    #[test]
    fn fen_halfmove_clock_is_kept() {
        let pos = PositionWithHistory::from_fen(
            "6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 37 60",
        )
        .unwrap();
        assert_eq!(pos.halfmove_clock(), 37);
    }

    #[test]
    fn checkmate_is_detected() {
        // Fool's mate.
        let pos = PositionWithHistory::from_fen(
            "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3",
        )
        .unwrap();
        assert_eq!(pos.terminal(), TerminalKind::Checkmate);
        assert!(pos.legal_moves().is_empty());
    }

    #[test]
    fn illegal_push_is_rejected() {
        let mut pos = PositionWithHistory::startpos();
        let bad = mv((File::E, Rank::Second), (File::E, Rank::Fifth));
        assert!(pos.try_push(bad).is_err());
        assert!(pos.moves().is_empty());
    }
}
