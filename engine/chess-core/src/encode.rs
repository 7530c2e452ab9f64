//! Input-plane encoding for the neural evaluator.
//!
//! Twelve 64-square piece planes (white then black, pawn through king),
//! then a handful of scalar features: side to move, the four castling
//! rights, the scaled halfmove clock, and the repetition count.

use chess::{ChessMove, Color, ALL_PIECES};

use crate::position::PositionWithHistory;

const PIECE_PLANES: usize = 12;
const SCALARS: usize = 7;

/// Length of the flat input vector handed to the evaluator.
pub const INPUT_LEN: usize = PIECE_PLANES * 64 + SCALARS;

/// A position encoded for one evaluator call, together with the metadata
/// the applier needs when the result comes back.
#[derive(Debug, Clone)]
pub struct EncodedPosition {
    /// Position key (includes repetition bucket), used for cache writes.
    pub hash: u64,
    /// Flat input planes, [`INPUT_LEN`] long.
    pub planes: Box<[f32]>,
    /// Legal moves in generator order; priors are extracted for exactly
    /// these from the dense policy head.
    pub legal: Vec<ChessMove>,
}

/// Encode a position into evaluator input planes.
pub fn encode_position(pos: &PositionWithHistory) -> EncodedPosition {
    let board = pos.board();
    let mut planes = vec![0.0f32; INPUT_LEN];

    for (color_ix, color) in [Color::White, Color::Black].into_iter().enumerate() {
        for (piece_ix, piece) in ALL_PIECES.into_iter().enumerate() {
            let plane = (color_ix * 6 + piece_ix) * 64;
            let bb = *board.pieces(piece) & *board.color_combined(color);
            for sq in bb {
                planes[plane + sq.to_index()] = 1.0;
            }
        }
    }

    let base = PIECE_PLANES * 64;
    planes[base] = if board.side_to_move() == Color::White { 1.0 } else { 0.0 };
    let white_rights = board.castle_rights(Color::White);
    let black_rights = board.castle_rights(Color::Black);
    planes[base + 1] = white_rights.has_kingside() as u8 as f32;
    planes[base + 2] = white_rights.has_queenside() as u8 as f32;
    planes[base + 3] = black_rights.has_kingside() as u8 as f32;
    planes[base + 4] = black_rights.has_queenside() as u8 as f32;
    planes[base + 5] = pos.halfmove_clock() as f32 / 100.0;
    planes[base + 6] = pos.repetitions() as f32 / 2.0;

    EncodedPosition {
        hash: pos.hash(),
        planes: planes.into_boxed_slice(),
        legal: pos.legal_moves(),
    }
}
