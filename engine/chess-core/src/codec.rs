//! Dense move encoding shared between the search and the evaluator.
//!
//! Policy heads emit one logit per encodable move; the mapping must be
//! stable across process runs and identical on both sides of the evaluator
//! contract. The layout is from-square x to-square (4096 slots, queen
//! promotions included) followed by an under-promotion block: 8 files x 3
//! capture directions x 3 pieces per side.

use chess::{ChessMove, File, Piece, Rank, Square};

/// Number of policy slots: 64*64 from-to pairs plus 2*72 under-promotions.
pub const POLICY_DIM: usize = 4240;

const UNDERPROMO_BASE: usize = 4096;
const UNDERPROMO_PER_SIDE: usize = 72;

fn underpromo_piece_index(piece: Piece) -> Option<usize> {
    match piece {
        Piece::Knight => Some(0),
        Piece::Bishop => Some(1),
        Piece::Rook => Some(2),
        // Queen promotions use the plain from-to slot.
        _ => None,
    }
}

/// Policy index of a move. Total over all legal chess moves this is
/// injective: under-promotions get their own block, everything else (queen
/// promotions included) keys by source and destination square.
pub fn move_to_policy_index(mv: ChessMove) -> usize {
    let from = mv.get_source();
    let to = mv.get_dest();

    if let Some(piece_ix) = mv.get_promotion().and_then(underpromo_piece_index) {
        let from_file = from.get_file().to_index();
        let delta = to.get_file().to_index() as isize - from_file as isize;
        debug_assert!((-1..=1).contains(&delta));
        // White promotes onto the eighth rank, black onto the first.
        let side = usize::from(to.get_rank() == Rank::First);
        return UNDERPROMO_BASE
            + side * UNDERPROMO_PER_SIDE
            + from_file * 9
            + ((delta + 1) as usize) * 3
            + piece_ix;
    }

    from.to_index() * 64 + to.to_index()
}

/// Pack a move into 16 bits for child-table storage:
/// bits 0..6 source, 6..12 destination, 12..15 promotion piece.
pub fn pack_move(mv: ChessMove) -> u16 {
    let promo = match mv.get_promotion() {
        None => 0u16,
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        Some(other) => unreachable!("promotion to {:?}", other),
    };
    mv.get_source().to_index() as u16
        | ((mv.get_dest().to_index() as u16) << 6)
        | (promo << 12)
}

/// Inverse of [`pack_move`].
pub fn unpack_move(packed: u16) -> ChessMove {
    let from = (packed & 0x3f) as usize;
    let to = ((packed >> 6) & 0x3f) as usize;
    let promo = match packed >> 12 {
        0 => None,
        1 => Some(Piece::Knight),
        2 => Some(Piece::Bishop),
        3 => Some(Piece::Rook),
        4 => Some(Piece::Queen),
        other => unreachable!("promotion tag {}", other),
    };
    ChessMove::new(square_from_index(from), square_from_index(to), promo)
}

fn square_from_index(index: usize) -> Square {
    Square::make_square(Rank::from_index(index / 8), File::from_index(index % 8))
}
