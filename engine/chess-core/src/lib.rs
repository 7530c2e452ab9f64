//! Chess position services for the search core
//!
//! This crate wraps the `chess` move generator with everything the search
//! needs that the raw board does not carry:
//! - `PositionWithHistory`: a board plus the move line that produced it,
//!   the 50-move clock, and the repetition window used for draw detection
//! - `TerminalKind`: terminal classification (checkmate / stalemate / draw)
//! - `codec`: a dense, stable move-to-policy-index mapping and a 16-bit
//!   packed move representation for child tables
//! - `encode`: the input-plane encoding handed to the neural evaluator

pub mod codec;
pub mod encode;
pub mod position;

pub use codec::{move_to_policy_index, pack_move, unpack_move, POLICY_DIM};
pub use encode::{encode_position, EncodedPosition, INPUT_LEN};
pub use position::{PositionError, PositionWithHistory, TerminalKind};
