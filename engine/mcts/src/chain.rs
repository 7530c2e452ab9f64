//! Leaf evaluator chain.
//!
//! Each candidate leaf runs through a fixed, ordered list of evaluator
//! steps; the first step that can claim the leaf halts the chain. Terminal
//! positions and cache hits complete immediately, transpositions link to
//! the in-tree node that already holds statistics for the same position,
//! and everything else is deferred to the NN submission queue.

use std::sync::Arc;

use chess_core::{encode_position, EncodedPosition, PositionWithHistory};

use crate::cache::CachedEval;
use crate::config::SearchOptions;
use crate::node::NodeIndex;
use crate::tree::Tree;
use chess_core::TerminalKind;

/// How a leaf left the chain.
pub enum LeafClaim {
    /// Fixed-value leaf; backed up on every visit.
    Terminal(TerminalKind),
    /// Complete evaluation served from a cache (own or peer).
    Cached(Arc<CachedEval>),
    /// Another in-tree node with the same position and visits; its
    /// statistics are borrowed.
    Linked(NodeIndex),
    /// Deferred to the NN evaluator.
    NeedsNet(EncodedPosition),
}

/// The evaluator kinds the chain recognizes. A tagged list rather than open
/// dispatch: the set is closed and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainStep {
    Terminal,
    Cache,
    Transposition,
    PeerCache,
    NnSubmit,
}

pub struct EvaluatorChain {
    steps: Vec<ChainStep>,
}

impl EvaluatorChain {
    pub fn from_options(options: &SearchOptions) -> Self {
        let mut steps = vec![ChainStep::Terminal, ChainStep::Cache, ChainStep::Transposition];
        if options.reuse_position_evaluations_from_other_tree {
            steps.push(ChainStep::PeerCache);
        }
        steps.push(ChainStep::NnSubmit);
        Self { steps }
    }

    /// Run the chain for one leaf. Exactly one step claims it; the NN
    /// submission step at the end claims unconditionally.
    pub fn classify(
        &self,
        tree: &Tree,
        leaf: NodeIndex,
        position: &PositionWithHistory,
    ) -> LeafClaim {
        let hash = position.hash();
        for step in &self.steps {
            match step {
                ChainStep::Terminal => {
                    let kind = tree.node(leaf).terminal();
                    if kind.is_terminal() {
                        return LeafClaim::Terminal(kind);
                    }
                }
                ChainStep::Cache => {
                    if let Some(entry) = tree.cache().lookup(hash) {
                        return LeafClaim::Cached(entry);
                    }
                }
                ChainStep::Transposition => {
                    if let Some(target) = tree.find_transposition(hash, leaf) {
                        return LeafClaim::Linked(target);
                    }
                }
                ChainStep::PeerCache => {
                    if let Some(peer) = tree.peer_cache() {
                        if let Some(entry) = peer.lookup(hash) {
                            return LeafClaim::Cached(entry);
                        }
                    }
                }
                ChainStep::NnSubmit => {
                    return LeafClaim::NeedsNet(encode_position(position));
                }
            }
        }
        unreachable!("chain always ends in an NN submission step")
    }
}
