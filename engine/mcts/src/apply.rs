//! Backup of evaluated batches into the tree.
//!
//! For each leaf the applier writes the evaluation (policy, value heads)
//! exactly once, then walks the parent links to the root adding the visit
//! to every ancestor and clearing this lane's virtual loss. Value and
//! win/loss flip perspective at every ply; the moves-left estimate grows
//! by one per ply.

use tracing::trace;

use chess_core::{pack_move, unpack_move, TerminalKind};

use crate::cache::{CacheMode, CachedEval};
use crate::chain::LeafClaim;
use crate::evaluator::{legal_priors, NetOutput};
use crate::manager::SearchError;
use crate::node::NodeIndex;
use crate::selector::{LeafBatch, LeafEntry};
use crate::tree::Tree;

/// Backed-up heads for one leaf, in the leaf's side-to-move perspective.
#[derive(Clone, Copy)]
struct Backup {
    value: f64,
    draw: f64,
    loss: f64,
    moves_left: f64,
}

pub struct BatchApplier<'t> {
    tree: &'t Tree,
    lane: usize,
}

impl<'t> BatchApplier<'t> {
    pub fn new(tree: &'t Tree, lane: usize) -> Self {
        Self { tree, lane }
    }

    /// Apply a batch. `outputs` must hold one result per `NeedsNet` entry,
    /// in entry order; `secondary` likewise when a second network ran. On
    /// an error (store exhaustion, tree inconsistency) the unapplied
    /// remainder of the batch is rolled back and the tree is left
    /// consistent.
    pub fn apply(
        &self,
        batch: &LeafBatch,
        outputs: &[NetOutput],
        secondary: Option<&[NetOutput]>,
    ) -> Result<(), SearchError> {
        let mut out_ix = 0usize;
        for (i, entry) in batch.entries.iter().enumerate() {
            let result = match &entry.claim {
                LeafClaim::Terminal(kind) => Ok(terminal_backup(*kind)),
                LeafClaim::Cached(cached) => self.expand_from_cache(entry.node, cached),
                LeafClaim::Linked(target) => Ok(self.link(entry.node, *target)),
                LeafClaim::NeedsNet(encoded) => {
                    let output = &outputs[out_ix];
                    if let Some(second) = secondary {
                        self.tree
                            .node(entry.node)
                            .set_v_secondary(second[out_ix].value.clamp(-1.0, 1.0));
                    }
                    out_ix += 1;
                    self.expand_from_net(entry.node, &encoded.legal, encoded.hash, output)
                }
            };

            match result {
                Ok(backup) => self.backup(entry, backup),
                Err(err) => {
                    self.rollback_entries(&batch.entries[i..]);
                    return Err(err);
                }
            }
        }
        debug_assert_eq!(out_ix, outputs.len(), "unconsumed evaluator outputs");
        Ok(())
    }

    /// Undo the virtual losses and expansion claims of entries that will
    /// never be backed up (evaluator failure, store exhaustion).
    pub fn rollback(&self, batch: &LeafBatch) {
        self.rollback_entries(&batch.entries);
    }

    fn rollback_entries(&self, entries: &[LeafEntry]) {
        for entry in entries {
            self.tree.node(entry.node).release_claim();
            self.undo_path(entry.node);
        }
    }

    fn undo_path(&self, leaf: NodeIndex) {
        let mut cursor = leaf;
        while cursor != self.tree.root() && !cursor.is_null() {
            let node = self.tree.node(cursor);
            node.sub_inflight(self.lane);
            cursor = node.parent();
        }
    }

    fn expand_from_net(
        &self,
        leaf: NodeIndex,
        legal: &[chess::ChessMove],
        hash: u64,
        output: &NetOutput,
    ) -> Result<Backup, SearchError> {
        let node = self.tree.node(leaf);
        let value = output.value.clamp(-1.0, 1.0);

        if legal.is_empty() {
            // Terminal detection runs before NN submission, so a legal-move
            // count of zero here means the chain and the movegen disagree.
            // That is fatal to the search; the caller rolls this leaf back.
            return Err(SearchError::InconsistentTree(leaf));
        }

        let priors = legal_priors(&output.policy_logits, legal);
        let start = self.tree.store().alloc_children(legal.len())?;
        for (slot, (&mv, &prior)) in self
            .tree
            .store()
            .child_slots(start, legal.len())
            .iter()
            .zip(legal.iter().zip(&priors))
        {
            slot.write(mv, prior);
        }
        node.set_v(value);
        node.publish_children(start, legal.len() as u16);
        self.tree.register_transposition(hash, leaf);

        if self.tree.cache().mode() == CacheMode::ReadWrite {
            let policy = legal
                .iter()
                .zip(&priors)
                .map(|(&mv, &p)| (pack_move(mv), p))
                .collect();
            self.tree.cache().insert(
                hash,
                CachedEval {
                    value,
                    wdl: output.wdl,
                    moves_left: output.moves_left,
                    policy,
                },
            );
        }

        Ok(Backup {
            value: value as f64,
            draw: output.wdl[1] as f64,
            loss: output.wdl[2] as f64,
            moves_left: output.moves_left as f64,
        })
    }

    fn expand_from_cache(
        &self,
        leaf: NodeIndex,
        cached: &CachedEval,
    ) -> Result<Backup, SearchError> {
        let node = self.tree.node(leaf);
        node.set_v(cached.value);

        if cached.policy.is_empty() {
            // Value-only entry: back it up but leave the leaf unexpanded
            // so a later visit can still produce a policy.
            node.release_claim();
        } else {
            let count = cached.policy.len();
            let start = self.tree.store().alloc_children(count)?;
            for (slot, &(packed, prior)) in self
                .tree
                .store()
                .child_slots(start, count)
                .iter()
                .zip(cached.policy.iter())
            {
                slot.write(unpack_move(packed), prior);
            }
            node.publish_children(start, count as u16);
            self.tree.register_transposition(node.hash(), leaf);
        }

        Ok(Backup {
            value: cached.value as f64,
            draw: cached.wdl[1] as f64,
            loss: cached.wdl[2] as f64,
            moves_left: cached.moves_left as f64,
        })
    }

    /// Borrow statistics from the transposition target without allocating
    /// children under the leaf.
    fn link(&self, leaf: NodeIndex, target: NodeIndex) -> Backup {
        let node = self.tree.node(leaf);
        let linked = self.tree.node(target);
        if node.transposition_link().is_null() {
            node.set_transposition_link(target);
            node.set_v(linked.q_or_v());
            node.publish_leaf();
        }
        let wdl = linked.wdl();
        Backup {
            value: linked.q_or_v() as f64,
            draw: wdl[1] as f64,
            loss: wdl[2] as f64,
            moves_left: linked.m_avg() as f64,
        }
    }

    fn backup(&self, entry: &LeafEntry, leaf_backup: Backup) {
        let Backup {
            mut value,
            draw,
            mut loss,
            mut moves_left,
        } = leaf_backup;

        let mut cursor = entry.node;
        loop {
            let node = self.tree.node(cursor);
            node.add_visit(value, draw, loss, moves_left);
            if cursor == self.tree.root() {
                break;
            }
            node.sub_inflight(self.lane);
            // Parent perspective: value negates, win and loss swap, the
            // game is one ply longer.
            value = -value;
            loss = 1.0 - draw - loss;
            moves_left += 1.0;
            cursor = node.parent();
        }

        trace!(
            lane = self.lane,
            leaf = entry.node.0,
            depth = entry.depth,
            value = leaf_backup.value,
            "backup complete"
        );
    }
}

/// Fixed heads for terminal leaves, side-to-move perspective: a checkmated
/// side scores -1, stalemates and draws score 0 with certain draw mass.
fn terminal_backup(kind: TerminalKind) -> Backup {
    match kind {
        TerminalKind::Checkmate => Backup {
            value: -1.0,
            draw: 0.0,
            loss: 1.0,
            moves_left: 0.0,
        },
        _ => Backup {
            value: 0.0,
            draw: 1.0,
            loss: 0.0,
            moves_left: 0.0,
        },
    }
}

#[cfg(test)]
#[path = "apply_tests.rs"]
mod tests;
