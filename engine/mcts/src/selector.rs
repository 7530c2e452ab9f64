//! PUCT leaf selection with per-lane virtual loss.
//!
//! A selector repeatedly descends from the root, scoring children by
//! `Q + cpuct * P * sqrt(sum_N) / (1 + N)` where visit counts include the
//! in-flight visits of both lanes. Chosen edges accumulate virtual loss so
//! one batch spreads over distinct leaves instead of hammering the PUCT
//! maximizer. Descents that run into a leaf already claimed by someone
//! else are undone and counted as collisions; a batch gives up after a
//! bounded number of wasted descents.

use rustc_hash::FxHashSet;
use tracing::trace;

use chess_core::PositionWithHistory;

use crate::chain::{EvaluatorChain, LeafClaim};
use crate::config::SearchOptions;
use crate::node::{Node, NodeIndex};
use crate::store::{ChildSlot, StoreError};
use crate::tree::Tree;

/// One selected leaf, ready for evaluation and backup. The path back to
/// the root is implicit in the parent links.
pub struct LeafEntry {
    pub node: NodeIndex,
    pub depth: u16,
    pub claim: LeafClaim,
}

/// A batch of selected leaves.
pub struct LeafBatch {
    pub entries: Vec<LeafEntry>,
    pub collisions: u32,
}

impl LeafBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct LeafSelector<'t> {
    tree: &'t Tree,
    chain: &'t EvaluatorChain,
    options: &'t SearchOptions,
    lane: usize,
}

enum Descent {
    Leaf(LeafEntry),
    Collision,
}

impl<'t> LeafSelector<'t> {
    pub fn new(
        tree: &'t Tree,
        chain: &'t EvaluatorChain,
        options: &'t SearchOptions,
        lane: usize,
    ) -> Self {
        Self {
            tree,
            chain,
            options,
            lane,
        }
    }

    /// Collect up to `target` distinct leaves.
    pub fn collect(&self, target: usize) -> Result<LeafBatch, StoreError> {
        let mut entries = Vec::with_capacity(target);
        let mut pending: FxHashSet<NodeIndex> = FxHashSet::default();
        let mut collisions = 0u32;

        while entries.len() < target {
            let fill = entries.len() as f32 / target.max(1) as f32;
            match self.descend(&mut pending, fill)? {
                Descent::Leaf(entry) => entries.push(entry),
                Descent::Collision => {
                    collisions += 1;
                    if collisions as usize >= self.options.max_wasted_descents_per_batch {
                        break;
                    }
                }
            }
        }

        trace!(
            lane = self.lane,
            leaves = entries.len(),
            collisions,
            "batch collected"
        );
        Ok(LeafBatch {
            entries,
            collisions,
        })
    }

    /// One descent from the root. Adds one unit of virtual loss to every
    /// node it moves into; a collision undoes them before returning.
    fn descend(
        &self,
        pending: &mut FxHashSet<NodeIndex>,
        batch_fill: f32,
    ) -> Result<Descent, StoreError> {
        let mut position = self.tree.root_position().clone();
        let mut current = self.tree.root();
        let mut depth = 0u16;

        loop {
            let node = self.tree.node(current);

            // Fixed-value leaves (terminal or transposition-linked) are
            // backed up on every visit, but only once per batch.
            let terminal = node.terminal();
            if terminal.is_terminal() {
                if !pending.insert(current) {
                    self.undo_path(current);
                    return Ok(Descent::Collision);
                }
                return Ok(Descent::Leaf(LeafEntry {
                    node: current,
                    depth,
                    claim: LeafClaim::Terminal(terminal),
                }));
            }
            let link = node.transposition_link();
            if !link.is_null() {
                if !pending.insert(current) {
                    self.undo_path(current);
                    return Ok(Descent::Collision);
                }
                // A link whose target was detached (and possibly recycled)
                // by a re-root falls back to the node's own statistics.
                let linked = self.tree.node(link);
                let target = if linked.generation() == self.tree.generation()
                    && linked.hash() == node.hash()
                {
                    link
                } else {
                    current
                };
                return Ok(Descent::Leaf(LeafEntry {
                    node: current,
                    depth,
                    claim: LeafClaim::Linked(target),
                }));
            }

            // Childless but evaluated (an orphaned transposition target):
            // a fixed-value leaf that backs up its own running average.
            if node.is_expanded() && node.num_children() == 0 {
                if !pending.insert(current) {
                    self.undo_path(current);
                    return Ok(Descent::Collision);
                }
                return Ok(Descent::Leaf(LeafEntry {
                    node: current,
                    depth,
                    claim: LeafClaim::Linked(current),
                }));
            }

            if !node.is_expanded() {
                // Unexpanded leaf: the expansion claim is the exclusive
                // ticket into the evaluation queue.
                if node.try_claim_expansion() {
                    let claim = self.chain.classify(self.tree, current, &position);
                    return Ok(Descent::Leaf(LeafEntry {
                        node: current,
                        depth,
                        claim,
                    }));
                }
                self.undo_path(current);
                return Ok(Descent::Collision);
            }

            let slots = self.tree.children_of(node);
            debug_assert!(
                !slots.is_empty(),
                "expanded non-terminal node {:?} has no children",
                current
            );

            let choice = self.pick_child(node, slots, batch_fill);
            let slot = &slots[choice];
            position.push(slot.mv());

            let child = match slot.child() {
                c if c.is_null() => self.tree.materialize_child(current, choice, &position)?,
                c => c,
            };
            self.tree.node(child).add_inflight(self.lane);
            depth += 1;
            current = child;
        }
    }

    /// Index of the PUCT-maximizing child. Ties break toward higher prior,
    /// then lower index.
    fn pick_child(&self, node: &Node, slots: &[ChildSlot], batch_fill: f32) -> usize {
        let stats: Vec<(u32, u32, f32)> = slots
            .iter()
            .map(|slot| {
                let child = slot.child();
                if child.is_null() {
                    (0, 0, 0.0)
                } else {
                    let c = self.tree.node(child);
                    (c.n(), c.inflight_total(), c.q())
                }
            })
            .collect();

        let sum_n: u32 = stats.iter().map(|&(n, infl, _)| n + infl).sum();
        let sqrt_sum = (sum_n.max(1) as f32).sqrt();
        let cpuct = self.options.cpuct_init
            + self.options.cpuct_factor
                * ((sum_n as f32 + self.options.cpuct_base + 1.0) / self.options.cpuct_base).ln();

        let parent_q = node.q_or_v();
        let explored_mass: f32 = slots
            .iter()
            .zip(&stats)
            .filter(|(_, &(n, _, _))| n > 0)
            .map(|(slot, _)| slot.prior())
            .sum();
        let fpu = parent_q - self.options.fpu_reduction * explored_mass.max(0.0).sqrt();

        let vloss = self.options.virtual_loss_weight
            * if self.options.use_dynamic_vloss {
                1.0 + batch_fill
            } else {
                1.0
            };

        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        let mut best_prior = f32::NEG_INFINITY;
        for (i, (slot, &(n, infl, q_child))) in slots.iter().zip(&stats).enumerate() {
            let n_eff = n + infl;
            // Child statistics are in the child's perspective; negate for
            // ours. Each in-flight visit counts as a full loss.
            let q = if n_eff == 0 {
                fpu
            } else {
                (-q_child * n as f32 - vloss * infl as f32) / n_eff as f32
            };
            let u = cpuct * slot.prior() * sqrt_sum / (1.0 + n_eff as f32);
            let score = q + u;

            if score > best_score || (score == best_score && slot.prior() > best_prior) {
                best = i;
                best_score = score;
                best_prior = slot.prior();
            }
        }
        best
    }

    /// Undo the virtual loss of a failed descent: every node from `leaf` up
    /// to (but excluding) the root carries one unit from this lane.
    fn undo_path(&self, leaf: NodeIndex) {
        let mut cursor = leaf;
        while cursor != self.tree.root() && !cursor.is_null() {
            let node = self.tree.node(cursor);
            node.sub_inflight(self.lane);
            cursor = node.parent();
        }
    }

    /// Claim the root itself as a leaf (start of a fresh search).
    pub(crate) fn claim_root(&self) -> Option<LeafEntry> {
        let root = self.tree.root();
        let node = self.tree.node(root);
        if node.is_expanded() || node.terminal().is_terminal() {
            return None;
        }
        node.try_claim_expansion().then(|| LeafEntry {
            node: root,
            depth: 0,
            claim: self
                .chain
                .classify(self.tree, root, self.tree.root_position()),
        })
    }

    /// Claim every child of `parent` as a leaf (root preloading). Children
    /// already claimed, expanded or fixed are visited as such; each entry
    /// carries virtual loss along its full path.
    pub(crate) fn collect_children_of(
        &self,
        parent: NodeIndex,
        parent_position: &PositionWithHistory,
    ) -> Result<LeafBatch, StoreError> {
        let parent_node = self.tree.node(parent);
        let count = parent_node.num_children() as usize;
        let mut entries = Vec::with_capacity(count);
        let mut collisions = 0;
        let parent_depth = self.depth_of(parent);

        for i in 0..count {
            let slot = &self.tree.children_of(parent_node)[i];
            let mut position = parent_position.clone();
            position.push(slot.mv());
            let child = match slot.child() {
                c if c.is_null() => self.tree.materialize_child(parent, i, &position)?,
                c => c,
            };

            // Virtual loss along root..child for this entry.
            let mut cursor = child;
            while cursor != self.tree.root() && !cursor.is_null() {
                let node = self.tree.node(cursor);
                node.add_inflight(self.lane);
                cursor = node.parent();
            }

            let child_node = self.tree.node(child);
            let terminal = child_node.terminal();
            let claim = if terminal.is_terminal() {
                Some(LeafClaim::Terminal(terminal))
            } else if child_node.try_claim_expansion() {
                Some(self.chain.classify(self.tree, child, &position))
            } else {
                None
            };

            match claim {
                Some(claim) => entries.push(LeafEntry {
                    node: child,
                    depth: parent_depth + 1,
                    claim,
                }),
                None => {
                    self.undo_path(child);
                    collisions += 1;
                }
            }
        }

        Ok(LeafBatch {
            entries,
            collisions,
        })
    }

    fn depth_of(&self, node: NodeIndex) -> u16 {
        let mut depth = 0;
        let mut cursor = node;
        while cursor != self.tree.root() && !cursor.is_null() {
            depth += 1;
            cursor = self.tree.node(cursor).parent();
        }
        depth
    }
}

#[cfg(test)]
#[path = "selector_tests.rs"]
mod tests;
