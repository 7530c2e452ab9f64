//! The search tree: node store, evaluation cache, root index, and the
//! transposition index, with support for re-rooting after a played move.

use std::sync::{Arc, RwLock};

use chess::ChessMove;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use chess_core::{PositionWithHistory, TerminalKind};

use crate::cache::EvalCache;
use crate::config::SearchOptions;
use crate::node::{Node, NodeIndex};
use crate::store::{ChildSlot, NodeStore, StoreError};

#[derive(Debug, Error)]
pub enum TreeError {
    /// The requested continuation line leaves the stored tree.
    #[error("prior tree cannot be re-rooted along the requested line")]
    NotReusable,
}

const TRANSPOSITION_SHARDS: usize = 16;

/// Hash -> node index, used to share evaluations between transposed lines.
/// Entries are validated on lookup against the node's generation and hash,
/// so re-rooting does not have to purge them eagerly.
struct TranspositionIndex {
    shards: Box<[RwLock<FxHashMap<u64, NodeIndex>>]>,
}

impl TranspositionIndex {
    fn new() -> Self {
        Self {
            shards: (0..TRANSPOSITION_SHARDS)
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
        }
    }

    #[inline]
    fn shard(&self, hash: u64) -> &RwLock<FxHashMap<u64, NodeIndex>> {
        &self.shards[(hash >> 60) as usize % TRANSPOSITION_SHARDS]
    }

    fn insert(&self, hash: u64, index: NodeIndex) {
        self.shard(hash)
            .write()
            .expect("transposition shard poisoned")
            .insert(hash, index);
    }

    fn lookup(&self, hash: u64) -> Option<NodeIndex> {
        self.shard(hash)
            .read()
            .expect("transposition shard poisoned")
            .get(&hash)
            .copied()
    }
}

/// Aggregate view of a tree for diagnostics and progress reporting.
#[derive(Debug, Clone)]
pub struct TreeStats {
    pub nodes_in_use: usize,
    pub root_n: u32,
    pub root_q: f32,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// A monte carlo search tree rooted at one position.
pub struct Tree {
    store: NodeStore,
    cache: Arc<EvalCache>,
    /// Cache of the bound peer session, read-only. Severed by
    /// [`Tree::clear_shared_context`].
    peer_cache: Option<Arc<EvalCache>>,
    root: NodeIndex,
    root_position: PositionWithHistory,
    generation: u32,
    transpositions: TranspositionIndex,
}

impl Tree {
    /// Build a fresh tree holding only the root.
    pub fn new(
        position: PositionWithHistory,
        options: &SearchOptions,
        cache: Arc<EvalCache>,
    ) -> Result<Self, StoreError> {
        let store = NodeStore::new(options.max_nodes, options.max_children);
        let root = store.alloc_node()?;
        store.node(root).init_edge(
            NodeIndex::NULL,
            0,
            1.0,
            position.hash(),
            1,
            position.terminal(),
        );
        Ok(Self {
            store,
            cache,
            peer_cache: None,
            root,
            root_position: position,
            generation: 1,
            transpositions: TranspositionIndex::new(),
        })
    }

    #[inline]
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    #[inline]
    pub fn root_node(&self) -> &Node {
        self.store.node(self.root)
    }

    #[inline]
    pub fn root_position(&self) -> &PositionWithHistory {
        &self.root_position
    }

    #[inline]
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    #[inline]
    pub fn node(&self, index: NodeIndex) -> &Node {
        self.store.node(index)
    }

    #[inline]
    pub fn children_of(&self, node: &Node) -> &[ChildSlot] {
        self.store.children_of(node)
    }

    #[inline]
    pub fn cache(&self) -> &Arc<EvalCache> {
        &self.cache
    }

    pub fn peer_cache(&self) -> Option<&Arc<EvalCache>> {
        self.peer_cache.as_ref()
    }

    pub fn set_peer_cache(&mut self, cache: Arc<EvalCache>) {
        self.peer_cache = Some(cache);
    }

    /// Sever the peer back-reference. Called on the peer before binding it
    /// elsewhere, so chains of ever-older contexts cannot pin memory.
    pub fn clear_shared_context(&mut self) {
        self.peer_cache = None;
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The child of `node` reached by `mv`, if that edge has been
    /// materialized.
    pub fn find_child(&self, node: NodeIndex, mv: ChessMove) -> Option<NodeIndex> {
        let slots = self.store.children_of(self.store.node(node));
        slots.iter().find_map(|slot| {
            let child = slot.child();
            (slot.mv() == mv && !child.is_null()).then_some(child)
        })
    }

    /// Materialize the node behind a child slot. Loses of the publication
    /// race return the winner and recycle the loser's allocation.
    pub(crate) fn materialize_child(
        &self,
        parent: NodeIndex,
        slot_index: usize,
        child_position: &PositionWithHistory,
    ) -> Result<NodeIndex, StoreError> {
        let slot = &self.store.children_of(self.store.node(parent))[slot_index];
        let existing = slot.child();
        if !existing.is_null() {
            return Ok(existing);
        }
        let fresh = self.store.alloc_node()?;
        self.store.node(fresh).init_edge(
            parent,
            slot_index as u16,
            slot.prior(),
            child_position.hash(),
            self.generation,
            child_position.terminal(),
        );
        let winner = slot.publish_child(fresh);
        if winner != fresh {
            self.store.release_node(fresh);
        }
        Ok(winner)
    }

    /// Record an expanded node in the transposition index.
    pub(crate) fn register_transposition(&self, hash: u64, index: NodeIndex) {
        self.transpositions.insert(hash, index);
    }

    /// A visited, expanded node for the same position, if one exists. The
    /// stored index is trusted only after re-validating hash and generation
    /// against the node itself.
    pub(crate) fn find_transposition(&self, hash: u64, exclude: NodeIndex) -> Option<NodeIndex> {
        let candidate = self.transpositions.lookup(hash)?;
        if candidate == exclude {
            return None;
        }
        let node = self.store.node(candidate);
        (node.generation() == self.generation && node.hash() == hash && node.n() > 0)
            .then_some(candidate)
    }

    /// Walk `line` from the current root and make the reached node the new
    /// root. Every node outside the retained subtree is detached and
    /// recycled. The tree is untouched when the walk fails.
    pub fn re_root(&mut self, line: &[ChessMove]) -> Result<(), TreeError> {
        let mut cursor = self.root;
        let mut position = self.root_position.clone();
        for &mv in line {
            match self.find_child(cursor, mv) {
                Some(child) => {
                    cursor = child;
                    position.push(mv);
                }
                None => return Err(TreeError::NotReusable),
            }
        }

        let new_root = cursor;
        self.generation += 1;
        let generation = self.generation;

        // Stamp the retained subtree with the new generation.
        let mut stack = vec![new_root];
        let mut retained = 0usize;
        while let Some(index) = stack.pop() {
            let node = self.store.node(index);
            node.set_generation(generation);
            retained += 1;
            for slot in self.store.children_of(node) {
                let child = slot.child();
                if !child.is_null() {
                    stack.push(child);
                }
            }
        }

        // Everything allocated but not re-stamped is detached. Nodes already
        // on the free list read generation 0 and are skipped.
        let detached: Vec<NodeIndex> = self
            .store
            .allocated_indices()
            .filter(|&index| {
                let g = self.store.node(index).generation();
                g != generation && g != 0
            })
            .collect();
        let freed = detached.len();
        self.store.release_nodes(detached);

        self.store.node(new_root).set_parent(NodeIndex::NULL, 0);
        self.root = new_root;
        self.root_position = position;
        debug!(retained, freed, generation, "re-rooted tree");
        Ok(())
    }

    pub fn stats(&self) -> TreeStats {
        let (cache_hits, cache_misses) = self.cache.stats();
        TreeStats {
            nodes_in_use: self.store.nodes_allocated() - self.store.free_count(),
            root_n: self.root_node().n(),
            root_q: self.root_node().q(),
            cache_hits,
            cache_misses,
        }
    }

    /// Debug invariant: no virtual loss may survive a finished search.
    #[cfg(debug_assertions)]
    pub(crate) fn assert_no_inflight(&self) {
        for index in self.store.allocated_indices() {
            let node = self.store.node(index);
            debug_assert_eq!(
                node.inflight_total(),
                0,
                "node {:?} still carries virtual loss",
                index
            );
        }
    }

    /// Root terminal classification shortcut.
    pub fn root_terminal(&self) -> TerminalKind {
        self.root_position.terminal()
    }
}

#[cfg(test)]
#[path = "tree_tests.rs"]
mod tests;
