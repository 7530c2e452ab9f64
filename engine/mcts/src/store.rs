//! Pre-allocated node and child-slot arenas.
//!
//! Both pools are sized up front and handed out with an atomic bump
//! pointer, so allocation during search is O(1) and never reallocates (a
//! reallocation would move nodes out from under concurrent readers). Nodes
//! detached by re-rooting go onto a free list and are recycled before the
//! bump pointer advances; child-slot ranges are variable-length and are
//! only reclaimed when the tree is dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chess::ChessMove;
use thiserror::Error;

use crate::node::{AtomicF32, Node, NodeIndex};
use chess_core::{pack_move, unpack_move};

/// Errors raised by the arenas. Exhaustion aborts the running search but
/// leaves the tree consistent; the caller can rebuild with a larger pool.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node arena exhausted ({0} nodes)")]
    NodesExhausted(usize),

    #[error("child arena exhausted ({0} slots)")]
    ChildrenExhausted(usize),
}

/// One child edge: (move, prior, child index or null). The child index is
/// published with a release CAS when the node behind the edge is
/// materialized; until then it reads as null.
pub struct ChildSlot {
    mv: AtomicU32,
    prior: AtomicF32,
    child: AtomicU32,
}

impl ChildSlot {
    fn new() -> Self {
        Self {
            mv: AtomicU32::new(0),
            prior: AtomicF32::default(),
            child: AtomicU32::new(0),
        }
    }

    pub(crate) fn write(&self, mv: ChessMove, prior: f32) {
        self.mv.store(u32::from(pack_move(mv)), Ordering::Relaxed);
        self.prior.store(prior);
        self.child.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn mv(&self) -> ChessMove {
        unpack_move(self.mv.load(Ordering::Relaxed) as u16)
    }

    #[inline]
    pub fn prior(&self) -> f32 {
        self.prior.load()
    }

    pub(crate) fn set_prior(&self, prior: f32) {
        self.prior.store(prior);
    }

    #[inline]
    pub fn child(&self) -> NodeIndex {
        NodeIndex(self.child.load(Ordering::Acquire))
    }

    /// Publish a freshly materialized child node. Returns the winning index:
    /// the caller's on success, the already-published one when it lost the
    /// race (the caller must then return its node to the free list).
    pub(crate) fn publish_child(&self, child: NodeIndex) -> NodeIndex {
        match self.child.compare_exchange(
            0,
            child.0,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => child,
            Err(existing) => NodeIndex(existing),
        }
    }
}

/// Arena of nodes plus the shared child-slot pool.
pub struct NodeStore {
    nodes: Box<[Node]>,
    children: Box<[ChildSlot]>,
    next_node: AtomicU32,
    next_child: AtomicU32,
    free_nodes: Mutex<Vec<NodeIndex>>,
}

impl NodeStore {
    /// Build a store with the given capacities. Index 0 of the node arena
    /// is the reserved null and is never handed out.
    pub fn new(max_nodes: usize, max_children: usize) -> Self {
        let nodes: Box<[Node]> = (0..max_nodes).map(|_| Node::new()).collect();
        let children: Box<[ChildSlot]> = (0..max_children).map(|_| ChildSlot::new()).collect();
        Self {
            nodes,
            children,
            next_node: AtomicU32::new(1),
            next_child: AtomicU32::new(0),
            free_nodes: Mutex::new(Vec::new()),
        }
    }

    /// Allocate one node, preferring the free list over the bump pointer.
    /// Free-listed nodes were reset when they were released.
    pub fn alloc_node(&self) -> Result<NodeIndex, StoreError> {
        if let Some(recycled) = self.free_nodes.lock().expect("free list poisoned").pop() {
            return Ok(recycled);
        }
        let index = self.next_node.fetch_add(1, Ordering::Relaxed);
        if (index as usize) < self.nodes.len() {
            Ok(NodeIndex(index))
        } else {
            // Undo so repeated failures cannot wrap the counter.
            self.next_node.fetch_sub(1, Ordering::Relaxed);
            Err(StoreError::NodesExhausted(self.nodes.len()))
        }
    }

    /// Allocate a contiguous block of `count` child slots.
    pub fn alloc_children(&self, count: usize) -> Result<u32, StoreError> {
        let start = self.next_child.fetch_add(count as u32, Ordering::Relaxed);
        if start as usize + count <= self.children.len() {
            Ok(start)
        } else {
            self.next_child.fetch_sub(count as u32, Ordering::Relaxed);
            Err(StoreError::ChildrenExhausted(self.children.len()))
        }
    }

    /// Return a node to the free list (used when a publication race is lost
    /// and by re-rooting). The node is reset here so that stale generation
    /// stamps can never make a later re-root release it twice.
    pub(crate) fn release_node(&self, index: NodeIndex) {
        debug_assert!(!index.is_null());
        self.nodes[index.as_usize()].reset();
        self.free_nodes.lock().expect("free list poisoned").push(index);
    }

    pub(crate) fn release_nodes(&self, indices: impl IntoIterator<Item = NodeIndex>) {
        let mut free = self.free_nodes.lock().expect("free list poisoned");
        for index in indices {
            self.nodes[index.as_usize()].reset();
            free.push(index);
        }
    }

    /// Nodes currently sitting on the free list.
    pub fn free_count(&self) -> usize {
        self.free_nodes.lock().expect("free list poisoned").len()
    }

    #[inline]
    pub fn node(&self, index: NodeIndex) -> &Node {
        debug_assert!(!index.is_null());
        &self.nodes[index.as_usize()]
    }

    /// Child slots of an expanded node, empty for leaves.
    pub fn children_of(&self, node: &Node) -> &[ChildSlot] {
        let count = node.num_children() as usize;
        if count == 0 {
            return &[];
        }
        let start = node.children_start() as usize;
        &self.children[start..start + count]
    }

    /// A freshly allocated slot range, before it is published on its node.
    pub(crate) fn child_slots(&self, start: u32, count: usize) -> &[ChildSlot] {
        &self.children[start as usize..start as usize + count]
    }

    /// Number of node slots handed out so far (free-listed ones included).
    pub fn nodes_allocated(&self) -> usize {
        self.next_node.load(Ordering::Relaxed) as usize - 1
    }

    /// Node indices handed out so far. Used by diagnostics and the
    /// end-of-search invariant checks; some may be on the free list.
    pub(crate) fn allocated_indices(&self) -> impl Iterator<Item = NodeIndex> {
        (1..self.next_node.load(Ordering::Relaxed)).map(NodeIndex)
    }

    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn children_allocated(&self) -> usize {
        self.next_child.load(Ordering::Relaxed) as usize
    }
}
