//! MCTS node representation.
//!
//! Nodes live in a pre-allocated arena and are addressed by `NodeIndex`;
//! index 0 is reserved as null. Every field that can be touched while a
//! search is running is atomic: visit counters and value sums are updated
//! with relaxed read-modify-write operations (they are commutative, so the
//! final statistics do not depend on interleaving), while structural
//! publication (expansion state, child-table extent) uses acquire/release
//! pairs.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use chess_core::TerminalKind;

/// Index into the node arena. Using a newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    /// The reserved null index.
    pub const NULL: NodeIndex = NodeIndex(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Thread-safe f32 cell using bit-casting on `AtomicU32`.
#[derive(Debug, Default)]
pub struct AtomicF32 {
    bits: AtomicU32,
}

impl AtomicF32 {
    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Thread-safe f64 accumulator using compare-and-swap on `AtomicU64`.
/// 64-bit storage keeps the value sums precise over large visit counts.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Lock-free fetch-add via a CAS loop.
    pub fn fetch_add(&self, value: f64) -> f64 {
        let mut current_bits = self.bits.load(Ordering::Relaxed);
        loop {
            let current = f64::from_bits(current_bits);
            let new_bits = (current + value).to_bits();
            match self.bits.compare_exchange_weak(
                current_bits,
                new_bits,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(observed) => current_bits = observed,
            }
        }
    }
}

const TERMINAL_NON: u8 = 0;
const TERMINAL_CHECKMATE: u8 = 1;
const TERMINAL_DRAW: u8 = 2;
const TERMINAL_STALEMATE: u8 = 3;

fn terminal_to_u8(kind: TerminalKind) -> u8 {
    match kind {
        TerminalKind::NonTerminal => TERMINAL_NON,
        TerminalKind::Checkmate => TERMINAL_CHECKMATE,
        TerminalKind::Draw => TERMINAL_DRAW,
        TerminalKind::Stalemate => TERMINAL_STALEMATE,
    }
}

fn terminal_from_u8(tag: u8) -> TerminalKind {
    match tag {
        TERMINAL_CHECKMATE => TerminalKind::Checkmate,
        TERMINAL_DRAW => TerminalKind::Draw,
        TERMINAL_STALEMATE => TerminalKind::Stalemate,
        _ => TerminalKind::NonTerminal,
    }
}

/// Expansion lifecycle: unexpanded -> claimed (one selector won the CAS and
/// queued the leaf for evaluation) -> expanded (policy and children written).
const EXPAND_NONE: u8 = 0;
const EXPAND_CLAIMED: u8 = 1;
const EXPAND_DONE: u8 = 2;

/// Number of selector lanes; each lane owns one in-flight counter per node.
pub const NUM_LANES: usize = 2;

/// A node in the search tree.
///
/// Statistics are stored from the perspective of the side to move at this
/// node; a parent reads its child's `Q` negated. `w` sums the backed-up
/// values, `w_draw`/`w_loss` the draw and loss probabilities (the win sum
/// is `n - draw - loss`), `m_sum` the moves-left estimates.
pub struct Node {
    n: AtomicU32,
    n_inflight: [AtomicU32; NUM_LANES],
    w: AtomicF64,
    w_draw: AtomicF64,
    w_loss: AtomicF64,
    m_sum: AtomicF64,
    /// Immediate NN value at this node (side-to-move perspective).
    v: AtomicF32,
    /// Second-opinion value from the secondary network; advisory only.
    v_secondary: AtomicF32,
    /// Prior probability assigned by the parent's policy.
    prior: AtomicF32,
    terminal: AtomicU8,
    expand_state: AtomicU8,
    num_children: AtomicU16,
    index_in_parent: AtomicU16,
    children_start: AtomicU32,
    parent: AtomicU32,
    transposition_link: AtomicU32,
    /// Re-root generation stamp; nodes from older generations are detached.
    generation: AtomicU32,
    hash: AtomicU64,
}

impl Node {
    pub(crate) fn new() -> Self {
        Self {
            n: AtomicU32::new(0),
            n_inflight: [AtomicU32::new(0), AtomicU32::new(0)],
            w: AtomicF64::default(),
            w_draw: AtomicF64::default(),
            w_loss: AtomicF64::default(),
            m_sum: AtomicF64::default(),
            v: AtomicF32::default(),
            v_secondary: AtomicF32::default(),
            prior: AtomicF32::default(),
            terminal: AtomicU8::new(TERMINAL_NON),
            expand_state: AtomicU8::new(EXPAND_NONE),
            num_children: AtomicU16::new(0),
            index_in_parent: AtomicU16::new(0),
            children_start: AtomicU32::new(0),
            parent: AtomicU32::new(0),
            transposition_link: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            hash: AtomicU64::new(0),
        }
    }

    /// Clear a node recycled from the free list.
    pub(crate) fn reset(&self) {
        self.n.store(0, Ordering::Relaxed);
        for lane in &self.n_inflight {
            lane.store(0, Ordering::Relaxed);
        }
        self.w.store(0.0);
        self.w_draw.store(0.0);
        self.w_loss.store(0.0);
        self.m_sum.store(0.0);
        self.v.store(0.0);
        self.v_secondary.store(0.0);
        self.prior.store(0.0);
        self.terminal.store(TERMINAL_NON, Ordering::Relaxed);
        self.num_children.store(0, Ordering::Relaxed);
        self.index_in_parent.store(0, Ordering::Relaxed);
        self.children_start.store(0, Ordering::Relaxed);
        self.parent.store(0, Ordering::Relaxed);
        self.transposition_link.store(0, Ordering::Relaxed);
        self.generation.store(0, Ordering::Relaxed);
        self.hash.store(0, Ordering::Relaxed);
        self.expand_state.store(EXPAND_NONE, Ordering::Release);
    }

    /// Initialize the structural edge fields when the node is materialized
    /// under its parent. Runs before the child index is published, so plain
    /// relaxed stores are sufficient.
    pub(crate) fn init_edge(
        &self,
        parent: NodeIndex,
        index_in_parent: u16,
        prior: f32,
        hash: u64,
        generation: u32,
        terminal: TerminalKind,
    ) {
        self.parent.store(parent.0, Ordering::Relaxed);
        self.index_in_parent.store(index_in_parent, Ordering::Relaxed);
        self.prior.store(prior);
        self.hash.store(hash, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Relaxed);
        self.terminal.store(terminal_to_u8(terminal), Ordering::Relaxed);
    }

    // ---- visit statistics ----

    #[inline]
    pub fn n(&self) -> u32 {
        self.n.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inflight(&self, lane: usize) -> u32 {
        self.n_inflight[lane].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inflight_total(&self) -> u32 {
        self.n_inflight[0].load(Ordering::Relaxed) + self.n_inflight[1].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_inflight(&self, lane: usize) {
        self.n_inflight[lane].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub_inflight(&self, lane: usize) {
        let prev = self.n_inflight[lane].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "virtual-loss underflow on lane {}", lane);
    }

    /// Commit one backed-up visit: value, draw/loss probabilities and
    /// moves-left estimate, all in this node's side-to-move perspective.
    pub fn add_visit(&self, value: f64, draw: f64, loss: f64, moves_left: f64) {
        self.w.fetch_add(value);
        self.w_draw.fetch_add(draw);
        self.w_loss.fetch_add(loss);
        self.m_sum.fetch_add(moves_left);
        self.n.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean value, falling back to the immediate NN value before any visit.
    pub fn q_or_v(&self) -> f32 {
        let n = self.n();
        if n == 0 {
            self.v.load()
        } else {
            (self.w.load() / n as f64) as f32
        }
    }

    /// Mean value over completed visits, 0 when unvisited.
    pub fn q(&self) -> f32 {
        let n = self.n();
        if n == 0 {
            0.0
        } else {
            (self.w.load() / n as f64) as f32
        }
    }

    /// Win/draw/loss distribution over completed visits.
    pub fn wdl(&self) -> [f32; 3] {
        let n = self.n();
        if n == 0 {
            return [0.0, 0.0, 0.0];
        }
        let n = n as f64;
        let draw = self.w_draw.load() / n;
        let loss = self.w_loss.load() / n;
        [(1.0 - draw - loss) as f32, draw as f32, loss as f32]
    }

    /// Mean moves-left estimate.
    pub fn m_avg(&self) -> f32 {
        let n = self.n();
        if n == 0 {
            0.0
        } else {
            (self.m_sum.load() / n as f64) as f32
        }
    }

    #[inline]
    pub fn v(&self) -> f32 {
        self.v.load()
    }

    pub(crate) fn set_v(&self, value: f32) {
        self.v.store(value);
    }

    #[inline]
    pub fn v_secondary(&self) -> f32 {
        self.v_secondary.load()
    }

    pub(crate) fn set_v_secondary(&self, value: f32) {
        self.v_secondary.store(value);
    }

    #[inline]
    pub fn prior(&self) -> f32 {
        self.prior.load()
    }

    // ---- structure ----

    #[inline]
    pub fn parent(&self) -> NodeIndex {
        NodeIndex(self.parent.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn index_in_parent(&self) -> u16 {
        self.index_in_parent.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_parent(&self, parent: NodeIndex, index_in_parent: u16) {
        self.parent.store(parent.0, Ordering::Relaxed);
        self.index_in_parent.store(index_in_parent, Ordering::Relaxed);
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_generation(&self, generation: u32) {
        self.generation.store(generation, Ordering::Relaxed);
    }

    #[inline]
    pub fn terminal(&self) -> TerminalKind {
        terminal_from_u8(self.terminal.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn transposition_link(&self) -> NodeIndex {
        NodeIndex(self.transposition_link.load(Ordering::Relaxed))
    }

    pub(crate) fn set_transposition_link(&self, target: NodeIndex) {
        self.transposition_link.store(target.0, Ordering::Relaxed);
    }

    /// Attempt to claim this leaf for expansion. Exactly one selector wins;
    /// the losers treat the encounter as a batch collision.
    pub(crate) fn try_claim_expansion(&self) -> bool {
        self.expand_state
            .compare_exchange(
                EXPAND_NONE,
                EXPAND_CLAIMED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Release a claim after a failed evaluation so the leaf can be retried.
    pub(crate) fn release_claim(&self) {
        let _ = self.expand_state.compare_exchange(
            EXPAND_CLAIMED,
            EXPAND_NONE,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Publish the child table. The release store on `num_children` is the
    /// publication point: readers that observe a non-zero count may read the
    /// slots without further synchronization.
    pub(crate) fn publish_children(&self, children_start: u32, count: u16) {
        self.children_start.store(children_start, Ordering::Relaxed);
        self.num_children.store(count, Ordering::Release);
        self.expand_state.store(EXPAND_DONE, Ordering::Release);
    }

    /// Mark a childless leaf (terminal or transposition-linked) as done.
    pub(crate) fn publish_leaf(&self) {
        self.expand_state.store(EXPAND_DONE, Ordering::Release);
    }

    #[inline]
    pub fn is_expanded(&self) -> bool {
        self.expand_state.load(Ordering::Acquire) == EXPAND_DONE
    }

    #[inline]
    pub fn num_children(&self) -> u16 {
        self.num_children.load(Ordering::Acquire)
    }

    #[inline]
    pub fn children_start(&self) -> u32 {
        self.children_start.load(Ordering::Relaxed)
    }
}
