//! Lane orchestration: select -> classify -> evaluate -> apply.
//!
//! A lane is one worker loop over the shared tree. With overlapped flow
//! enabled a second lane runs concurrently, each with its own virtual-loss
//! counters, so one lane's selection hides the other lane's evaluator
//! latency. Lanes coordinate through the ledger: a shared stop flag, the
//! node budget, and the first error to occur.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

use chess_core::EncodedPosition;

use crate::apply::BatchApplier;
use crate::batching::BatchParamsManager;
use crate::chain::{EvaluatorChain, LeafClaim};
use crate::config::SearchOptions;
use crate::evaluator::{Evaluator, NetOutput};
use crate::manager::SearchError;
use crate::selector::{LeafBatch, LeafSelector};
use crate::tree::Tree;

/// Shared per-search state the lanes and the monitor agree on.
pub struct SearchLedger {
    stop: AtomicBool,
    /// Root-visit budget for this move; `u64::MAX` when only time-limited.
    node_budget: AtomicU64,
    depth_sum: AtomicU64,
    batches: AtomicU64,
    lanes_active: AtomicU64,
    error: Mutex<Option<SearchError>>,
}

impl SearchLedger {
    pub fn new(node_budget: u64) -> Self {
        Self {
            stop: AtomicBool::new(false),
            node_budget: AtomicU64::new(node_budget),
            depth_sum: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            lanes_active: AtomicU64::new(0),
            error: Mutex::new(None),
        }
    }

    pub fn lanes_active(&self) -> u64 {
        self.lanes_active.load(Ordering::Acquire)
    }

    /// Pre-register a lane before spawning it, so a monitor that starts
    /// first cannot mistake not-yet-running lanes for finished ones.
    pub fn register_lane(&self) {
        self.lanes_active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn node_budget(&self) -> u64 {
        self.node_budget.load(Ordering::Relaxed)
    }

    /// Average selection depth over all applied leaves.
    pub fn average_depth(&self, visits: u64) -> f64 {
        if visits == 0 {
            0.0
        } else {
            self.depth_sum.load(Ordering::Relaxed) as f64 / visits as f64
        }
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    fn record_error(&self, error: SearchError) {
        let mut slot = self.error.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
        self.request_stop();
    }

    pub fn take_error(&self) -> Option<SearchError> {
        self.error.lock().expect("error slot poisoned").take()
    }
}

/// Decrements the active-lane count when a lane loop exits by any path.
struct LaneGuard<'a>(&'a SearchLedger);

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        self.0.lanes_active.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct SearchFlow<'a> {
    tree: &'a Tree,
    chain: &'a EvaluatorChain,
    evaluator: &'a dyn Evaluator,
    secondary: Option<&'a dyn Evaluator>,
    options: &'a SearchOptions,
    ledger: &'a SearchLedger,
}

impl<'a> SearchFlow<'a> {
    pub fn new(
        tree: &'a Tree,
        chain: &'a EvaluatorChain,
        evaluator: &'a dyn Evaluator,
        secondary: Option<&'a dyn Evaluator>,
        options: &'a SearchOptions,
        ledger: &'a SearchLedger,
    ) -> Self {
        Self {
            tree,
            chain,
            evaluator,
            secondary,
            options,
            ledger,
        }
    }

    /// Expand the root, and optionally one or two plies below it, before
    /// the lanes start. Runs synchronously on the caller's thread so every
    /// later descent finds complete priors near the root.
    pub fn run_preload(&self) -> Result<(), SearchError> {
        let selector = LeafSelector::new(self.tree, self.chain, self.options, 0);
        let applier = BatchApplier::new(self.tree, 0);

        if let Some(entry) = selector.claim_root() {
            let batch = LeafBatch {
                entries: vec![entry],
                collisions: 0,
            };
            self.evaluate_and_apply(batch, &applier)?;
        }

        if self.options.root_preload_depth >= 1 && self.tree.root_node().is_expanded() {
            let batch = selector.collect_children_of(self.tree.root(), self.tree.root_position())?;
            self.evaluate_and_apply(batch, &applier)?;

            if self.options.root_preload_depth >= 2 {
                let mut remaining = self.options.max_batch_size;
                let root_slots = self.tree.children_of(self.tree.root_node());
                let plies: Vec<_> = root_slots
                    .iter()
                    .filter(|slot| !slot.child().is_null())
                    .map(|slot| (slot.child(), slot.mv()))
                    .collect();
                for (child, mv) in plies {
                    let node = self.tree.node(child);
                    if !node.is_expanded() || node.terminal().is_terminal() {
                        continue;
                    }
                    let mut position = self.tree.root_position().clone();
                    position.push(mv);
                    let batch = selector.collect_children_of(child, &position)?;
                    remaining = remaining.saturating_sub(batch.entries.len());
                    self.evaluate_and_apply(batch, &applier)?;
                    if remaining == 0 {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One lane's worker loop. The lane must have been pre-registered on
    /// the ledger. Errors are parked there; the first one stops both lanes.
    pub fn run_lane(&self, lane: usize) {
        let _guard = LaneGuard(self.ledger);
        let selector = LeafSelector::new(self.tree, self.chain, self.options, lane);
        let applier = BatchApplier::new(self.tree, lane);
        let mut params = BatchParamsManager::new(self.options);

        while !self.ledger.stopped() {
            let done = self.tree.root_node().n() as u64;
            let budget = self.ledger.node_budget();
            if done >= budget {
                self.ledger.request_stop();
                break;
            }
            let headroom = (budget - done) as usize;
            let target = params.target_batch_size().min(headroom).max(1);

            let batch = match selector.collect(target) {
                Ok(batch) => batch,
                Err(err) => {
                    self.ledger.record_error(err.into());
                    break;
                }
            };
            if batch.is_empty() {
                if batch.collisions > 0 {
                    // The other lane holds every reachable leaf; let it
                    // drain before retrying.
                    std::thread::yield_now();
                    continue;
                }
                debug!(lane, "no selectable leaves, lane retiring");
                break;
            }

            let eval_positions = batch
                .entries
                .iter()
                .filter(|e| matches!(e.claim, LeafClaim::NeedsNet(_)))
                .count();
            let started = Instant::now();
            match self.evaluate_and_apply_inner(batch, &applier) {
                Ok(()) => params.record_batch(eval_positions, started.elapsed()),
                Err(err) => {
                    self.ledger.record_error(err);
                    break;
                }
            }
        }
    }

    fn evaluate_and_apply(
        &self,
        batch: LeafBatch,
        applier: &BatchApplier<'_>,
    ) -> Result<(), SearchError> {
        self.evaluate_and_apply_inner(batch, applier)
            .inspect_err(|_| self.ledger.request_stop())
    }

    /// Evaluate the deferred leaves of a batch and back everything up. On
    /// evaluator failure the whole batch is discarded and its virtual
    /// losses rolled back.
    fn evaluate_and_apply_inner(
        &self,
        batch: LeafBatch,
        applier: &BatchApplier<'_>,
    ) -> Result<(), SearchError> {
        let needs: Vec<&EncodedPosition> = batch
            .entries
            .iter()
            .filter_map(|entry| match &entry.claim {
                LeafClaim::NeedsNet(encoded) => Some(encoded),
                _ => None,
            })
            .collect();

        let outputs = match self.evaluate_chunked(self.evaluator, &needs) {
            Ok(outputs) => outputs,
            Err(err) => {
                applier.rollback(&batch);
                return Err(err.into());
            }
        };

        // The second opinion is advisory: a failure is logged, not fatal.
        let secondary = self.secondary.and_then(|evaluator| {
            match self.evaluate_chunked(evaluator, &needs) {
                Ok(outputs) => Some(outputs),
                Err(err) => {
                    warn!(error = %err, "secondary evaluator failed; continuing without");
                    None
                }
            }
        });

        let depth_sum: u64 = batch.entries.iter().map(|e| e.depth as u64).sum();
        applier.apply(&batch, &outputs, secondary.as_deref())?;
        self.ledger.depth_sum.fetch_add(depth_sum, Ordering::Relaxed);
        self.ledger.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evaluate_chunked(
        &self,
        evaluator: &dyn Evaluator,
        needs: &[&EncodedPosition],
    ) -> Result<Vec<NetOutput>, crate::evaluator::EvaluatorError> {
        let mut outputs = Vec::with_capacity(needs.len());
        for chunk in needs.chunks(evaluator.max_batch_size().max(1)) {
            let result = evaluator.evaluate_batch(chunk)?;
            if result.len() != chunk.len() {
                return Err(crate::evaluator::EvaluatorError::Malformed {
                    expected: chunk.len(),
                    got: result.len(),
                });
            }
            outputs.extend(result);
        }
        Ok(outputs)
    }
}
