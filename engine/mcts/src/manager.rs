//! Per-move search driver.
//!
//! The manager preloads the root, runs one or two flow lanes inside a
//! scoped-thread region, and monitors them from the calling thread: it
//! arms the deadline, applies futility pruning, and dispatches the
//! progress callback (never concurrently with itself, at most once per
//! ~100 ms). At termination it picks the best move by visit count, with
//! optional softmax sampling on the first move of a game.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread;
use std::time::{Duration, Instant};

use chess::ChessMove;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};
use thiserror::Error;
use tracing::{debug, info};

use chess_core::TerminalKind;

use crate::chain::EvaluatorChain;
use crate::config::{ConfigError, SearchOptions};
use crate::evaluator::{Evaluator, EvaluatorError};
use crate::flow::{SearchFlow, SearchLedger};
use crate::limits::MoveBudget;
use crate::node::NodeIndex;
use crate::store::StoreError;
use crate::tree::Tree;

/// Spacing of progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
/// Monitor wake-up cadence.
const MONITOR_TICK: Duration = Duration::from_millis(5);
/// Principal variations are cut off at this many plies.
const MAX_PV_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A non-terminal leaf turned out to have no legal moves: terminal
    /// detection and the move generator disagree, which poisons every
    /// statistic derived from the leaf. The search aborts.
    #[error("non-terminal leaf {0:?} has no legal moves")]
    InconsistentTree(NodeIndex),
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct SearchProgress {
    pub nodes: u64,
    pub nps: u64,
    /// Average selection depth.
    pub depth: u32,
    pub score_cp: i32,
    pub pv: Vec<ChessMove>,
    pub time_ms: u64,
    pub wdl: [f32; 3],
}

pub type ProgressCallback<'a> = &'a (dyn Fn(&SearchProgress) + Sync);

/// Statistics of one finished move search.
#[derive(Debug, Clone)]
pub struct SearchStats {
    /// Total completed visits at the root, reused subtree included.
    pub nodes: u64,
    /// Visits added by this search alone.
    pub visits: u64,
    pub elapsed: Duration,
    pub nps: u64,
    pub average_depth: f32,
    pub batches: u64,
    pub q: f32,
    pub score_cp: i32,
    pub wdl: [f32; 3],
    pub pv: Vec<ChessMove>,
}

/// Outcome of one move search.
#[derive(Debug, Clone)]
pub struct MoveResult {
    /// Chosen move; `None` when the root position is terminal.
    pub best_move: Option<ChessMove>,
    /// The chosen child node, usable as the next root.
    pub best_move_root: Option<NodeIndex>,
    /// Root visits inherited from tree reuse, for continuation diagnostics.
    pub root_n_when_search_started: u32,
    /// Set when the root itself has no legal moves or is drawn.
    pub terminal: Option<TerminalKind>,
    pub stats: SearchStats,
}

/// Map a mean value to centipawns. The logistic inverse and its constants
/// are fixed so that scores are bit-exactly reproducible across builds.
pub fn q_to_centipawns(q: f32) -> i32 {
    let q = q.clamp(-1.0, 1.0) as f64;
    (111.714_640_912 * (1.562_068_842_1 * q).tan()).round() as i32
}

pub struct SearchManager<'a> {
    tree: &'a Tree,
    evaluator: &'a dyn Evaluator,
    secondary: Option<&'a dyn Evaluator>,
    options: &'a SearchOptions,
    budget: MoveBudget,
    first_move_of_game: bool,
    progress: Option<ProgressCallback<'a>>,
    /// External cancellation: honored at the next batch boundary, after
    /// in-flight batches have been applied.
    stop_signal: Option<&'a AtomicBool>,
}

impl<'a> SearchManager<'a> {
    pub fn new(
        tree: &'a Tree,
        evaluator: &'a dyn Evaluator,
        options: &'a SearchOptions,
        budget: MoveBudget,
    ) -> Self {
        Self {
            tree,
            evaluator,
            secondary: None,
            options,
            budget,
            first_move_of_game: false,
            progress: None,
            stop_signal: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Option<&'a dyn Evaluator>) -> Self {
        self.secondary = secondary;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback<'a>>) -> Self {
        self.progress = progress;
        self
    }

    /// Enable the first-move sampler for this search.
    pub fn with_first_move_sampling(mut self, enabled: bool) -> Self {
        self.first_move_of_game = enabled;
        self
    }

    /// Attach an external stop flag; setting it requests termination at
    /// the next batch boundary.
    pub fn with_stop_signal(mut self, signal: Option<&'a AtomicBool>) -> Self {
        self.stop_signal = signal;
        self
    }

    /// Run the search to completion. Synchronous: worker lanes live inside
    /// a scoped-thread region and are joined before this returns.
    pub fn run(&self, rng: &mut ChaCha20Rng) -> Result<MoveResult, SearchError> {
        self.options.validate()?;

        let root_n_start = self.tree.root_node().n();
        let started = Instant::now();

        let root_terminal = self.tree.root_terminal();
        if root_terminal.is_terminal() {
            info!(kind = ?root_terminal, "root position is terminal, nothing to search");
            return Ok(MoveResult {
                best_move: None,
                best_move_root: None,
                root_n_when_search_started: root_n_start,
                terminal: Some(root_terminal),
                stats: self.stats(root_n_start, started, &SearchLedger::new(0)),
            });
        }

        let node_budget = self
            .budget
            .nodes
            .map(|fresh| root_n_start as u64 + fresh)
            .unwrap_or(u64::MAX);
        let deadline = self.budget.time.map(|t| started + t);

        let chain = EvaluatorChain::from_options(self.options);
        let ledger = SearchLedger::new(node_budget);
        let flow = SearchFlow::new(
            self.tree,
            &chain,
            self.evaluator,
            self.secondary,
            self.options,
            &ledger,
        );

        flow.run_preload()?;
        if let Some(err) = ledger.take_error() {
            return Err(err);
        }

        if self.options.dirichlet_epsilon > 0.0 {
            apply_root_noise(
                self.tree,
                self.options.dirichlet_alpha,
                self.options.dirichlet_epsilon,
                rng,
            );
        }

        ledger.register_lane();
        if self.options.flow_direct_overlapped {
            ledger.register_lane();
        }
        thread::scope(|scope| {
            scope.spawn(|| flow.run_lane(0));
            if self.options.flow_direct_overlapped {
                scope.spawn(|| flow.run_lane(1));
            }
            self.monitor(&ledger, started, root_n_start, deadline);
        });

        if let Some(err) = ledger.take_error() {
            return Err(err);
        }

        #[cfg(debug_assertions)]
        self.tree.assert_no_inflight();

        let (best_move, best_move_root) = self.pick_best_move(rng);
        let stats = self.stats(root_n_start, started, &ledger);
        debug!(
            nodes = stats.nodes,
            nps = stats.nps,
            score_cp = stats.score_cp,
            "search finished"
        );
        Ok(MoveResult {
            best_move,
            best_move_root,
            root_n_when_search_started: root_n_start,
            terminal: None,
            stats,
        })
    }

    /// Watch the lanes: enforce the deadline, stop on futility, and emit
    /// throttled progress reports. Runs on the caller's thread, so the
    /// callback is never invoked concurrently with itself.
    fn monitor(
        &self,
        ledger: &SearchLedger,
        started: Instant,
        root_n_start: u32,
        deadline: Option<Instant>,
    ) {
        let mut last_report = Instant::now();

        while !ledger.stopped() && ledger.lanes_active() > 0 {
            if let Some(signal) = self.stop_signal {
                if signal.load(AtomicOrdering::Acquire) {
                    debug!("external stop requested");
                    ledger.request_stop();
                    break;
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    ledger.request_stop();
                    break;
                }
            }
            if self.options.futility_pruning_stop_search_enabled
                && self.is_futile(ledger, started, root_n_start, deadline)
            {
                debug!("futility stop: visit lead exceeds remaining budget");
                ledger.request_stop();
                break;
            }
            if let Some(callback) = self.progress {
                if last_report.elapsed() >= PROGRESS_INTERVAL {
                    callback(&self.progress_snapshot(ledger, started, root_n_start));
                    last_report = Instant::now();
                }
            }
            thread::sleep(MONITOR_TICK);
        }
        ledger.request_stop();
    }

    /// The search is futile when the leading child's visit lead cannot be
    /// overturned by the visits the budget still allows.
    fn is_futile(
        &self,
        ledger: &SearchLedger,
        started: Instant,
        root_n_start: u32,
        deadline: Option<Instant>,
    ) -> bool {
        let root = self.tree.root_node();
        let done = root.n() as u64;

        let remaining_by_nodes = ledger.node_budget().saturating_sub(done);
        let remaining = match deadline {
            Some(deadline) => {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed <= 0.0 {
                    return false;
                }
                let nps = (done.saturating_sub(root_n_start as u64)) as f64 / elapsed;
                let left = deadline.saturating_duration_since(Instant::now()).as_secs_f64();
                remaining_by_nodes.min((nps * left) as u64)
            }
            None => remaining_by_nodes,
        };
        if remaining == u64::MAX {
            return false;
        }

        let mut top = 0u64;
        let mut second = 0u64;
        for slot in self.tree.children_of(root) {
            let child = slot.child();
            if child.is_null() {
                continue;
            }
            let n = self.tree.node(child).n() as u64;
            if n > top {
                second = top;
                top = n;
            } else if n > second {
                second = n;
            }
        }
        top.saturating_sub(second) > remaining
    }

    fn progress_snapshot(
        &self,
        ledger: &SearchLedger,
        started: Instant,
        root_n_start: u32,
    ) -> SearchProgress {
        let root = self.tree.root_node();
        let nodes = root.n() as u64;
        let visits = nodes.saturating_sub(root_n_start as u64);
        let elapsed = started.elapsed();
        let nps = (visits as f64 / elapsed.as_secs_f64().max(1e-6)) as u64;
        SearchProgress {
            nodes,
            nps,
            depth: ledger.average_depth(visits).round() as u32,
            score_cp: q_to_centipawns(root.q()),
            pv: principal_variation(self.tree),
            time_ms: elapsed.as_millis() as u64,
            wdl: root.wdl(),
        }
    }

    fn stats(&self, root_n_start: u32, started: Instant, ledger: &SearchLedger) -> SearchStats {
        let root = self.tree.root_node();
        let nodes = root.n() as u64;
        let visits = nodes.saturating_sub(root_n_start as u64);
        let elapsed = started.elapsed();
        SearchStats {
            nodes,
            visits,
            elapsed,
            nps: (visits as f64 / elapsed.as_secs_f64().max(1e-6)) as u64,
            average_depth: ledger.average_depth(visits) as f32,
            batches: ledger.batches(),
            q: root.q(),
            score_cp: q_to_centipawns(root.q()),
            wdl: root.wdl(),
            pv: principal_variation(self.tree),
        }
    }

    /// Best move: most visits, ties by higher Q (root perspective). Before
    /// any child has visits, fall back to the highest prior. On the first
    /// move of a game a softmax over visit counts may be sampled instead.
    fn pick_best_move(&self, rng: &mut ChaCha20Rng) -> (Option<ChessMove>, Option<NodeIndex>) {
        let root = self.tree.root_node();
        let slots = self.tree.children_of(root);
        if slots.is_empty() {
            return (None, None);
        }

        let visited: Vec<(usize, u64)> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let child = slot.child();
                (!child.is_null() && self.tree.node(child).n() > 0)
                    .then(|| (i, self.tree.node(child).n() as u64))
            })
            .collect();

        if visited.is_empty() {
            let best = slots
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.prior()
                        .partial_cmp(&b.prior())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);
            return match best {
                Some(i) => (Some(slots[i].mv()), None),
                None => (None, None),
            };
        }

        let temperature = self.options.first_move_temperature;
        let chosen = if self.first_move_of_game && temperature > 0.0 {
            sample_by_visits(&visited, temperature, rng)
        } else {
            // Highest N; ties by Q from the root's perspective.
            visited
                .iter()
                .copied()
                .max_by(|&(i, n_a), &(j, n_b)| {
                    n_a.cmp(&n_b).then_with(|| {
                        let q_a = -self.tree.node(slots[i].child()).q();
                        let q_b = -self.tree.node(slots[j].child()).q();
                        q_a.partial_cmp(&q_b).unwrap_or(std::cmp::Ordering::Equal)
                    })
                })
                .map(|(i, _)| i)
                .unwrap_or(visited[0].0)
        };

        let slot = &slots[chosen];
        (Some(slot.mv()), Some(slot.child()))
    }
}

/// Sample a child index proportionally to `visits^(1/temperature)`.
fn sample_by_visits(
    visited: &[(usize, u64)],
    temperature: f32,
    rng: &mut ChaCha20Rng,
) -> usize {
    let inv_t = 1.0 / temperature.max(1e-3) as f64;
    let weights: Vec<f64> = visited
        .iter()
        .map(|&(_, n)| (n as f64).powf(inv_t))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return visited[0].0;
    }
    let mut at = rng.gen::<f64>() * total;
    for (&(i, _), w) in visited.iter().zip(&weights) {
        at -= w;
        if at <= 0.0 {
            return i;
        }
    }
    visited[visited.len() - 1].0
}

/// Most-visited descent from the root.
pub fn principal_variation(tree: &Tree) -> Vec<ChessMove> {
    let mut pv = Vec::new();
    let mut cursor = tree.root();
    while pv.len() < MAX_PV_LEN {
        let node = tree.node(cursor);
        if !node.is_expanded() {
            break;
        }
        let best = tree
            .children_of(node)
            .iter()
            .filter(|slot| !slot.child().is_null())
            .max_by_key(|slot| tree.node(slot.child()).n());
        match best {
            Some(slot) if tree.node(slot.child()).n() > 0 => {
                pv.push(slot.mv());
                cursor = slot.child();
            }
            _ => break,
        }
    }
    pv
}

/// Mix Dirichlet noise into the root priors for self-play exploration.
fn apply_root_noise(tree: &Tree, alpha: f32, epsilon: f32, rng: &mut ChaCha20Rng) {
    let slots = tree.children_of(tree.root_node());
    if slots.is_empty() || !(alpha > 0.0) {
        return;
    }
    let gamma = match Gamma::new(alpha as f64, 1.0) {
        Ok(gamma) => gamma,
        Err(_) => return,
    };
    let noise: Vec<f64> = (0..slots.len()).map(|_| gamma.sample(rng)).collect();
    let total: f64 = noise.iter().sum();
    if total <= 0.0 {
        return;
    }
    for (slot, eta) in slots.iter().zip(&noise) {
        let mixed = (1.0 - epsilon) * slot.prior() + epsilon * (eta / total) as f32;
        slot.set_prior(mixed);
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
