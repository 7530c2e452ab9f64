//! Tests for the per-move search driver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;

use super::*;
use crate::cache::{CacheMode, EvalCache};
use crate::evaluator::{NetOutput, SeededEvaluator, UniformEvaluator};
use chess_core::{EncodedPosition, PositionWithHistory};

fn build_tree(fen: Option<&str>, options: &SearchOptions) -> Tree {
    let position = match fen {
        Some(fen) => PositionWithHistory::from_fen(fen).unwrap(),
        None => PositionWithHistory::startpos(),
    };
    let cache = Arc::new(EvalCache::new(options.cache_capacity, options.cache_mode));
    Tree::new(position, options, cache).unwrap()
}

fn run(
    tree: &Tree,
    evaluator: &dyn Evaluator,
    options: &SearchOptions,
    nodes: u64,
) -> MoveResult {
    let budget = MoveBudget {
        nodes: Some(nodes),
        time: None,
        think_harder: 1.0,
    };
    let mut rng = ChaCha20Rng::seed_from_u64(options.seed);
    SearchManager::new(tree, evaluator, options, budget)
        .run(&mut rng)
        .unwrap()
}

#[test]
fn fresh_search_hits_the_node_budget_exactly() {
    let options = SearchOptions::for_testing();
    let tree = build_tree(None, &options);
    let eval = UniformEvaluator::new();

    let result = run(&tree, &eval, &options, 100);

    assert_eq!(tree.root_node().n(), 100);
    assert_eq!(result.stats.nodes, 100);
    assert_eq!(result.root_n_when_search_started, 0);
    assert!(result.best_move.is_some());
    assert!(result.terminal.is_none());

    // Root preloading guarantees at least one visit per legal move.
    for slot in tree.children_of(tree.root_node()) {
        let child = slot.child();
        assert!(!child.is_null());
        assert!(tree.node(child).n() >= 1, "unvisited root child");
    }
}

#[test]
fn best_move_selection_is_deterministic() {
    let options = SearchOptions::for_testing();
    let eval = UniformEvaluator::new();

    let tree_a = build_tree(None, &options);
    let a = run(&tree_a, &eval, &options, 100);
    let tree_b = build_tree(None, &options);
    let b = run(&tree_b, &eval, &options, 100);

    assert_eq!(a.best_move, b.best_move);
}

#[test]
fn mate_in_one_is_found() {
    let options = SearchOptions::for_testing();
    let tree = build_tree(Some("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1"), &options);
    let eval = UniformEvaluator::new();

    let result = run(&tree, &eval, &options, 1000);

    assert_eq!(result.best_move.unwrap().to_string(), "a1a8");
    let mate_root = result.best_move_root.unwrap();
    assert_eq!(tree.node(mate_root).terminal(), TerminalKind::Checkmate);
    // The mate child absorbs almost every visit, so the root converges
    // toward a certain win.
    assert!(result.stats.q > 0.5, "root q was {}", result.stats.q);
    assert!(result.stats.score_cp > 100);
    assert_eq!(result.stats.pv.first().unwrap().to_string(), "a1a8");
}

#[test]
fn stalemate_trap_is_avoided() {
    // White: Kb6, Qd6; black: Ka8. Qc7 stalemates on the spot, Qd8 mates.
    let options = SearchOptions::for_testing();
    let tree = build_tree(Some("k7/8/1K1Q4/8/8/8/8/8 w - - 0 1"), &options);
    let eval = UniformEvaluator::new();

    let result = run(&tree, &eval, &options, 1000);

    let best = result.best_move.unwrap().to_string();
    assert_ne!(best, "d6c7", "walked into the stalemate");
    assert_eq!(best, "d6d8");

    // The stalemate child is classified as a draw with Q = 0.
    let stale_slot = tree
        .children_of(tree.root_node())
        .iter()
        .find(|s| s.mv().to_string() == "d6c7")
        .unwrap();
    let stale = tree.node(stale_slot.child());
    assert_eq!(stale.terminal(), TerminalKind::Stalemate);
    assert!(stale.n() > 0);
    assert_eq!(stale.q(), 0.0);
    assert_eq!(stale.wdl()[1], 1.0);
}

#[test]
fn terminal_root_reports_no_move() {
    let options = SearchOptions::for_testing();
    // Fool's mate: white is checkmated.
    let tree = build_tree(
        Some("rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3"),
        &options,
    );
    let eval = UniformEvaluator::new();

    let result = run(&tree, &eval, &options, 100);
    assert!(result.best_move.is_none());
    assert!(result.best_move_root.is_none());
    assert_eq!(result.terminal, Some(TerminalKind::Checkmate));
    assert_eq!(tree.root_node().n(), 0);
}

#[test]
fn same_seed_reproduces_every_statistic() {
    let mut options = SearchOptions::for_testing();
    options.seed = 99;
    let eval = SeededEvaluator::new(17);

    let tree_a = build_tree(None, &options);
    let a = run(&tree_a, &eval, &options, 300);
    let tree_b = build_tree(None, &options);
    let b = run(&tree_b, &eval, &options, 300);

    assert_eq!(a.best_move, b.best_move);
    assert_eq!(tree_a.root_node().n(), tree_b.root_node().n());
    assert_eq!(tree_a.root_node().q(), tree_b.root_node().q());

    // Node-by-node agreement across the two trees.
    let slots_a = tree_a.children_of(tree_a.root_node());
    let slots_b = tree_b.children_of(tree_b.root_node());
    assert_eq!(slots_a.len(), slots_b.len());
    for (sa, sb) in slots_a.iter().zip(slots_b) {
        assert_eq!(sa.mv(), sb.mv());
        assert_eq!(sa.prior(), sb.prior());
        let (ca, cb) = (sa.child(), sb.child());
        assert_eq!(ca.is_null(), cb.is_null());
        if !ca.is_null() {
            assert_eq!(tree_a.node(ca).n(), tree_b.node(cb).n());
            assert_eq!(tree_a.node(ca).q(), tree_b.node(cb).q());
        }
    }
}

#[test]
fn futility_pruning_stops_a_decided_search_early() {
    // The artificial batch latency keeps the search slow enough for the
    // monitor to observe the decided position mid-flight.
    let eval = SlowEvaluator {
        inner: UniformEvaluator::new(),
        delay: Duration::from_millis(1),
    };

    let mut on = SearchOptions::for_testing();
    on.futility_pruning_stop_search_enabled = true;
    let tree_on = build_tree(Some("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1"), &on);
    let result_on = run(&tree_on, &eval, &on, 4_000);

    let mut off = SearchOptions::for_testing();
    off.futility_pruning_stop_search_enabled = false;
    let tree_off = build_tree(Some("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1"), &off);
    let result_off = run(&tree_off, &eval, &off, 4_000);

    // Both find the mate; the pruned search does not spend the full budget.
    assert_eq!(result_on.best_move.unwrap().to_string(), "a1a8");
    assert_eq!(result_off.best_move.unwrap().to_string(), "a1a8");
    assert!(
        result_on.stats.nodes < result_off.stats.nodes,
        "futility did not save any visits ({} vs {})",
        result_on.stats.nodes,
        result_off.stats.nodes
    );
    assert_eq!(result_off.stats.nodes, 4_000);
}

#[test]
fn first_move_sampler_diversifies_openings() {
    let mut options = SearchOptions::for_testing();
    options.first_move_temperature = 8.0;
    let eval = UniformEvaluator::new();

    let mut seen = std::collections::HashSet::new();
    for seed in 0..10u64 {
        options.seed = seed;
        let tree = build_tree(None, &options);
        let budget = MoveBudget {
            nodes: Some(150),
            time: None,
            think_harder: 1.0,
        };
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let result = SearchManager::new(&tree, &eval, &options, budget)
            .with_first_move_sampling(true)
            .run(&mut rng)
            .unwrap();
        seen.insert(result.best_move.unwrap());
    }
    // A softmax at high temperature over near-uniform visits must not
    // collapse onto a single opening move.
    assert!(seen.len() >= 2, "sampler always picked {:?}", seen);
}

/// Uniform evaluator with an artificial per-batch latency, so time-limited
/// searches take long enough for the monitor to do its job.
struct SlowEvaluator {
    inner: UniformEvaluator,
    delay: Duration,
}

impl Evaluator for SlowEvaluator {
    fn id(&self) -> &crate::evaluator::EvaluatorId {
        self.inner.id()
    }

    fn evaluate_batch(
        &self,
        batch: &[&EncodedPosition],
    ) -> Result<Vec<NetOutput>, EvaluatorError> {
        std::thread::sleep(self.delay);
        self.inner.evaluate_batch(batch)
    }
}

#[test]
fn progress_callback_is_throttled_and_fires() {
    let options = SearchOptions::for_testing();
    let tree = build_tree(None, &options);
    let eval = SlowEvaluator {
        inner: UniformEvaluator::new(),
        delay: Duration::from_millis(5),
    };

    let reports = AtomicU32::new(0);
    let callback = |progress: &SearchProgress| {
        reports.fetch_add(1, Ordering::Relaxed);
        assert!(progress.nodes > 0);
        assert!(progress.time_ms >= 100);
    };

    let budget = MoveBudget {
        nodes: None,
        time: Some(Duration::from_millis(350)),
        think_harder: 1.0,
    };
    let mut rng = ChaCha20Rng::seed_from_u64(0);
    let result = SearchManager::new(&tree, &eval, &options, budget)
        .with_progress(Some(&callback))
        .run(&mut rng)
        .unwrap();

    let fired = reports.load(Ordering::Relaxed);
    assert!(fired >= 1, "no progress report in 350ms");
    assert!(fired <= 4, "callback not throttled: {} reports", fired);
    assert!(result.stats.elapsed >= Duration::from_millis(300));
}

#[test]
fn overlapped_lanes_reach_the_same_budget() {
    let mut options = SearchOptions::for_testing();
    options.flow_direct_overlapped = true;
    let tree = build_tree(None, &options);
    let eval = UniformEvaluator::new();

    let result = run(&tree, &eval, &options, 500);
    // Two lanes may overshoot by at most the in-flight batches they were
    // holding when the budget filled up.
    assert!(result.stats.nodes >= 500);
    assert!(result.stats.nodes <= 500 + 2 * options.max_batch_size as u64);
    assert!(result.best_move.is_some());

    // Both lanes' virtual loss fully drained.
    for index in 1..=tree.store().nodes_allocated() {
        assert_eq!(
            tree.node(crate::node::NodeIndex(index as u32)).inflight_total(),
            0
        );
    }
}

#[test]
fn external_stop_cancels_at_a_batch_boundary() {
    let options = SearchOptions::for_testing();
    let tree = build_tree(None, &options);
    let eval = SlowEvaluator {
        inner: UniformEvaluator::new(),
        delay: Duration::from_millis(5),
    };

    let stop = std::sync::atomic::AtomicBool::new(false);
    let budget = MoveBudget {
        nodes: Some(100_000),
        time: None,
        think_harder: 1.0,
    };
    // Arm the flag from the progress callback, i.e. mid-search.
    let callback = |_: &SearchProgress| {
        stop.store(true, Ordering::Release);
    };

    let mut rng = ChaCha20Rng::seed_from_u64(0);
    let result = SearchManager::new(&tree, &eval, &options, budget)
        .with_progress(Some(&callback))
        .with_stop_signal(Some(&stop))
        .run(&mut rng)
        .unwrap();

    // Cancelled long before the huge budget, with every issued batch
    // drained cleanly.
    assert!(result.stats.nodes < 2_000);
    for index in 1..=tree.store().nodes_allocated() {
        assert_eq!(
            tree.node(crate::node::NodeIndex(index as u32)).inflight_total(),
            0
        );
    }
}

#[test]
fn secondary_network_records_advisory_values() {
    let options = SearchOptions::for_testing();
    let tree = build_tree(None, &options);
    let primary = UniformEvaluator::new();
    let secondary = SeededEvaluator::new(3);

    let budget = MoveBudget {
        nodes: Some(100),
        time: None,
        think_harder: 1.0,
    };
    let mut rng = ChaCha20Rng::seed_from_u64(0);
    SearchManager::new(&tree, &primary, &options, budget)
        .with_secondary(Some(&secondary))
        .run(&mut rng)
        .unwrap();

    // Selection is driven by the primary (uniform) network, but the second
    // opinion is recorded on evaluated nodes.
    let with_second_opinion = (1..=tree.store().nodes_allocated())
        .map(|i| tree.node(crate::node::NodeIndex(i as u32)))
        .filter(|n| n.v_secondary() != 0.0)
        .count();
    assert!(with_second_opinion > 0, "no advisory values recorded");
    let (calls, _) = secondary.counters();
    assert!(calls > 0);
}

#[test]
fn centipawn_mapping_is_fixed_and_monotonic() {
    assert_eq!(q_to_centipawns(0.0), 0);
    assert!(q_to_centipawns(0.25) > 0);
    assert!(q_to_centipawns(-0.25) < 0);
    assert_eq!(q_to_centipawns(0.25), -q_to_centipawns(-0.25));
    assert!(q_to_centipawns(0.5) > q_to_centipawns(0.25));
    // Near-certain wins map far beyond any material scale.
    assert!(q_to_centipawns(1.0) > 9_000);
    // Out-of-range inputs are clamped, not amplified.
    assert_eq!(q_to_centipawns(1.5), q_to_centipawns(1.0));
}
