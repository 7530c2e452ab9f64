//! End-to-end properties of the search core, exercised through the public
//! API with deterministic test evaluators.

use std::sync::Arc;

use chess::{ChessMove, File, Rank, Square};
use chess_core::{encode_position, PositionWithHistory, TerminalKind};
use mcts::apply::BatchApplier;
use mcts::chain::EvaluatorChain;
use mcts::evaluator::legal_priors;
use mcts::limits::DefaultLimitManager;
use mcts::selector::LeafSelector;
use mcts::{
    CacheMode, EvalCache, Evaluator, MoveBudget, NodeIndex, SearchLimit, SearchManager,
    SearchOptions, SearchSession, SeededEvaluator, Tree, UniformEvaluator,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

fn mv(from: (File, Rank), to: (File, Rank)) -> ChessMove {
    ChessMove::new(
        Square::make_square(from.1, from.0),
        Square::make_square(to.1, to.0),
        None,
    )
}

fn run_search(tree: &Tree, evaluator: &dyn Evaluator, options: &SearchOptions, nodes: u64) {
    let budget = MoveBudget {
        nodes: Some(nodes),
        time: None,
        think_harder: 1.0,
    };
    let mut rng = ChaCha20Rng::seed_from_u64(options.seed);
    SearchManager::new(tree, evaluator, options, budget)
        .run(&mut rng)
        .unwrap();
}

/// Scenario: batch of 64 with a single selector lane never selects the
/// same non-terminal leaf twice.
#[test]
fn one_batch_never_duplicates_a_leaf() {
    let mut options = SearchOptions::for_testing();
    options.max_wasted_descents_per_batch = 64;
    let cache = Arc::new(EvalCache::new(1024, CacheMode::Off));
    let tree = Tree::new(PositionWithHistory::startpos(), &options, cache).unwrap();
    let eval = UniformEvaluator::new();

    // Expand the root and give the tree some shape first.
    run_search(&tree, &eval, &options, 40);

    let chain = EvaluatorChain::from_options(&options);
    let selector = LeafSelector::new(&tree, &chain, &options, 0);
    let batch = selector.collect(64).unwrap();
    assert!(batch.entries.len() >= 32, "batch came up short");

    let mut seen = std::collections::HashSet::new();
    for entry in &batch.entries {
        if tree.node(entry.node).terminal() == TerminalKind::NonTerminal {
            assert!(
                seen.insert(entry.node),
                "leaf {:?} selected twice in one batch",
                entry.node
            );
        }
    }

    BatchApplier::new(&tree, 0).rollback(&batch);
}

/// P2/P3/P4: after a finished search the root Q is a mean in [-1, 1], no
/// virtual loss survives anywhere, and priors sum to 1 at every expanded
/// node.
#[test]
fn tree_invariants_hold_after_a_search() {
    let options = SearchOptions::for_testing();
    let cache = Arc::new(EvalCache::new(4096, CacheMode::ReadWrite));
    let tree = Tree::new(PositionWithHistory::startpos(), &options, cache).unwrap();
    let eval = SeededEvaluator::new(5);

    run_search(&tree, &eval, &options, 600);

    let root = tree.root_node();
    assert_eq!(root.n(), 600);
    assert!((-1.0..=1.0).contains(&root.q()));

    for index in 1..=tree.store().nodes_allocated() {
        let node = tree.node(NodeIndex(index as u32));
        assert_eq!(node.inflight_total(), 0, "leaked virtual loss");

        if node.num_children() > 0 {
            let sum: f32 = tree.children_of(node).iter().map(|s| s.prior()).sum();
            assert!(
                (sum - 1.0).abs() < 1e-4,
                "priors sum to {} at node {}",
                sum,
                index
            );
        }
    }

    // P5: any root-to-node move sequence is a legal game line. The child
    // tables were built from legal-move enumeration, so replaying the
    // most-visited line must never be rejected.
    let mut replay = PositionWithHistory::startpos();
    for mv in mcts::manager::principal_variation(&tree) {
        replay.try_push(mv).expect("pv contains an illegal move");
    }
}

/// Round trip: the priors stored in the child table are exactly the
/// renormalized legal slice of the dense policy head.
#[test]
fn stored_priors_match_renormalized_policy() {
    let options = SearchOptions::for_testing();
    let cache = Arc::new(EvalCache::new(256, CacheMode::Off));
    let position = PositionWithHistory::startpos();
    let tree = Tree::new(position.clone(), &options, cache).unwrap();
    let eval = SeededEvaluator::new(11);

    run_search(&tree, &eval, &options, 30);

    let encoded = encode_position(&position);
    let output = &eval.evaluate_batch(&[&encoded]).unwrap()[0];
    let expected = legal_priors(&output.policy_logits, &encoded.legal);

    let slots = tree.children_of(tree.root_node());
    assert_eq!(slots.len(), expected.len());
    for (slot, (&mv, &prior)) in slots.iter().zip(encoded.legal.iter().zip(&expected)) {
        assert_eq!(slot.mv(), mv);
        assert!(
            (slot.prior() - prior).abs() < 1e-6,
            "stored prior diverges for {}",
            mv
        );
    }
}

/// P7: a continuation that reuses the subtree ends up close to a fresh
/// search given the same total visit count on the same position.
#[test]
fn continuation_matches_equivalent_fresh_search() {
    let mut options = SearchOptions::for_testing();
    options.reuse_threshold_fraction = 0.02;
    let evaluator = Arc::new(SeededEvaluator::new(21));

    let mut continued = SearchSession::new(
        options.clone(),
        evaluator.clone(),
        None,
        Box::new(DefaultLimitManager::default()),
    )
    .unwrap();
    continued
        .search(
            PositionWithHistory::startpos(),
            &SearchLimit::NodesPerMove(1_500),
            None,
        )
        .unwrap();
    let step = mv((File::E, Rank::Second), (File::E, Rank::Fourth));
    let cont = continued
        .search_continue(&[step], true, &SearchLimit::NodesPerMove(500), None)
        .unwrap();
    let reused = cont.root_n_when_search_started as u64;
    assert!(reused > 0, "continuation did not reuse the subtree");

    // Fresh search over the same position with the same total visits.
    let mut fresh = SearchSession::new(
        options,
        evaluator,
        None,
        Box::new(DefaultLimitManager::default()),
    )
    .unwrap();
    let mut position = PositionWithHistory::startpos();
    position.push(step);
    let base = fresh
        .search(position, &SearchLimit::NodesPerMove(reused + 500), None)
        .unwrap();

    assert_eq!(cont.stats.nodes, base.stats.nodes);
    assert!(
        (cont.stats.q - base.stats.q).abs() < 0.1,
        "continued q {} vs fresh q {}",
        cont.stats.q,
        base.stats.q
    );
    let wdl_gap = cont
        .stats
        .wdl
        .iter()
        .zip(&base.stats.wdl)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(wdl_gap < 0.15, "wdl diverged by {}", wdl_gap);
}

/// A root position drawn by threefold repetition reports the terminal
/// instead of searching.
#[test]
fn repeated_position_is_terminal_at_root() {
    let mut position = PositionWithHistory::startpos();
    let shuffle = [
        mv((File::G, Rank::First), (File::F, Rank::Third)),
        mv((File::G, Rank::Eighth), (File::F, Rank::Sixth)),
        mv((File::F, Rank::Third), (File::G, Rank::First)),
        mv((File::F, Rank::Sixth), (File::G, Rank::Eighth)),
    ];
    for _ in 0..2 {
        for m in shuffle {
            position.push(m);
        }
    }

    let mut session = SearchSession::new(
        SearchOptions::for_testing(),
        Arc::new(UniformEvaluator::new()),
        None,
        Box::new(DefaultLimitManager::default()),
    )
    .unwrap();
    let result = session
        .search(position, &SearchLimit::NodesPerMove(100), None)
        .unwrap();

    assert!(result.best_move.is_none());
    assert_eq!(result.terminal, Some(TerminalKind::Draw));
}

/// The evaluation cache actually short-circuits repeat evaluations: a
/// second session over the same game line with a shared-size budget calls
/// the network strictly less when its own cache is warm.
#[test]
fn cache_reuse_reduces_network_calls_within_a_session() {
    let options = SearchOptions::for_testing();
    let evaluator = Arc::new(UniformEvaluator::new());
    let mut session = SearchSession::new(
        options,
        evaluator.clone(),
        None,
        Box::new(DefaultLimitManager::default()),
    )
    .unwrap();

    session
        .search(
            PositionWithHistory::startpos(),
            &SearchLimit::NodesPerMove(400),
            None,
        )
        .unwrap();
    let (_, after_first) = evaluator.counters();

    // Same game, fresh tree (threshold 1.0 forces the fallback), same
    // budget: the session cache supplies most of the evaluations.
    session.reset_game();
    session
        .search(
            PositionWithHistory::startpos(),
            &SearchLimit::NodesPerMove(400),
            None,
        )
        .unwrap();
    let (_, after_second) = evaluator.counters();

    let second_run = after_second - after_first;
    assert!(
        second_run < after_first / 2,
        "cache saved too little: {} fresh vs {} warm",
        after_first,
        second_run
    );
}
