//! Neural-network-guided Monte Carlo Tree Search core.
//!
//! The search grows a tree over chess positions by repeatedly selecting
//! promising leaves with PUCT, batching them for evaluation by a neural
//! network, and backing the results up to the root. The crate is organized
//! along the pipeline:
//!
//! 1. **Selection** ([`selector`]): PUCT descent with per-lane virtual
//!    loss, collecting a batch of distinct leaves
//! 2. **Classification** ([`chain`]): terminal detection, cache and
//!    transposition hits, NN submission
//! 3. **Evaluation** ([`evaluator`]): the batched network contract
//! 4. **Backup** ([`apply`]): writing policy and value statistics along
//!    the ancestor paths
//!
//! [`flow`] runs one or two overlapped selection/backup lanes against the
//! shared [`tree`]; [`manager`] drives a single move search under a budget
//! from [`limits`]; [`session`] owns the tree across a game, re-rooting it
//! after each played move and optionally sharing cached evaluations with
//! an opposing session.
//!
//! Nodes live in a pre-allocated, index-addressed arena ([`store`]) whose
//! hot fields are atomics, so both lanes mutate the same tree without
//! locks on the search path.

pub mod apply;
pub mod batching;
pub mod cache;
pub mod chain;
pub mod config;
pub mod evaluator;
pub mod flow;
pub mod limits;
pub mod manager;
pub mod node;
pub mod selector;
pub mod session;
pub mod store;
pub mod tree;

// Re-export main types for convenience
pub use cache::{CacheMode, CachedEval, EvalCache};
pub use config::{ConfigError, SearchOptions};
pub use evaluator::{
    Evaluator, EvaluatorError, EvaluatorId, NetOutput, SeededEvaluator, UniformEvaluator,
};
pub use limits::{DefaultLimitManager, GameHistory, LimitManager, MoveBudget, SearchLimit};
pub use manager::{
    q_to_centipawns, MoveResult, SearchError, SearchManager, SearchProgress, SearchStats,
};
pub use node::{Node, NodeIndex};
pub use session::{SearchSession, SessionError};
pub use store::{NodeStore, StoreError};
pub use tree::{Tree, TreeError, TreeStats};
