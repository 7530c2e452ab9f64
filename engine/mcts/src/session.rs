//! A search session: one side of one game.
//!
//! The session owns the tree across successive moves, the evaluation cache
//! that outlives individual trees, the game history fed to the limit
//! manager, and the optional peer binding that lets two opposing engines
//! share cached evaluations. `search` starts from scratch,
//! `search_continue` re-roots the prior tree along the played moves and
//! falls back to a fresh tree when too little of it survives.

use std::sync::Arc;

use chess::ChessMove;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, info};

use chess_core::{PositionWithHistory, TerminalKind};

use crate::cache::{CacheMode, EvalCache};
use crate::config::{ConfigError, SearchOptions};
use crate::evaluator::{Evaluator, EvaluatorId};
use crate::limits::{GameHistory, LimitManager, SearchLimit};
use crate::manager::{MoveResult, ProgressCallback, SearchError, SearchManager};
use crate::store::StoreError;
use crate::tree::{Tree, TreeError};

#[derive(Debug, Error)]
pub enum SessionError {
    /// The continuation request does not extend the prior search's game
    /// line. Fatal to the session's retained state.
    #[error("continuation does not extend the prior search's game line")]
    InconsistentContinuation,

    /// Peer sessions must agree on evaluator identity and cache mode, and
    /// both must opt into sharing.
    #[error("peer session is not compatible for evaluation sharing")]
    PeerIncompatible,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Search(#[from] SearchError),
}

/// What a session remembers about a bound peer.
struct PeerContext {
    cache: Arc<EvalCache>,
    evaluator_id: EvaluatorId,
}

pub struct SearchSession {
    options: SearchOptions,
    evaluator: Arc<dyn Evaluator>,
    secondary: Option<Arc<dyn Evaluator>>,
    limit_manager: Box<dyn LimitManager>,
    /// Shared across every tree this session builds, so evaluations from a
    /// discarded tree keep serving the fresh one.
    cache: Arc<EvalCache>,
    tree: Option<Tree>,
    history: GameHistory,
    peer: Option<PeerContext>,
    rng: ChaCha20Rng,
}

impl SearchSession {
    pub fn new(
        options: SearchOptions,
        evaluator: Arc<dyn Evaluator>,
        secondary: Option<Arc<dyn Evaluator>>,
        limit_manager: Box<dyn LimitManager>,
    ) -> Result<Self, SessionError> {
        options.validate()?;
        let cache = Arc::new(EvalCache::new(options.cache_capacity, options.cache_mode));
        let rng = ChaCha20Rng::seed_from_u64(options.seed);
        Ok(Self {
            options,
            evaluator,
            secondary,
            limit_manager,
            cache,
            tree: None,
            history: GameHistory::new(),
            peer: None,
            rng,
        })
    }

    pub fn evaluator_id(&self) -> &EvaluatorId {
        self.evaluator.id()
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.options.cache_mode
    }

    /// Whether this session permits peers to read its cache.
    pub fn authorizes_sharing(&self) -> bool {
        self.options.reuse_position_evaluations_from_other_tree
    }

    pub fn has_peer_context(&self) -> bool {
        self.peer.is_some()
    }

    /// The retained tree, if any (diagnostics and tests).
    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    pub fn history(&self) -> &GameHistory {
        &self.history
    }

    /// Bind `peer` so this session reads its cache. The peer's own peer
    /// back-reference is severed first: without that, each game would chain
    /// one more generation of retired caches and pin them all.
    pub fn bind_peer(&mut self, peer: &mut SearchSession) -> Result<(), SessionError> {
        let compatible = self.evaluator.id() == peer.evaluator.id()
            && self.cache_mode() == peer.cache_mode()
            && self.authorizes_sharing()
            && peer.authorizes_sharing();
        if !compatible {
            return Err(SessionError::PeerIncompatible);
        }

        peer.clear_shared_context();
        self.peer = Some(PeerContext {
            cache: Arc::clone(&peer.cache),
            evaluator_id: peer.evaluator.id().clone(),
        });
        if let Some(tree) = &mut self.tree {
            tree.set_peer_cache(Arc::clone(&self.peer.as_ref().expect("just bound").cache));
        }
        info!(peer = %peer.evaluator.id().network_id, "peer cache bound");
        Ok(())
    }

    /// Drop the peer back-reference on the session and its tree.
    pub fn clear_shared_context(&mut self) {
        self.peer = None;
        if let Some(tree) = &mut self.tree {
            tree.clear_shared_context();
        }
    }

    /// Forget the game: tree, history, and peer binding.
    pub fn reset_game(&mut self) {
        self.tree = None;
        self.history = GameHistory::new();
        self.peer = None;
        self.rng = ChaCha20Rng::seed_from_u64(self.options.seed);
    }

    /// Fresh search from `position`.
    pub fn search(
        &mut self,
        position: PositionWithHistory,
        limit: &SearchLimit,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<MoveResult, SessionError> {
        let tree = self.build_tree(position)?;
        self.run_on(tree, limit, progress)
    }

    /// Continue from the prior search: walk `forward_moves` from its root
    /// and reuse the reached subtree if it holds at least
    /// `reuse_threshold_fraction` of the prior visits. Otherwise a fresh
    /// tree is built on the resulting position. `reuse_peer_context`
    /// keeps or severs the peer binding for this and later searches.
    pub fn search_continue(
        &mut self,
        forward_moves: &[ChessMove],
        reuse_peer_context: bool,
        limit: &SearchLimit,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<MoveResult, SessionError> {
        if !reuse_peer_context {
            self.clear_shared_context();
        }

        let mut prior = self
            .tree
            .take()
            .ok_or(SessionError::InconsistentContinuation)?;

        // The new game line must extend the prior root's line; anything
        // else means the caller switched games under us.
        let mut target = prior.root_position().clone();
        for &mv in forward_moves {
            if target.try_push(mv).is_err() {
                return Err(SessionError::InconsistentContinuation);
            }
        }

        let prior_n = prior.root_node().n() as f32;
        let threshold = self.options.reuse_threshold_fraction * prior_n;

        let tree = match prior.re_root(forward_moves) {
            Ok(()) => {
                let retained = prior.root_node().n() as f32;
                if retained >= threshold {
                    debug!(
                        retained = retained as u64,
                        prior = prior_n as u64,
                        "continuing on reused subtree"
                    );
                    prior
                } else {
                    debug!(
                        retained = retained as u64,
                        prior = prior_n as u64,
                        "reused subtree too small, starting fresh"
                    );
                    self.build_tree(target)?
                }
            }
            Err(TreeError::NotReusable) => {
                debug!("played line leaves the stored tree, starting fresh");
                self.build_tree(target)?
            }
        };

        self.run_on(tree, limit, progress)
    }

    fn build_tree(&self, position: PositionWithHistory) -> Result<Tree, SessionError> {
        let mut tree = Tree::new(position, &self.options, Arc::clone(&self.cache))?;
        if let Some(peer) = &self.peer {
            tree.set_peer_cache(Arc::clone(&peer.cache));
        }
        Ok(tree)
    }

    fn run_on(
        &mut self,
        tree: Tree,
        limit: &SearchLimit,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<MoveResult, SessionError> {
        self.seed_remaining_allowance(limit);
        let budget = self.limit_manager.budget_for_move(limit, &self.history);

        // The second opinion only runs when configuration names it and the
        // provided evaluator matches that identity.
        let secondary = match &self.options.secondary_network_id {
            Some(id) => self
                .secondary
                .as_deref()
                .filter(|s| &s.id().network_id == id),
            None => None,
        };

        let result = {
            let manager = SearchManager::new(&tree, &*self.evaluator, &self.options, budget)
                .with_secondary(secondary)
                .with_progress(progress)
                .with_first_move_sampling(self.history.ply == 0);
            manager.run(&mut self.rng)
        };

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                // The tree survives aborted searches (store exhaustion
                // leaves it consistent), so keep it for diagnostics.
                self.tree = Some(tree);
                return Err(err.into());
            }
        };

        self.history.record_move(
            result.stats.elapsed.as_secs_f64(),
            result.stats.visits,
            result.stats.q,
        );
        self.tree = Some(tree);
        Ok(result)
    }

    /// First use of a game-level limit arms the running remainder.
    fn seed_remaining_allowance(&mut self, limit: &SearchLimit) {
        match *limit {
            SearchLimit::NodesForAllMoves { total, .. } => {
                self.history.remaining_nodes.get_or_insert(total);
            }
            SearchLimit::SecondsForAllGame { total, .. } => {
                self.history.remaining_seconds.get_or_insert(total);
            }
            _ => {}
        }
    }

    /// Terminal state of the retained root, if a tree is held.
    pub fn root_terminal(&self) -> Option<TerminalKind> {
        self.tree.as_ref().map(|t| t.root_terminal())
    }

    /// The peer's evaluator identity, when bound.
    pub fn peer_evaluator_id(&self) -> Option<&EvaluatorId> {
        self.peer.as_ref().map(|p| &p.evaluator_id)
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
