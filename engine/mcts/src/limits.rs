//! Per-move budgets from game-level limits.
//!
//! The limit manager turns a game-level allowance (nodes or seconds, with
//! optional per-move increment) into a budget for the move at hand. The
//! default manager spreads the remaining allowance over a logistic
//! estimate of the moves still to be played and asks for deeper thought
//! when the root evaluation has been swinging. Allocation is a pure
//! function of its inputs; callers may substitute their own manager.

use std::time::Duration;

/// Game- or move-level search allowance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchLimit {
    NodesPerMove(u64),
    SecondsPerMove(f64),
    NodesForAllMoves { total: u64, increment: u64 },
    SecondsForAllGame { total: f64, increment: f64 },
}

/// Budget for one move. `nodes` caps root visits, `time` arms the deadline;
/// either may be absent but not both.
#[derive(Debug, Clone, Copy)]
pub struct MoveBudget {
    pub nodes: Option<u64>,
    pub time: Option<Duration>,
    /// Multiplier already folded into the budget; reported for diagnostics.
    pub think_harder: f32,
}

/// What the game has looked like so far, as the limit manager sees it.
#[derive(Debug, Clone, Default)]
pub struct GameHistory {
    /// Plies played by this side.
    pub ply: u32,
    pub seconds_spent: Vec<f64>,
    pub nodes_spent: Vec<u64>,
    /// Root Q after each of this side's searches.
    pub root_q: Vec<f32>,
    pub remaining_nodes: Option<u64>,
    pub remaining_seconds: Option<f64>,
}

impl GameHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_move(&mut self, seconds: f64, nodes: u64, root_q: f32) {
        self.ply += 1;
        self.seconds_spent.push(seconds);
        self.nodes_spent.push(nodes);
        self.root_q.push(root_q);
        if let Some(remaining) = &mut self.remaining_nodes {
            *remaining = remaining.saturating_sub(nodes);
        }
        if let Some(remaining) = &mut self.remaining_seconds {
            *remaining = (*remaining - seconds).max(0.0);
        }
    }
}

pub trait LimitManager: Send + Sync {
    fn budget_for_move(&self, limit: &SearchLimit, history: &GameHistory) -> MoveBudget;
}

/// Logistic apportioning with a volatility bonus.
#[derive(Debug, Clone)]
pub struct DefaultLimitManager {
    /// Ply at which the expected-remaining-moves curve is halfway down.
    pub midpoint: f32,
    pub steepness: f32,
    /// Expected remaining moves never drops below this.
    pub floor_moves: f32,
    /// Extra moves expected at the very start of the game.
    pub span_moves: f32,
    /// Root-Q swing (over the last few moves) that triggers deeper thought.
    pub volatility_threshold: f32,
    pub think_harder_boost: f32,
}

impl Default for DefaultLimitManager {
    fn default() -> Self {
        Self {
            midpoint: 40.0,
            steepness: 12.0,
            floor_moves: 12.0,
            span_moves: 28.0,
            volatility_threshold: 0.08,
            think_harder_boost: 1.4,
        }
    }
}

impl DefaultLimitManager {
    /// Expected moves still to be played, as a logistic function of ply.
    fn expected_remaining_moves(&self, ply: u32) -> f32 {
        let x = (ply as f32 - self.midpoint) / self.steepness;
        self.floor_moves + self.span_moves / (1.0 + x.exp())
    }

    /// Swing of the root evaluation over the last four of our moves.
    fn think_harder(&self, history: &GameHistory) -> f32 {
        let window = history.root_q.iter().rev().take(4).copied();
        let (mut lo, mut hi, mut count) = (f32::INFINITY, f32::NEG_INFINITY, 0);
        for q in window {
            lo = lo.min(q);
            hi = hi.max(q);
            count += 1;
        }
        if count >= 2 && hi - lo > self.volatility_threshold {
            self.think_harder_boost
        } else {
            1.0
        }
    }
}

impl LimitManager for DefaultLimitManager {
    fn budget_for_move(&self, limit: &SearchLimit, history: &GameHistory) -> MoveBudget {
        let think = self.think_harder(history);
        match *limit {
            SearchLimit::NodesPerMove(nodes) => MoveBudget {
                nodes: Some(nodes),
                time: None,
                think_harder: 1.0,
            },
            SearchLimit::SecondsPerMove(seconds) => MoveBudget {
                nodes: None,
                time: Some(Duration::from_secs_f64(seconds.max(0.0))),
                think_harder: 1.0,
            },
            SearchLimit::NodesForAllMoves { total, increment } => {
                let remaining = history.remaining_nodes.unwrap_or(total);
                let share =
                    (remaining as f32 / self.expected_remaining_moves(history.ply)) * think;
                // Never budget more than half of what is left.
                let nodes = (share as u64 + increment).min(remaining.max(1) / 2 + increment);
                MoveBudget {
                    nodes: Some(nodes.max(1)),
                    time: None,
                    think_harder: think,
                }
            }
            SearchLimit::SecondsForAllGame { total, increment } => {
                let remaining = history.remaining_seconds.unwrap_or(total);
                let share =
                    (remaining as f32 / self.expected_remaining_moves(history.ply)) * think;
                let seconds = (share as f64 + increment * 0.75).min(remaining.max(0.01) / 2.0);
                MoveBudget {
                    nodes: None,
                    time: Some(Duration::from_secs_f64(seconds.max(0.001))),
                    think_harder: think,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_at(ply: u32, remaining_nodes: u64) -> GameHistory {
        GameHistory {
            ply,
            remaining_nodes: Some(remaining_nodes),
            ..GameHistory::default()
        }
    }

    #[test]
    fn per_move_limits_pass_through() {
        let manager = DefaultLimitManager::default();
        let budget =
            manager.budget_for_move(&SearchLimit::NodesPerMove(5_000), &GameHistory::new());
        assert_eq!(budget.nodes, Some(5_000));
        assert!(budget.time.is_none());

        let budget =
            manager.budget_for_move(&SearchLimit::SecondsPerMove(2.5), &GameHistory::new());
        assert_eq!(budget.time, Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn allocation_is_deterministic() {
        let manager = DefaultLimitManager::default();
        let limit = SearchLimit::NodesForAllMoves {
            total: 1_000_000,
            increment: 100,
        };
        let a = manager.budget_for_move(&limit, &history_at(10, 800_000));
        let b = manager.budget_for_move(&limit, &history_at(10, 800_000));
        assert_eq!(a.nodes, b.nodes);
    }

    #[test]
    fn later_plies_get_a_larger_share_of_whats_left() {
        let manager = DefaultLimitManager::default();
        let limit = SearchLimit::NodesForAllMoves {
            total: 1_000_000,
            increment: 0,
        };
        // Same remaining allowance, deeper into the game: fewer expected
        // moves left, so the per-move share grows.
        let early = manager.budget_for_move(&limit, &history_at(4, 400_000));
        let late = manager.budget_for_move(&limit, &history_at(80, 400_000));
        assert!(late.nodes.unwrap() > early.nodes.unwrap());
    }

    #[test]
    fn budget_never_exceeds_half_the_remainder() {
        let manager = DefaultLimitManager::default();
        let limit = SearchLimit::NodesForAllMoves {
            total: 1_000,
            increment: 0,
        };
        let budget = manager.budget_for_move(&limit, &history_at(200, 1_000));
        assert!(budget.nodes.unwrap() <= 500);
    }

    #[test]
    fn unstable_root_q_thinks_harder() {
        let manager = DefaultLimitManager::default();
        let limit = SearchLimit::NodesForAllMoves {
            total: 1_000_000,
            increment: 0,
        };
        let calm = GameHistory {
            ply: 20,
            root_q: vec![0.10, 0.11, 0.10, 0.11],
            remaining_nodes: Some(500_000),
            ..GameHistory::default()
        };
        let swingy = GameHistory {
            ply: 20,
            root_q: vec![0.10, 0.35, -0.05, 0.25],
            remaining_nodes: Some(500_000),
            ..GameHistory::default()
        };
        let a = manager.budget_for_move(&limit, &calm);
        let b = manager.budget_for_move(&limit, &swingy);
        assert_eq!(a.think_harder, 1.0);
        assert!(b.think_harder > 1.0);
        assert!(b.nodes.unwrap() > a.nodes.unwrap());
    }

    #[test]
    fn history_bookkeeping_decrements_remainders() {
        let mut history = GameHistory {
            remaining_nodes: Some(10_000),
            remaining_seconds: Some(60.0),
            ..GameHistory::default()
        };
        history.record_move(2.5, 4_000, 0.1);
        assert_eq!(history.ply, 1);
        assert_eq!(history.remaining_nodes, Some(6_000));
        assert!((history.remaining_seconds.unwrap() - 57.5).abs() < 1e-9);
    }
}
