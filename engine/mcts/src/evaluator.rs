//! Evaluator contract for batched position evaluation.
//!
//! The search never evaluates positions itself; it hands batches of encoded
//! positions to an `Evaluator` and gets back, per position, the value head,
//! the win/draw/loss head, the moves-left head, and dense policy logits
//! indexed by the `chess-core` move codec. In play this is a neural
//! network; for tests this crate ships a uniform evaluator and a seeded
//! deterministic one.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use chess_core::{move_to_policy_index, EncodedPosition, POLICY_DIM};

/// Errors from the evaluation backend. A failed batch aborts the search;
/// the in-flight virtual losses are rolled back first.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluation failed: {0}")]
    Failed(String),

    #[error("ill-formed batch result: expected {expected} outputs, got {got}")]
    Malformed { expected: usize, got: usize },
}

/// Identity of an evaluator: network plus input encoding. Two sessions may
/// share cached evaluations only when their identities match exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorId {
    pub network_id: String,
    pub input_encoding: String,
}

impl EvaluatorId {
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            input_encoding: "planes-v1".into(),
        }
    }
}

/// Raw network heads for one position, side-to-move perspective.
#[derive(Debug, Clone)]
pub struct NetOutput {
    /// Expected outcome in [-1, 1].
    pub value: f32,
    /// (win, draw, loss) probabilities summing to 1.
    pub wdl: [f32; 3],
    /// Predicted remaining plies.
    pub moves_left: f32,
    /// Dense policy logits, [`POLICY_DIM`] long.
    pub policy_logits: Box<[f32]>,
}

/// Batched position evaluator.
pub trait Evaluator: Send + Sync {
    fn id(&self) -> &EvaluatorId;

    /// Evaluate a batch. Must return exactly one output per input, in
    /// input order.
    fn evaluate_batch(&self, batch: &[&EncodedPosition]) -> Result<Vec<NetOutput>, EvaluatorError>;

    /// Largest batch the backend wants to see at once.
    fn max_batch_size(&self) -> usize {
        256
    }

    /// Optional warm-up pass so the first real batch is not the slowest.
    fn warmup(&self) {}
}

/// Extract priors for the legal moves from dense logits and renormalize:
/// a masked softmax over exactly the legal set.
pub fn legal_priors(logits: &[f32], legal: &[chess::ChessMove]) -> Vec<f32> {
    let mut max_logit = f32::NEG_INFINITY;
    for &mv in legal {
        let logit = logits.get(move_to_policy_index(mv)).copied().unwrap_or(0.0);
        if logit.is_finite() && logit > max_logit {
            max_logit = logit;
        }
    }
    if !max_logit.is_finite() {
        // Degenerate head; fall back to uniform over legal moves.
        return vec![1.0 / legal.len().max(1) as f32; legal.len()];
    }

    let mut priors = Vec::with_capacity(legal.len());
    let mut sum = 0.0f32;
    for &mv in legal {
        let logit = logits.get(move_to_policy_index(mv)).copied().unwrap_or(0.0);
        let p = if logit.is_finite() {
            (logit - max_logit).exp()
        } else {
            0.0
        };
        priors.push(p);
        sum += p;
    }
    if sum > 0.0 {
        for p in &mut priors {
            *p /= sum;
        }
    } else {
        let uniform = 1.0 / legal.len().max(1) as f32;
        priors.iter_mut().for_each(|p| *p = uniform);
    }
    priors
}

/// Uniform evaluator: value 0, flat policy. Useful for exercising the
/// search machinery without a model.
pub struct UniformEvaluator {
    id: EvaluatorId,
    calls: AtomicU64,
    positions: AtomicU64,
}

impl UniformEvaluator {
    pub fn new() -> Self {
        Self {
            id: EvaluatorId::new("uniform"),
            calls: AtomicU64::new(0),
            positions: AtomicU64::new(0),
        }
    }

    /// (batches evaluated, positions evaluated).
    pub fn counters(&self) -> (u64, u64) {
        (
            self.calls.load(Ordering::Relaxed),
            self.positions.load(Ordering::Relaxed),
        )
    }
}

impl Default for UniformEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for UniformEvaluator {
    fn id(&self) -> &EvaluatorId {
        &self.id
    }

    fn evaluate_batch(&self, batch: &[&EncodedPosition]) -> Result<Vec<NetOutput>, EvaluatorError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.positions.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(batch
            .iter()
            .map(|_| NetOutput {
                value: 0.0,
                wdl: [0.25, 0.5, 0.25],
                moves_left: 40.0,
                policy_logits: vec![0.0; POLICY_DIM].into_boxed_slice(),
            })
            .collect())
    }
}

/// Deterministic pseudo-network: every head is a pure function of the
/// position hash and the seed. Two runs with the same seed agree exactly,
/// which is what the reproducibility tests need.
pub struct SeededEvaluator {
    id: EvaluatorId,
    seed: u64,
    calls: AtomicU64,
    positions: AtomicU64,
}

impl SeededEvaluator {
    pub fn new(seed: u64) -> Self {
        Self {
            id: EvaluatorId::new(format!("seeded-{seed:#x}")),
            seed,
            calls: AtomicU64::new(0),
            positions: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> (u64, u64) {
        (
            self.calls.load(Ordering::Relaxed),
            self.positions.load(Ordering::Relaxed),
        )
    }

    fn mix(&self, hash: u64, salt: u64) -> u64 {
        // splitmix64 over hash, seed and salt.
        let mut z = hash ^ self.seed.rotate_left(17) ^ salt.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn unit(&self, hash: u64, salt: u64) -> f32 {
        (self.mix(hash, salt) >> 11) as f32 / (1u64 << 53) as f32
    }
}

impl Evaluator for SeededEvaluator {
    fn id(&self) -> &EvaluatorId {
        &self.id
    }

    fn evaluate_batch(&self, batch: &[&EncodedPosition]) -> Result<Vec<NetOutput>, EvaluatorError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.positions.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(batch
            .iter()
            .map(|pos| {
                let value = 0.4 * (self.unit(pos.hash, 1) - 0.5);
                let draw = 0.3 + 0.4 * self.unit(pos.hash, 2);
                let spread = (1.0 - draw) / 2.0;
                let wdl = [
                    spread + value / 2.0,
                    draw,
                    spread - value / 2.0,
                ];
                let mut logits = vec![0.0f32; POLICY_DIM].into_boxed_slice();
                for (i, &mv) in pos.legal.iter().enumerate() {
                    logits[move_to_policy_index(mv)] =
                        2.0 * self.unit(pos.hash, 16 + i as u64) - 1.0;
                }
                NetOutput {
                    value,
                    wdl,
                    moves_left: 20.0 + 60.0 * self.unit(pos.hash, 3),
                    policy_logits: logits,
                }
            })
            .collect())
    }
}

/// Evaluator that always fails; exercises the abort-and-rollback path.
pub struct FailingEvaluator {
    id: EvaluatorId,
}

impl FailingEvaluator {
    pub fn new() -> Self {
        Self {
            id: EvaluatorId::new("failing"),
        }
    }
}

impl Default for FailingEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for FailingEvaluator {
    fn id(&self) -> &EvaluatorId {
        &self.id
    }

    fn evaluate_batch(&self, _batch: &[&EncodedPosition]) -> Result<Vec<NetOutput>, EvaluatorError> {
        Err(EvaluatorError::Failed("backend unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_core::{encode_position, PositionWithHistory};

    #[test]
    fn uniform_priors_sum_to_one() {
        let pos = PositionWithHistory::startpos();
        let eval = UniformEvaluator::new();
        let enc = encode_position(&pos);
        let out = &eval.evaluate_batch(&[&enc]).unwrap()[0];
        let priors = legal_priors(&out.policy_logits, &pos.legal_moves());
        assert_eq!(priors.len(), 20);
        let sum: f32 = priors.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert!(priors.iter().all(|&p| (p - 0.05).abs() < 1e-4));
    }

    #[test]
    fn seeded_evaluator_is_deterministic() {
        let pos = encode_position(&PositionWithHistory::startpos());
        let a = SeededEvaluator::new(7);
        let b = SeededEvaluator::new(7);
        let out_a = &a.evaluate_batch(&[&pos]).unwrap()[0];
        let out_b = &b.evaluate_batch(&[&pos]).unwrap()[0];
        assert_eq!(out_a.value, out_b.value);
        assert_eq!(out_a.wdl, out_b.wdl);
        assert_eq!(out_a.policy_logits, out_b.policy_logits);

        let c = SeededEvaluator::new(8);
        let out_c = &c.evaluate_batch(&[&pos]).unwrap()[0];
        assert_ne!(out_a.value, out_c.value);
    }

    #[test]
    fn seeded_wdl_is_consistent_with_value() {
        let pos = encode_position(&PositionWithHistory::startpos());
        let eval = SeededEvaluator::new(123);
        let out = &eval.evaluate_batch(&[&pos]).unwrap()[0];
        let [w, d, l] = out.wdl;
        assert!((w + d + l - 1.0).abs() < 1e-5);
        assert!((w - l - out.value).abs() < 1e-5);
    }

    #[test]
    fn priors_ignore_garbage_logits() {
        let pos = PositionWithHistory::startpos();
        let legal = pos.legal_moves();
        let mut logits = vec![f32::NAN; POLICY_DIM];
        logits[move_to_policy_index(legal[0])] = 1.0;
        let priors = legal_priors(&logits, &legal);
        let sum: f32 = priors.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }
}
