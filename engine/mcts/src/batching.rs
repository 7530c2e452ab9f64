//! Batch sizing from observed evaluator throughput.
//!
//! When `smart_size_batches` is on, each lane tracks an exponential moving
//! average of how fast the evaluator consumes positions and aims the next
//! batch at a fixed latency window, clamped to the configured bounds. This
//! keeps a fast evaluator from starving on small batches and a slow one
//! from stalling selection behind huge ones.

use std::time::Duration;

use crate::config::SearchOptions;

/// Per-batch latency the sizing aims for.
const TARGET_LATENCY: Duration = Duration::from_millis(20);
const EMA_WEIGHT: f64 = 0.2;

pub struct BatchParamsManager {
    smart: bool,
    target: usize,
    min: usize,
    max: usize,
    /// Positions per second, exponentially smoothed. Zero until the first
    /// measurement lands.
    ema_rate: f64,
}

impl BatchParamsManager {
    pub fn new(options: &SearchOptions) -> Self {
        Self {
            smart: options.smart_size_batches,
            target: options.target_batch_size,
            min: options.min_batch_size,
            max: options.max_batch_size,
            ema_rate: 0.0,
        }
    }

    pub fn target_batch_size(&self) -> usize {
        self.target
    }

    /// Fold in one completed evaluator round trip.
    pub fn record_batch(&mut self, positions: usize, elapsed: Duration) {
        if !self.smart || positions == 0 {
            return;
        }
        let secs = elapsed.as_secs_f64().max(1e-6);
        let rate = positions as f64 / secs;
        self.ema_rate = if self.ema_rate == 0.0 {
            rate
        } else {
            EMA_WEIGHT * rate + (1.0 - EMA_WEIGHT) * self.ema_rate
        };

        let sized = (self.ema_rate * TARGET_LATENCY.as_secs_f64()).round() as usize;
        self.target = sized.clamp(self.min, self.max);
    }
}
