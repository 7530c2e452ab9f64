//! Search configuration.

use serde::Deserialize;
use thiserror::Error;

use crate::cache::CacheMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {msg}")]
    Invalid { msg: &'static str },
}

/// All knobs recognized by the search core. Deserializable from TOML; every
/// field falls back to its default when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Run two overlapped selector/applier lanes instead of one.
    pub flow_direct_overlapped: bool,

    /// Scale the virtual-loss weight up as a batch fills.
    pub use_dynamic_vloss: bool,

    /// Stop a move search once the visit lead of the best child exceeds the
    /// visits remaining in the budget.
    pub futility_pruning_stop_search_enabled: bool,

    pub cache_mode: CacheMode,

    /// Identity of the optional second-opinion network.
    pub secondary_network_id: Option<String>,

    /// Synchronously expand the root (1) and optionally one further ply (2)
    /// before the main loop. 0 only expands the root itself.
    pub root_preload_depth: u8,

    /// Let measured evaluator throughput drive the batch size between
    /// `min_batch_size` and `max_batch_size`.
    pub smart_size_batches: bool,

    /// Allow a compatible peer session to read this session's cache, and
    /// read the peer's in return.
    pub reuse_position_evaluations_from_other_tree: bool,

    // PUCT shape. cpuct grows logarithmically with the parent's visits.
    pub cpuct_init: f32,
    pub cpuct_base: f32,
    pub cpuct_factor: f32,

    /// First-play urgency: unvisited children score the parent's Q minus
    /// this reduction scaled by the explored prior mass.
    pub fpu_reduction: f32,

    pub virtual_loss_weight: f32,

    pub target_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,

    /// Give up collecting a batch after this many wasted descents.
    pub max_wasted_descents_per_batch: usize,

    pub max_nodes: usize,
    pub max_children: usize,
    pub cache_capacity: usize,

    /// Minimum fraction of the prior root's visits the re-rooted subtree
    /// must retain for continuation to reuse it. Flagged for tuning.
    pub reuse_threshold_fraction: f32,

    /// Softmax temperature for sampling the first move of a game among the
    /// top children; 0 disables sampling.
    pub first_move_temperature: f32,

    /// Root Dirichlet noise (self-play exploration); epsilon 0 disables.
    pub dirichlet_alpha: f32,
    pub dirichlet_epsilon: f32,

    /// Seed for the first-move sampler and root noise.
    pub seed: u64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            flow_direct_overlapped: false,
            use_dynamic_vloss: false,
            futility_pruning_stop_search_enabled: true,
            cache_mode: CacheMode::ReadWrite,
            secondary_network_id: None,
            root_preload_depth: 1,
            smart_size_batches: true,
            reuse_position_evaluations_from_other_tree: true,
            cpuct_init: 1.745,
            cpuct_base: 38_739.0,
            cpuct_factor: 3.894,
            fpu_reduction: 0.33,
            virtual_loss_weight: 1.0,
            target_batch_size: 64,
            min_batch_size: 4,
            max_batch_size: 256,
            max_wasted_descents_per_batch: 16,
            max_nodes: 1 << 20,
            max_children: 1 << 22,
            cache_capacity: 200_000,
            reuse_threshold_fraction: 0.05,
            first_move_temperature: 0.0,
            dirichlet_alpha: 0.3,
            dirichlet_epsilon: 0.0,
            seed: 0,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cpuct_init.is_finite() && self.cpuct_init > 0.0) {
            return Err(ConfigError::Invalid {
                msg: "cpuct_init must be finite and > 0",
            });
        }
        if !(self.cpuct_base.is_finite() && self.cpuct_base >= 1.0) {
            return Err(ConfigError::Invalid {
                msg: "cpuct_base must be >= 1",
            });
        }
        if !(self.virtual_loss_weight.is_finite() && self.virtual_loss_weight >= 0.0) {
            return Err(ConfigError::Invalid {
                msg: "virtual_loss_weight must be finite and >= 0",
            });
        }
        if self.min_batch_size == 0 || self.target_batch_size == 0 {
            return Err(ConfigError::Invalid {
                msg: "batch sizes must be > 0",
            });
        }
        if self.min_batch_size > self.max_batch_size
            || self.target_batch_size > self.max_batch_size
        {
            return Err(ConfigError::Invalid {
                msg: "batch size bounds are inverted",
            });
        }
        if self.max_nodes < 2 {
            return Err(ConfigError::Invalid {
                msg: "max_nodes must hold at least a root",
            });
        }
        if !(0.0..=1.0).contains(&self.reuse_threshold_fraction) {
            return Err(ConfigError::Invalid {
                msg: "reuse_threshold_fraction must lie in [0, 1]",
            });
        }
        if self.root_preload_depth > 2 {
            return Err(ConfigError::Invalid {
                msg: "root_preload_depth must be 0, 1 or 2",
            });
        }
        Ok(())
    }

    /// Small pools and deterministic settings for tests. Futility pruning
    /// is off because its stop point depends on monitor timing.
    pub fn for_testing() -> Self {
        Self {
            max_nodes: 1 << 14,
            max_children: 1 << 17,
            cache_capacity: 4_096,
            target_batch_size: 8,
            smart_size_batches: false,
            futility_pruning_stop_search_enabled: false,
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.target_batch_size = size;
        self
    }

    pub fn with_overlapped_lanes(mut self, enabled: bool) -> Self {
        self.flow_direct_overlapped = enabled;
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }
}
