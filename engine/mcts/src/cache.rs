//! Bounded concurrent cache of NN evaluations keyed by position hash.
//!
//! The cache is sharded: each shard pairs a hash map with a FIFO ring of
//! the keys inserted into it, so a full shard evicts its approximately
//! oldest entry. Strict LRU is deliberately not attempted. Reads take a
//! shard read lock and clone an `Arc`; writes take the shard write lock.
//! Peer trees hold a shared handle and only ever read, so a peer can never
//! evict the owner's entries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use serde::Deserialize;

const NUM_SHARDS: usize = 16;

/// Whether the cache serves and/or accepts entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Off,
    ReadOnly,
    ReadWrite,
}

/// A cached evaluation: the value heads plus the legal-move priors, stored
/// compressed as (packed move, prior) pairs rather than a dense vector.
#[derive(Debug, Clone)]
pub struct CachedEval {
    pub value: f32,
    pub wdl: [f32; 3],
    pub moves_left: f32,
    pub policy: Box<[(u16, f32)]>,
}

struct Shard {
    map: FxHashMap<u64, Arc<CachedEval>>,
    ring: VecDeque<u64>,
}

/// Sharded bounded evaluation cache.
pub struct EvalCache {
    shards: Box<[RwLock<Shard>]>,
    shard_capacity: usize,
    mode: CacheMode,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EvalCache {
    pub fn new(capacity: usize, mode: CacheMode) -> Self {
        let shard_capacity = (capacity / NUM_SHARDS).max(1);
        let shards = (0..NUM_SHARDS)
            .map(|_| {
                RwLock::new(Shard {
                    map: FxHashMap::default(),
                    ring: VecDeque::with_capacity(shard_capacity),
                })
            })
            .collect();
        Self {
            shards,
            shard_capacity,
            mode,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    #[inline]
    fn shard(&self, hash: u64) -> &RwLock<Shard> {
        // High bits select the shard; the map hashes the low bits anyway.
        &self.shards[(hash >> 60) as usize % NUM_SHARDS]
    }

    pub fn lookup(&self, hash: u64) -> Option<Arc<CachedEval>> {
        if self.mode == CacheMode::Off {
            return None;
        }
        let shard = self.shard(hash).read().expect("cache shard poisoned");
        match shard.map.get(&hash) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an entry, evicting the shard's oldest key when full. A no-op
    /// unless the cache is in read-write mode.
    pub fn insert(&self, hash: u64, eval: CachedEval) {
        if self.mode != CacheMode::ReadWrite {
            return;
        }
        let mut shard = self.shard(hash).write().expect("cache shard poisoned");
        if shard.map.contains_key(&hash) {
            // Refresh in place; the ring already carries the key.
            shard.map.insert(hash, Arc::new(eval));
            return;
        }
        while shard.map.len() >= self.shard_capacity {
            match shard.ring.pop_front() {
                Some(oldest) => {
                    shard.map.remove(&oldest);
                }
                None => break,
            }
        }
        shard.map.insert(hash, Arc::new(eval));
        shard.ring.push_back(hash);
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("cache shard poisoned").map.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
