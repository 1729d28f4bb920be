//! Bounded memoization with self-tuning capacity.
//!
//! The cache keeps entries in least-recently-used order. Every
//! `check_interval` lookups the hit ratio of the last window decides whether
//! the capacity grows (the working set does not fit) or shrinks (the cache is
//! mostly missing anyway). Full caches evict a batch of the oldest entries at
//! once rather than one per insert.

use std::hash::Hash;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use tracing::trace;

/// Tuning knobs for an [`AdaptiveCache`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheTuning {
    /// Capacity before any adjustment.
    pub initial_capacity: usize,
    /// Hard floor for the capacity.
    pub min_capacity: usize,
    /// Hard ceiling for the capacity.
    pub max_capacity: usize,
    /// Multiplier applied when growing.
    pub growth_factor: f64,
    /// Multiplier applied when shrinking.
    pub shrink_factor: f64,
    /// Hit ratio above which the cache grows; below half of it the cache shrinks.
    pub hit_ratio_threshold: f64,
    /// Lookups between two adjustments.
    pub check_interval: u64,
    /// Share of entries evicted when inserting into a full cache.
    pub eviction_fraction: f64,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            initial_capacity: 256,
            min_capacity: 64,
            max_capacity: 10_000,
            growth_factor: 1.2,
            shrink_factor: 0.8,
            hit_ratio_threshold: 0.7,
            check_interval: 100,
            eviction_fraction: 0.1,
        }
    }
}

impl CacheTuning {
    /// Default tuning with a different starting capacity.
    #[must_use]
    pub fn with_initial_capacity(initial_capacity: usize) -> Self {
        Self {
            initial_capacity,
            ..Self::default()
        }
    }
}

/// Point-in-time counters of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Entries currently stored.
    pub len: usize,
    /// Current capacity bound.
    pub capacity: usize,
    /// Hits in the current tuning window.
    pub hits: u64,
    /// Misses in the current tuning window.
    pub misses: u64,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: IndexMap<K, V, FxBuildHasher>,
    capacity: usize,
    hits: u64,
    misses: u64,
    accesses: u64,
}

/// Thread-safe LRU memoizer whose capacity follows its hit ratio.
#[derive(Debug)]
pub struct AdaptiveCache<K, V> {
    name: &'static str,
    tuning: CacheTuning,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> AdaptiveCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Empty cache starting at the tuned initial capacity, clamped to its bounds.
    #[must_use]
    pub fn new(name: &'static str, tuning: CacheTuning) -> Self {
        let capacity = tuning
            .initial_capacity
            .clamp(tuning.min_capacity, tuning.max_capacity.max(tuning.min_capacity));
        Self {
            name,
            tuning,
            state: Mutex::new(CacheState {
                entries: IndexMap::with_hasher(FxBuildHasher),
                capacity,
                hits: 0,
                misses: 0,
                accesses: 0,
            }),
        }
    }

    /// Name used in trace output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Tuning this cache was built with.
    #[must_use]
    pub fn tuning(&self) -> &CacheTuning {
        &self.tuning
    }

    /// Return the cached value for `key`, computing it with `compute` on a miss.
    ///
    /// `compute` runs without the cache lock held, so it may use other caches.
    pub fn get_or_insert_with(&self, key: K, compute: impl FnOnce() -> V) -> V {
        match self.try_get_or_insert_with(key, || Ok::<V, std::convert::Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`Self::get_or_insert_with`], but failed computations are not cached.
    pub fn try_get_or_insert_with<E>(
        &self,
        key: K,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        {
            let mut state = self.state.lock();
            self.record_access(&mut state);
            if let Some(idx) = state.entries.get_index_of(&key) {
                state.hits += 1;
                let last = state.entries.len() - 1;
                state.entries.move_index(idx, last);
                if let Some((_, value)) = state.entries.get_index(last) {
                    return Ok(value.clone());
                }
            }
            state.misses += 1;
        }

        let value = compute()?;

        let mut state = self.state.lock();
        if !state.entries.contains_key(&key) && state.entries.len() >= state.capacity {
            self.evict_batch(&mut state);
        }
        state.entries.insert(key, value.clone());
        Ok(value)
    }

    /// Drop every entry and reset all counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
        state.accesses = 0;
    }

    /// Entries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entry is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Counters for the current tuning window.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            len: state.entries.len(),
            capacity: state.capacity,
            hits: state.hits,
            misses: state.misses,
        }
    }

    fn record_access(&self, state: &mut CacheState<K, V>) {
        state.accesses += 1;
        if state.accesses >= self.tuning.check_interval {
            self.adjust_capacity(state);
            state.accesses = 0;
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn adjust_capacity(&self, state: &mut CacheState<K, V>) {
        let total = state.hits + state.misses;
        if total == 0 {
            return;
        }
        let ratio = state.hits as f64 / total as f64;
        let tuning = &self.tuning;
        let previous = state.capacity;
        if ratio > tuning.hit_ratio_threshold && state.capacity < tuning.max_capacity {
            let grown = (state.capacity as f64 * tuning.growth_factor) as usize;
            state.capacity = grown.max(state.capacity + 1).min(tuning.max_capacity);
        } else if ratio < tuning.hit_ratio_threshold * 0.5 && state.capacity > tuning.min_capacity
        {
            let shrunk = (state.capacity as f64 * tuning.shrink_factor) as usize;
            state.capacity = shrunk.min(state.capacity - 1).max(tuning.min_capacity);
            let excess = state.entries.len().saturating_sub(state.capacity);
            if excess > 0 {
                state.entries.drain(..excess);
            }
        }
        if previous != state.capacity {
            trace!(
                cache = self.name,
                ratio,
                from = previous,
                to = state.capacity,
                "cache capacity adjusted"
            );
        }
        state.hits = 0;
        state.misses = 0;
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn evict_batch(&self, state: &mut CacheState<K, V>) {
        let len = state.entries.len();
        if len == 0 {
            return;
        }
        let batch = ((len as f64 * self.tuning.eviction_fraction) as usize).clamp(1, len);
        state.entries.drain(..batch);
    }
}
