use std::sync::Arc;
use std::thread;

use tripwire_runtime::{AdaptiveCache, CacheTuning};

fn tuning() -> CacheTuning {
    CacheTuning {
        initial_capacity: 32,
        min_capacity: 8,
        max_capacity: 64,
        check_interval: 25,
        ..CacheTuning::default()
    }
}

/// Deterministic access stream mixing a hot set with cold keys.
struct Accesses {
    state: u64,
}

impl Iterator for Accesses {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let draw = self.state >> 33;
        Some(if draw % 4 == 0 { 1_000 + draw % 500 } else { draw % 12 })
    }
}

#[test]
fn capacity_stays_within_bounds_for_mixed_workload() {
    let cache = AdaptiveCache::new("mixed", tuning());
    let accesses = Accesses { state: 42 };
    for key in accesses.take(5_000) {
        let value = cache.get_or_insert_with(key, || key * 2);
        assert_eq!(value, key * 2);
        let stats = cache.stats();
        assert!((8..=64).contains(&stats.capacity), "capacity {}", stats.capacity);
        assert!(stats.len <= stats.capacity);
    }
}

#[test]
fn concurrent_readers_agree_on_values() {
    let cache = Arc::new(AdaptiveCache::new("shared", tuning()));
    let workers: Vec<_> = (0..4u64)
        .map(|seed| {
            let cache = cache.clone();
            thread::spawn(move || {
                let accesses = Accesses { state: seed + 1 };
                for key in accesses.take(2_000) {
                    assert_eq!(cache.get_or_insert_with(key, || key + 7), key + 7);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let stats = cache.stats();
    assert!(stats.len <= stats.capacity);
    assert!((8..=64).contains(&stats.capacity));
}

#[test]
fn clear_keeps_capacity_bounds() {
    let cache = AdaptiveCache::new("cleared", tuning());
    for key in 0..300u64 {
        cache.get_or_insert_with(key, || key);
    }
    cache.clear();
    assert!(cache.is_empty());
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (0, 0));
    assert!((8..=64).contains(&stats.capacity));
    assert_eq!(cache.get_or_insert_with(3, || 9), 9);
}
