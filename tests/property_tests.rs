//! Property-based tests for rust_routing_system using proptest

use parking_lot::Mutex;
use proptest::prelude::*;
use rust_routing_system::*;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Cache Capacity and Eviction Accounting
// ============================================================================

proptest! {
    /// Size never exceeds capacity and every displaced value is evicted once
    #[test]
    fn test_cache_bounded_and_accounted(
        capacity in 1usize..16,
        keys in prop::collection::vec(0u32..32, 0..200),
    ) {
        let evicted = Arc::new(Mutex::new(0usize));
        let counter = evicted.clone();
        let cache: Cache<u32, u32> = Cache::new(CacheConfig::new().with_capacity(capacity))
            .on_evict(move |_, _| *counter.lock() += 1);

        for (i, key) in keys.iter().enumerate() {
            cache.set(*key, i as u32);
            prop_assert!(cache.len() <= capacity);
        }

        // Every stored value is either still cached or was evicted
        prop_assert_eq!(cache.len() + *evicted.lock(), keys.len());

        cache.clear();
        prop_assert_eq!(*evicted.lock(), keys.len());
    }

    /// Inserting capacity + 1 distinct keys evicts exactly the first one
    #[test]
    fn test_cache_lru_evicts_oldest(capacity in 1usize..32) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        let cache: Cache<usize, String> = Cache::new(CacheConfig::new().with_capacity(capacity))
            .on_evict(move |key, value| log.lock().push((*key, value)));

        for key in 0..=capacity {
            cache.set(key, format!("value-{}", key));
        }

        prop_assert_eq!(evicted.lock().clone(), vec![(0, "value-0".to_string())]);
        prop_assert!(!cache.has(&0));
        prop_assert!(cache.has(&capacity));
    }
}

// ============================================================================
// Quota Conservation
// ============================================================================

#[derive(Debug, Clone)]
enum QuotaOp {
    Consume(u32),
    Produce(u32),
}

fn quota_op() -> impl Strategy<Value = QuotaOp> {
    prop_oneof![
        (0u32..60).prop_map(QuotaOp::Consume),
        (0u32..60).prop_map(QuotaOp::Produce),
    ]
}

proptest! {
    /// Without replenishment, current = initial + produced - consumed
    #[test]
    fn test_quota_conservation(
        initial in 0u32..200,
        ops in prop::collection::vec(quota_op(), 0..100),
    ) {
        let quota = Quota::new(f64::from(initial)).unwrap();
        let mut produced = 0.0;
        let mut consumed = 0.0;

        for op in ops {
            match op {
                QuotaOp::Consume(amount) => {
                    let taken = quota.consume(f64::from(amount)).unwrap();
                    prop_assert!(taken <= f64::from(amount));
                    consumed += taken;
                }
                QuotaOp::Produce(amount) => {
                    let before = quota.current();
                    quota.produce(f64::from(amount)).unwrap();
                    produced += quota.current() - before;
                }
            }

            let current = quota.current();
            prop_assert!((0.0..=f64::from(initial)).contains(&current));
            prop_assert_eq!(current, f64::from(initial) + produced - consumed);
        }
    }

    /// Negative amounts are rejected and leave the bucket untouched
    #[test]
    fn test_quota_rejects_negative(amount in 0.001f64..1000.0) {
        let quota = Quota::new(10.0).unwrap();

        prop_assert!(matches!(quota.consume(-amount), Err(ToolkitError::InvalidArgument(_))));
        prop_assert!(matches!(quota.produce(-amount), Err(ToolkitError::InvalidArgument(_))));
        prop_assert_eq!(quota.current(), 10.0);
    }
}

// ============================================================================
// Load Balancer Properties
// ============================================================================

fn assignments(lb: &HashingLoadBalancer, keys: &[String]) -> HashMap<String, String> {
    keys.iter()
        .map(|key| {
            let allocation = lb.next(None, Some(key.as_str())).unwrap();
            (key.clone(), allocation.id().to_string())
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Removing a target only moves the keys it owned
    #[test]
    fn test_hashing_minimal_disruption(
        target_count in 2usize..6,
        removed in 0usize..6,
    ) {
        let removed = removed % target_count;
        let targets: Vec<Target> = (0..target_count)
            .map(|i| Target::new(format!("10.0.0.{}:80", i)))
            .collect();
        let victim = targets[removed].id.clone();
        let lb = HashingLoadBalancer::new(targets);
        let keys: Vec<String> = (0..500).map(|i| format!("key-{}", i)).collect();

        let before = assignments(&lb, &keys);
        lb.remove(&victim);
        let after = assignments(&lb, &keys);

        for key in &keys {
            if before[key] != victim {
                prop_assert_eq!(&before[key], &after[key]);
            } else {
                prop_assert_ne!(&after[key], &victim);
            }
        }
    }

    /// Over whole cycles every target gets exactly its weight share
    #[test]
    fn test_round_robin_exact_share(
        weights in prop::collection::vec(1u32..6, 1..5),
        cycles in 1usize..4,
    ) {
        let targets: Vec<Target> = weights
            .iter()
            .enumerate()
            .map(|(i, weight)| Target::with_weight(format!("t{}", i), *weight))
            .collect();
        let lb = RoundRobinLoadBalancer::new(targets);
        let total: u32 = weights.iter().sum();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..total as usize * cycles {
            let allocation = lb.next(None, None).unwrap();
            *counts.entry(allocation.id().to_string()).or_default() += 1;
        }

        for (i, weight) in weights.iter().enumerate() {
            prop_assert_eq!(counts[&format!("t{}", i)], *weight as usize * cycles);
        }
    }

    /// Outstanding counts return to zero however allocations are released
    #[test]
    fn test_least_work_counts_balance(
        picks in 1usize..40,
        double_release in any::<bool>(),
    ) {
        let lb = LeastWorkLoadBalancer::new(vec![
            Target::new("a"),
            Target::new("b"),
            Target::new("c"),
        ]);

        let held: Vec<Allocation> = (0..picks).map(|_| lb.next(None, None).unwrap()).collect();
        let max = ["a", "b", "c"].iter().map(|id| lb.outstanding(id)).max().unwrap();
        let min = ["a", "b", "c"].iter().map(|id| lb.outstanding(id)).min().unwrap();
        prop_assert!(max - min <= 1);

        for allocation in &held {
            allocation.release();
            if double_release {
                allocation.release();
                lb.deselect(allocation.id());
            }
        }
        drop(held);

        for id in ["a", "b", "c"] {
            prop_assert_eq!(lb.outstanding(id), 0);
        }
    }
}

// ============================================================================
// Router Precedence
// ============================================================================

proptest! {
    /// A literal route always beats a trailing wildcard over the same prefix
    #[test]
    fn test_router_exact_beats_wildcard(
        segments in prop::collection::vec("[a-z]{1,8}", 1..6),
    ) {
        let path = format!("/{}", segments.join("/"));
        let prefix = format!("/{}/*", segments[0]);

        let rules = [(prefix.as_str(), "wild"), (path.as_str(), "exact")];
        let router = UrlRouter::from_rules(rules).unwrap();
        prop_assert_eq!(router.find(None, &path), Some(&"exact"));

        let longer = format!("{}/extra", path);
        prop_assert_eq!(router.find(None, &longer), Some(&"wild"));
    }
}

// ============================================================================
// Resource Pool Recycling
// ============================================================================

#[derive(Debug, Clone)]
enum PoolOp {
    Allocate(u8, u8),
    Free(u8),
    FreePair(u8, u8),
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        (0u8..5, 0u8..8).prop_map(|(tenant, borrower)| PoolOp::Allocate(tenant, borrower)),
        (0u8..8).prop_map(PoolOp::Free),
        (0u8..5, 0u8..8).prop_map(|(tenant, borrower)| PoolOp::FreePair(tenant, borrower)),
    ]
}

proptest! {
    /// Every created id is either held by exactly one tenant or free
    #[test]
    fn test_pool_ids_held_or_free(ops in prop::collection::vec(pool_op(), 0..100)) {
        let pool: ResourcePool<u8, u64> = ResourcePool::with_counter();

        for op in ops {
            match op {
                PoolOp::Allocate(tenant, borrower) => {
                    let id = pool.allocate(&tenant, &borrower.to_string());
                    prop_assert_eq!(pool.id_of(&tenant), Some(id));
                }
                PoolOp::Free(borrower) => {
                    pool.free(&borrower.to_string());
                }
                PoolOp::FreePair(tenant, borrower) => {
                    pool.free_pair(&tenant, &borrower.to_string());
                }
            }

            let stats = pool.stats();
            prop_assert_eq!(stats.tenants + stats.free, stats.created);
            prop_assert!(stats.created <= 5);
        }
    }
}
