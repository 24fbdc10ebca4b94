//! Load balancing across weighted targets with shared health exclusion
//!
//! Three policies share one selection contract ([`LoadBalancer`]):
//!
//! - [`HashingLoadBalancer`]: consistent hashing on a ring of virtual points
//! - [`RoundRobinLoadBalancer`]: smooth weighted round-robin
//! - [`LeastWorkLoadBalancer`]: fewest outstanding allocations
//!
//! Each can be handed a shared [`HealthCache`] keyed by target id. A target
//! with a live entry in that cache is skipped until the entry expires or is
//! removed. A per-call [`Validator`] can exclude more targets on top of that.

mod hashing;
mod least_work;
mod round_robin;
mod selection;

use crate::pooling::cache::{Cache, CacheConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub use hashing::HashingLoadBalancer;
pub use least_work::LeastWorkLoadBalancer;
pub use round_robin::RoundRobinLoadBalancer;

use selection::{BorrowerMap, Policy, TargetTable};

/// Cache of unhealthy target ids, the value being the reason
pub type HealthCache = Cache<String, String>;

/// Call-time predicate on target ids; `false` excludes the target
pub type Validator<'a> = &'a dyn Fn(&str) -> bool;

/// Default ring points per unit of weight
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

/// Deterministic hash used for ring placement and key lookup
pub fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Selectable target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Target identifier (usually an address)
    pub id: String,
    /// Target weight, 0 takes it out of rotation
    pub weight: u32,
}

impl Target {
    /// Create a new target
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: 1,
        }
    }

    /// Create a target with weight
    pub fn with_weight(id: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            weight,
        }
    }
}

/// Target list as written in configuration: ids or an id → weight map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetList {
    /// Targets of weight 1
    Ids(Vec<String>),
    /// Targets with explicit weights
    Weighted(IndexMap<String, u32>),
}

impl Default for TargetList {
    fn default() -> Self {
        Self::Ids(Vec::new())
    }
}

impl TargetList {
    /// Expand into targets, preserving order
    pub fn to_targets(&self) -> Vec<Target> {
        match self {
            Self::Ids(ids) => ids.iter().map(Target::new).collect(),
            Self::Weighted(weights) => weights
                .iter()
                .map(|(id, weight)| Target::with_weight(id.clone(), *weight))
                .collect(),
        }
    }
}

/// Load balancer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Memory of tag → target used for sticky selection
    pub sticky: CacheConfig,
    /// Ring points per unit of weight (hashing only)
    pub virtual_nodes: usize,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            sticky: CacheConfig::default(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

impl LoadBalancerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sticky tag memory
    pub fn with_sticky(mut self, sticky: CacheConfig) -> Self {
        self.sticky = sticky;
        self
    }

    /// Set ring points per unit of weight
    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes.max(1);
        self
    }
}

/// Common selection contract
pub trait LoadBalancer: Send + Sync {
    /// Select a target, consulting a call-time health cache and validator
    ///
    /// A `borrower` that already holds a live allocation from this balancer
    /// gets that allocation back while its target stays eligible; otherwise
    /// the old allocation is released and a new target is chosen. A `tag`
    /// keeps returning the same target while it stays eligible.
    fn next_with(
        &self,
        borrower: Option<&str>,
        tag: Option<&str>,
        unhealthy: Option<&HealthCache>,
        validator: Option<Validator<'_>>,
    ) -> Option<Allocation>;

    /// Select a target using the balancer's own health cache
    fn next(&self, borrower: Option<&str>, tag: Option<&str>) -> Option<Allocation> {
        self.next_with(borrower, tag, None, None)
    }

    /// Make up to `count` untagged selections in a row
    ///
    /// Picks with no eligible target are skipped, so the result may be
    /// shorter than `count`. A hashing balancer has no key to spread on and
    /// answers every pick with the same target.
    fn schedule(&self, count: usize, validator: Option<Validator<'_>>) -> Vec<Allocation>;

    /// Select a target id; pair with [`deselect`](LoadBalancer::deselect)
    fn select(&self, tag: Option<&str>) -> Option<String>;

    /// Drop one unit of load from a target, never below zero
    fn deselect(&self, id: &str);

    /// Release the allocation held by a borrower
    fn release_borrower(&self, borrower: &str) -> bool;

    /// Add a target or change its weight
    fn set(&self, id: &str, weight: u32);

    /// Forget a target entirely
    fn remove(&self, id: &str) -> bool;

    /// Configured targets in insertion order
    fn targets(&self) -> Vec<Target>;

    /// Allocations currently held against a target
    fn outstanding(&self, id: &str) -> usize;
}

impl<P: Policy> LoadBalancer for P {
    fn next_with(
        &self,
        borrower: Option<&str>,
        tag: Option<&str>,
        unhealthy: Option<&HealthCache>,
        validator: Option<Validator<'_>>,
    ) -> Option<Allocation> {
        let core = self.core();
        let eligible = core.eligibility(unhealthy, validator);

        if let Some(existing) = borrower.and_then(|b| core.borrowed(b, &eligible)) {
            return Some(existing);
        }

        let key = tag.or(borrower);
        let id = core.choose(tag, &eligible, |table, eligible| {
            self.pick(table, key, eligible)
        })?;

        core.allocate(id, borrower)
    }

    fn schedule(&self, count: usize, validator: Option<Validator<'_>>) -> Vec<Allocation> {
        let core = self.core();
        let eligible = core.eligibility(None, validator);

        (0..count)
            .filter_map(|_| {
                let id = core.choose(None, &eligible, |table, eligible| {
                    self.pick(table, None, eligible)
                })?;
                core.allocate(id, None)
            })
            .collect()
    }

    fn select(&self, tag: Option<&str>) -> Option<String> {
        let core = self.core();
        let eligible = core.eligibility(None, None);
        let id = core.choose(tag, &eligible, |table, eligible| {
            self.pick(table, tag, eligible)
        })?;
        core.increase_load(&id);
        Some(id)
    }

    fn deselect(&self, id: &str) {
        self.core().decrease_load(id);
    }

    fn release_borrower(&self, borrower: &str) -> bool {
        self.core().release_borrower(borrower)
    }

    fn set(&self, id: &str, weight: u32) {
        self.core().set_weight(id, weight);
        self.on_set(id, weight);
    }

    fn remove(&self, id: &str) -> bool {
        let removed = self.core().remove(id);
        if removed {
            self.on_remove(id);
        }
        removed
    }

    fn targets(&self) -> Vec<Target> {
        self.core().targets()
    }

    fn outstanding(&self, id: &str) -> usize {
        self.core().outstanding(id)
    }
}

struct AllocationInner {
    id: String,
    generation: u64,
    borrower: Option<String>,
    released: AtomicBool,
    table: Weak<parking_lot::Mutex<TargetTable>>,
    borrowers: Weak<BorrowerMap>,
}

impl AllocationInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            table.lock().release(&self.id, self.generation);
        }

        // Forget the borrower entry if it still points at this allocation
        let Some(borrower) = &self.borrower else {
            return;
        };
        let Some(borrowers) = self.borrowers.upgrade() else {
            return;
        };
        let stale = {
            let mut map = borrowers.lock();
            let held = map
                .get(borrower)
                .is_some_and(|allocation| std::ptr::eq(Arc::as_ptr(&allocation.inner), self));
            if held {
                map.remove(borrower)
            } else {
                None
            }
        };
        drop(stale);
    }
}

impl Drop for AllocationInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle for one selection of a target
///
/// The load is released by [`release`](Allocation::release) or when the last
/// clone is dropped, whichever comes first; releasing twice is harmless.
/// A borrower's own entry counts as a clone until it is released.
#[derive(Clone)]
pub struct Allocation {
    inner: Arc<AllocationInner>,
}

impl Allocation {
    fn new(
        id: String,
        generation: u64,
        borrower: Option<String>,
        table: Weak<parking_lot::Mutex<TargetTable>>,
        borrowers: Weak<BorrowerMap>,
    ) -> Self {
        Self {
            inner: Arc::new(AllocationInner {
                id,
                generation,
                borrower,
                released: AtomicBool::new(false),
                table,
                borrowers,
            }),
        }
    }

    fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Selected target id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Give the load back to the balancer
    pub fn release(&self) {
        self.inner.release();
    }

    /// Whether the load has been given back
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::selection::Policy;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_target_creation() {
        let target = Target::new("localhost:8080");
        assert_eq!(target.id, "localhost:8080");
        assert_eq!(target.weight, 1);

        let weighted = Target::with_weight("localhost:8081", 5);
        assert_eq!(weighted.weight, 5);
    }

    #[test]
    fn test_target_list_forms() {
        let ids: TargetList = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(ids.to_targets(), vec![Target::new("a"), Target::new("b")]);

        let weighted: TargetList = serde_json::from_str(r#"{"a": 3, "b": 0}"#).unwrap();
        assert_eq!(
            weighted.to_targets(),
            vec![Target::with_weight("a", 3), Target::with_weight("b", 0)]
        );
    }

    #[test]
    fn test_hash_key_deterministic() {
        assert_eq!(hash_key("10.0.0.1:80"), hash_key("10.0.0.1:80"));
        assert_ne!(hash_key("10.0.0.1:80"), hash_key("10.0.0.2:80"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let lb = LeastWorkLoadBalancer::new(vec![Target::new("a")]);

        let first = lb.next(None, None).unwrap();
        let second = lb.next(None, None).unwrap();
        assert_eq!(lb.outstanding("a"), 2);

        first.release();
        first.release();
        first.release();
        assert_eq!(lb.outstanding("a"), 1);

        drop(first);
        assert_eq!(lb.outstanding("a"), 1);

        drop(second);
        assert_eq!(lb.outstanding("a"), 0);
    }

    #[test]
    fn test_deselect_never_underflows() {
        let lb = RoundRobinLoadBalancer::new(vec![Target::new("a")]);

        let id = lb.select(None).unwrap();
        lb.deselect(&id);
        lb.deselect(&id);
        lb.deselect("unknown");
        assert_eq!(lb.outstanding("a"), 0);
    }

    #[test]
    fn test_borrower_keeps_allocation() {
        let lb = RoundRobinLoadBalancer::new(vec![Target::new("a"), Target::new("b")]);

        let first = lb.next(Some("conn-1"), None).unwrap();
        let again = lb.next(Some("conn-1"), None).unwrap();
        assert_eq!(first.id(), again.id());
        assert_eq!(lb.outstanding(first.id()), 1);

        drop(first);
        drop(again);
        // The borrower still owns the allocation
        assert_eq!(lb.outstanding("a") + lb.outstanding("b"), 1);

        assert!(lb.release_borrower("conn-1"));
        assert!(!lb.release_borrower("conn-1"));
        assert_eq!(lb.outstanding("a") + lb.outstanding("b"), 0);
    }

    #[test]
    fn test_dyn_dispatch_and_health_exclusion() {
        let unhealthy = Arc::new(HealthCache::new(
            CacheConfig::new().with_ttl(Some(Duration::from_secs(30))),
        ));
        let targets = vec![Target::new("a"), Target::new("b")];

        let balancers: Vec<Box<dyn LoadBalancer>> = vec![
            Box::new(HashingLoadBalancer::new(targets.clone()).with_unhealthy(unhealthy.clone())),
            Box::new(RoundRobinLoadBalancer::new(targets.clone()).with_unhealthy(unhealthy.clone())),
            Box::new(LeastWorkLoadBalancer::new(targets).with_unhealthy(unhealthy.clone())),
        ];

        unhealthy.set("a".to_string(), "connect refused".to_string());

        for lb in &balancers {
            for i in 0..20 {
                let key = format!("key-{}", i);
                let allocation = lb.next(None, Some(key.as_str())).unwrap();
                assert_eq!(allocation.id(), "b");
            }
        }

        unhealthy.set("b".to_string(), "timeout".to_string());
        for lb in &balancers {
            assert!(lb.next(None, Some("key")).is_none());
        }

        unhealthy.remove(&"a".to_string());
        for lb in &balancers {
            assert_eq!(lb.next(None, Some("key")).unwrap().id(), "a");
        }
    }

    #[test]
    fn test_call_time_health_cache() {
        let lb = RoundRobinLoadBalancer::new(vec![Target::new("a"), Target::new("b")]);
        let unhealthy = HealthCache::with_default_config();
        unhealthy.set("b".to_string(), "draining".to_string());

        for _ in 0..5 {
            let allocation = lb.next_with(None, None, Some(&unhealthy), None).unwrap();
            assert_eq!(allocation.id(), "a");
        }
    }

    #[test]
    fn test_borrower_moves_off_ineligible_target() {
        let unhealthy = Arc::new(HealthCache::with_default_config());
        let lb = RoundRobinLoadBalancer::new(vec![Target::new("a"), Target::new("b")])
            .with_unhealthy(unhealthy.clone());

        assert_eq!(lb.next(Some("conn-1"), None).unwrap().id(), "a");

        unhealthy.set("a".to_string(), "connect refused".to_string());
        assert_eq!(lb.next(Some("conn-1"), None).unwrap().id(), "b");
        assert_eq!(lb.outstanding("a"), 0);
        assert_eq!(lb.outstanding("b"), 1);

        // Recovery of the old target does not move the borrower back
        unhealthy.clear();
        assert_eq!(lb.next(Some("conn-1"), None).unwrap().id(), "b");

        assert!(lb.remove("b"));
        assert_eq!(lb.next(Some("conn-1"), None).unwrap().id(), "a");
        assert_eq!(lb.outstanding("a"), 1);

        lb.set("a", 0);
        lb.set("b", 1);
        assert_eq!(lb.next(Some("conn-1"), None).unwrap().id(), "b");
        assert_eq!(lb.outstanding("a"), 0);
    }

    #[test]
    fn test_released_handle_forgets_borrower() {
        let lb = LeastWorkLoadBalancer::new(vec![Target::new("a"), Target::new("b")]);

        for i in 0..1000 {
            let borrower = format!("conn-{}", i);
            lb.next(Some(borrower.as_str()), None).unwrap().release();
        }

        assert_eq!(lb.core().borrower_count(), 0);
        assert!(!lb.release_borrower("conn-0"));

        // A released borrower gets a fresh allocation without double counting
        let first = lb.next(Some("conn-x"), None).unwrap();
        first.release();
        let second = lb.next(Some("conn-x"), None).unwrap();
        assert!(!second.is_released());
        assert_eq!(lb.outstanding("a") + lb.outstanding("b"), 1);
        assert_eq!(lb.core().borrower_count(), 1);
    }

    #[test]
    fn test_callbacks_may_reenter_balancer() {
        let lb = Arc::new(RoundRobinLoadBalancer::new(vec![
            Target::new("a"),
            Target::new("b"),
        ]));

        // Busy targets are reported unhealthy by asking the balancer itself
        let observer = lb.clone();
        let unhealthy: HealthCache =
            Cache::with_default_config().on_create(move |id: &String| {
                Ok((observer.outstanding(id) > 0).then(|| "busy".to_string()))
            });

        let first = lb.next_with(None, None, Some(&unhealthy), None).unwrap();
        let second = lb.next_with(None, None, Some(&unhealthy), None).unwrap();
        assert_eq!((first.id(), second.id()), ("a", "b"));
        assert!(lb.next_with(None, None, Some(&unhealthy), None).is_none());

        let heavy_only: Validator<'_> =
            &|id: &str| lb.targets().iter().any(|t| t.id == id && t.weight > 1);
        lb.set("b", 2);
        let allocations = lb.schedule(2, Some(heavy_only));
        assert!(allocations.iter().all(|allocation| allocation.id() == "b"));
        assert_eq!(allocations.len(), 2);
    }

    #[test]
    fn test_schedule_with_validator() {
        let lb = LeastWorkLoadBalancer::new(vec![
            Target::new("a"),
            Target::new("b"),
            Target::new("c"),
        ]);

        let spread = lb.schedule(6, None);
        assert_eq!(spread.len(), 6);
        for id in ["a", "b", "c"] {
            assert_eq!(lb.outstanding(id), 2);
        }
        drop(spread);

        let skip_b: Validator<'_> = &|id: &str| id != "b";
        let picked = lb.schedule(4, Some(skip_b));
        assert_eq!(picked.len(), 4);
        assert!(picked.iter().all(|allocation| allocation.id() != "b"));
        assert_eq!(lb.outstanding("b"), 0);

        let reject_all: Validator<'_> = &|_: &str| false;
        assert!(lb.schedule(3, Some(reject_all)).is_empty());
        assert!(lb.next_with(None, None, None, Some(reject_all)).is_none());
        assert_eq!(
            lb.next_with(None, None, None, Some(skip_b)).unwrap().id(),
            "a"
        );
    }

    #[test]
    fn test_readded_target_keeps_own_count() {
        let lb = LeastWorkLoadBalancer::new(vec![Target::new("a")]);

        let old = lb.next(None, None).unwrap();
        assert!(lb.remove("a"));
        lb.set("a", 1);
        assert_eq!(lb.outstanding("a"), 0);

        let new = lb.next(None, None).unwrap();
        assert_eq!(lb.outstanding("a"), 1);

        drop(old);
        assert_eq!(lb.outstanding("a"), 1);

        drop(new);
        assert_eq!(lb.outstanding("a"), 0);
    }
}
