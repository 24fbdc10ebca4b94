//! Consistent hashing ring
//!
//! Each target owns `weight * virtual_nodes` points on a 64-bit ring. A key
//! maps to the first point clockwise from its hash whose target is eligible,
//! so adding or removing a target only moves the keys on the arcs it owns.

use super::selection::{BalancerCore, Policy, TargetTable};
use super::{hash_key, HealthCache, LoadBalancer, LoadBalancerConfig, Target, TargetList};
use std::sync::Arc;

/// Load balancer mapping keys to targets by consistent hashing
pub struct HashingLoadBalancer {
    core: BalancerCore,
    virtual_nodes: usize,
    ring: parking_lot::RwLock<Vec<(u64, String)>>,
}

impl HashingLoadBalancer {
    /// Create with default configuration
    pub fn new(targets: Vec<Target>) -> Self {
        Self::with_config(LoadBalancerConfig::default(), targets)
    }

    /// Create with custom configuration
    pub fn with_config(config: LoadBalancerConfig, targets: Vec<Target>) -> Self {
        let lb = Self {
            core: BalancerCore::new(&config, false),
            virtual_nodes: config.virtual_nodes.max(1),
            ring: parking_lot::RwLock::new(Vec::new()),
        };
        for target in targets {
            lb.set(&target.id, target.weight);
        }
        lb
    }

    /// Create from a configured target list
    pub fn from_list(config: LoadBalancerConfig, targets: &TargetList) -> Self {
        Self::with_config(config, targets.to_targets())
    }

    /// Exclude targets marked in a shared health cache
    pub fn with_unhealthy(mut self, unhealthy: Arc<HealthCache>) -> Self {
        self.core.set_unhealthy(unhealthy);
        self
    }

    /// Add a target with the given weight
    pub fn add(&self, id: &str, weight: u32) {
        self.set(id, weight);
    }

    /// Number of points currently on the ring
    pub fn ring_size(&self) -> usize {
        self.ring.read().len()
    }
}

impl Policy for HashingLoadBalancer {
    fn core(&self) -> &BalancerCore {
        &self.core
    }

    fn pick(
        &self,
        table: &TargetTable,
        key: Option<&str>,
        eligible: &dyn Fn(&str) -> bool,
    ) -> Option<String> {
        let ring = self.ring.read();
        if ring.is_empty() {
            return None;
        }

        let hash = hash_key(key.unwrap_or_default());
        let start = ring.partition_point(|(point, _)| *point < hash);
        let mut rejected: Vec<&str> = Vec::new();

        for offset in 0..ring.len() {
            let (_, id) = &ring[(start + offset) % ring.len()];
            if rejected.contains(&id.as_str()) {
                continue;
            }
            if table.is_active(id) && eligible(id.as_str()) {
                return Some(id.clone());
            }
            rejected.push(id);
        }

        None
    }

    fn on_set(&self, id: &str, weight: u32) {
        let points = weight as usize * self.virtual_nodes;
        let mut ring = self.ring.write();

        ring.retain(|(_, owner)| owner != id);
        ring.extend((0..points).map(|replica| {
            let point = hash_key(&format!("{}#{}", id, replica));
            (point, id.to_string())
        }));
        ring.sort_unstable();
    }

    fn on_remove(&self, id: &str) {
        self.ring.write().retain(|(_, owner)| owner != id);
    }
}
