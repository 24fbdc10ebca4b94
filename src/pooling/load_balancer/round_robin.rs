//! Smooth weighted round-robin
//!
//! Every pick adds each eligible target's weight to its running counter,
//! chooses the largest counter and subtracts the eligible weight total from
//! the winner. Heavy targets get their share without long bursts.

use super::selection::{BalancerCore, Policy, TargetTable};
use super::{HealthCache, LoadBalancer, LoadBalancerConfig, Target, TargetList};
use std::collections::HashMap;
use std::sync::Arc;

/// Load balancer rotating targets in proportion to their weights
pub struct RoundRobinLoadBalancer {
    core: BalancerCore,
    counters: parking_lot::Mutex<HashMap<String, i64>>,
}

impl RoundRobinLoadBalancer {
    /// Create with default configuration
    pub fn new(targets: Vec<Target>) -> Self {
        Self::with_config(LoadBalancerConfig::default(), targets)
    }

    /// Create with custom configuration
    pub fn with_config(config: LoadBalancerConfig, targets: Vec<Target>) -> Self {
        let lb = Self {
            core: BalancerCore::new(&config, true),
            counters: parking_lot::Mutex::new(HashMap::new()),
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
}

impl Policy for RoundRobinLoadBalancer {
    fn core(&self) -> &BalancerCore {
        &self.core
    }

    fn pick(
        &self,
        table: &TargetTable,
        _key: Option<&str>,
        eligible: &dyn Fn(&str) -> bool,
    ) -> Option<String> {
        let mut counters = self.counters.lock();
        let mut total = 0i64;
        let mut best: Option<(&str, i64)> = None;

        for (id, slot) in table.iter() {
            if slot.weight == 0 || !eligible(id) {
                continue;
            }

            let weight = i64::from(slot.weight);
            let counter = counters.entry(id.to_string()).or_insert(0);
            *counter += weight;
            total += weight;

            if best.map_or(true, |(_, value)| *counter > value) {
                best = Some((id, *counter));
            }
        }

        let (id, _) = best?;
        if let Some(counter) = counters.get_mut(id) {
            *counter -= total;
        }
        Some(id.to_string())
    }

    fn on_set(&self, _id: &str, _weight: u32) {
        // Weights changed: restart the interleaving from scratch
        self.counters.lock().clear();
    }

    fn on_remove(&self, id: &str) {
        self.counters.lock().remove(id);
    }
}
