//! Least outstanding work selection

use super::selection::{BalancerCore, Policy, TargetTable};
use super::{HealthCache, LoadBalancer, LoadBalancerConfig, Target, TargetList};
use std::cmp::Ordering;
use std::sync::Arc;

/// Load balancer choosing the target with the fewest outstanding allocations
///
/// Ties go to the heavier target, then to the earlier inserted one.
pub struct LeastWorkLoadBalancer {
    core: BalancerCore,
}

impl LeastWorkLoadBalancer {
    /// Create with default configuration
    pub fn new(targets: Vec<Target>) -> Self {
        Self::with_config(LoadBalancerConfig::default(), targets)
    }

    /// Create with custom configuration
    pub fn with_config(config: LoadBalancerConfig, targets: Vec<Target>) -> Self {
        let lb = Self {
            core: BalancerCore::new(&config, true),
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

impl Policy for LeastWorkLoadBalancer {
    fn core(&self) -> &BalancerCore {
        &self.core
    }

    fn pick(
        &self,
        table: &TargetTable,
        _key: Option<&str>,
        eligible: &dyn Fn(&str) -> bool,
    ) -> Option<String> {
        table
            .iter()
            .filter(|(id, slot)| slot.weight > 0 && eligible(*id))
            .min_by(|(_, a), (_, b)| match a.outstanding.cmp(&b.outstanding) {
                Ordering::Equal => b.weight.cmp(&a.weight),
                order => order,
            })
            .map(|(id, _)| id.to_string())
    }
}
