//! Configuration documents
//!
//! Every component config is serde-loadable on its own. [`ToolkitConfig`]
//! groups named caches, quotas, balancers and routes into one JSON document:
//!
//! ```json
//! {
//!   "caches": { "unhealthy": { "capacity": 1000, "ttl": "10s" } },
//!   "quotas": { "bandwidth": { "initial": 1000, "produce": 100, "per": "1s" } },
//!   "balancers": {
//!     "backend": { "policy": "round_robin", "targets": { "10.0.0.1:80": 3, "10.0.0.2:80": 1 } }
//!   },
//!   "routes": { "api.example.com/*": "backend", "/health": "local" }
//! }
//! ```
//!
//! Durations are a number of seconds or a string with an `ms`, `s`, `m`,
//! `h` or `d` suffix.

use crate::error::{Result, ToolkitError};
use crate::pooling::cache::{Cache, CacheConfig};
use crate::pooling::load_balancer::{
    HashingLoadBalancer, HealthCache, LeastWorkLoadBalancer, LoadBalancer, LoadBalancerConfig,
    RoundRobinLoadBalancer, TargetList,
};
use crate::routing::UrlRouter;
use crate::stability::quota::{Quota, QuotaConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Parse a duration such as `250ms`, `1.5s`, `10m`, `2h`, `1d` or `30`
/// (seconds)
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ToolkitError::config(format!("invalid duration: {:?}", text)))?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        other => {
            return Err(ToolkitError::config(format!(
                "invalid duration unit {:?} in {:?}",
                other, text
            )))
        }
    };

    Duration::try_from_secs_f64(seconds)
        .map_err(|e| ToolkitError::config(format!("invalid duration {:?}: {}", text, e)))
}

/// Serde adapter for optional durations
///
/// Serializes as seconds; deserializes seconds or a suffixed string.
pub mod duration_opt {
    use super::parse_duration;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_f64(duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<Raw> = Option::deserialize(deserializer)?;
        raw.map(|raw| match raw {
            Raw::Seconds(seconds) => Duration::try_from_secs_f64(seconds).map_err(D::Error::custom),
            Raw::Text(text) => parse_duration(&text).map_err(D::Error::custom),
        })
        .transpose()
    }
}

/// Selection algorithm of a configured balancer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Consistent hashing on the request key
    Hashing,
    /// Smooth weighted round-robin
    #[default]
    RoundRobin,
    /// Fewest outstanding allocations
    LeastWork,
}

/// A configured load balancer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSpec {
    /// Selection algorithm
    pub policy: PolicyKind,
    /// Targets as a list of ids or an id → weight map
    pub targets: TargetList,
    /// Sticky memory and ring settings
    #[serde(flatten)]
    pub options: LoadBalancerConfig,
}

impl BalancerSpec {
    /// Instantiate the balancer, optionally sharing a health cache
    pub fn build(&self, unhealthy: Option<Arc<HealthCache>>) -> Box<dyn LoadBalancer> {
        let config = self.options.clone();
        match (self.policy, unhealthy) {
            (PolicyKind::Hashing, None) => {
                Box::new(HashingLoadBalancer::from_list(config, &self.targets))
            }
            (PolicyKind::Hashing, Some(health)) => Box::new(
                HashingLoadBalancer::from_list(config, &self.targets).with_unhealthy(health),
            ),
            (PolicyKind::RoundRobin, None) => {
                Box::new(RoundRobinLoadBalancer::from_list(config, &self.targets))
            }
            (PolicyKind::RoundRobin, Some(health)) => Box::new(
                RoundRobinLoadBalancer::from_list(config, &self.targets).with_unhealthy(health),
            ),
            (PolicyKind::LeastWork, None) => {
                Box::new(LeastWorkLoadBalancer::from_list(config, &self.targets))
            }
            (PolicyKind::LeastWork, Some(health)) => Box::new(
                LeastWorkLoadBalancer::from_list(config, &self.targets).with_unhealthy(health),
            ),
        }
    }
}

/// Named components loaded from one document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub caches: IndexMap<String, CacheConfig>,
    pub quotas: IndexMap<String, QuotaConfig>,
    pub balancers: IndexMap<String, BalancerSpec>,
    /// Router rules, pattern → arbitrary value
    pub routes: IndexMap<String, serde_json::Value>,
}

impl ToolkitConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check quota values and route patterns
    pub fn validate(&self) -> Result<()> {
        for (name, quota) in &self.quotas {
            Quota::with_config(quota.clone())
                .map_err(|e| ToolkitError::config(format!("quota {}: {}", name, e)))?;
        }
        self.router()?;
        Ok(())
    }

    /// Create the named cache
    pub fn cache<K, V>(&self, name: &str) -> Option<Cache<K, V>>
    where
        K: Hash + Eq + Clone,
        V: Clone,
    {
        self.caches.get(name).map(|config| Cache::new(config.clone()))
    }

    /// Create the named quota
    pub fn quota(&self, name: &str) -> Result<Option<Quota>> {
        self.quotas
            .get(name)
            .map(|config| Quota::with_config(config.clone()))
            .transpose()
    }

    /// Create the named balancer
    pub fn balancer(
        &self,
        name: &str,
        unhealthy: Option<Arc<HealthCache>>,
    ) -> Option<Box<dyn LoadBalancer>> {
        self.balancers.get(name).map(|spec| spec.build(unhealthy))
    }

    /// Build a router over the configured rules
    pub fn router(&self) -> Result<UrlRouter<serde_json::Value>> {
        UrlRouter::from_rules(
            self.routes
                .iter()
                .map(|(pattern, value)| (pattern.as_str(), value.clone())),
        )
    }
}
