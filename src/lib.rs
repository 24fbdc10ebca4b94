//! Rust Routing System
//!
//! Building blocks for proxies and gateways that pick where a request goes
//! and keep track of what it holds while it is there.
//!
//! ## Features
//!
//! - TTL and LRU bounded cache with create and evict callbacks
//! - Token bucket quotas, plain or keyed
//! - Consistent hashing, smooth weighted round-robin and least-work balancers
//! - Shared health exclusion through an "unhealthy" cache
//! - Host and path router with exact-over-wildcard precedence
//! - Tenant-scoped id pool with borrower and scope release
//! - JSON configuration of all of the above
//!
//! ## Example
//!
//! ```
//! use rust_routing_system::{
//!     HealthCache, LoadBalancer, ResourcePool, RoundRobinLoadBalancer, Target, UrlRouter,
//! };
//! use std::sync::Arc;
//!
//! let router = UrlRouter::from_rules([("api.example.com/*", "api")]).unwrap();
//! let unhealthy = Arc::new(HealthCache::with_default_config());
//! let balancer = RoundRobinLoadBalancer::new(vec![
//!     Target::new("10.0.0.1:80"),
//!     Target::new("10.0.0.2:80"),
//! ])
//! .with_unhealthy(unhealthy.clone());
//! let pool = ResourcePool::<String, u64>::with_counter();
//!
//! assert_eq!(router.find_url("api.example.com/users"), Some(&"api"));
//!
//! unhealthy.set("10.0.0.1:80".to_string(), "refused".to_string());
//! let target = balancer.next(Some("conn-1"), None).unwrap();
//! assert_eq!(target.id(), "10.0.0.2:80");
//!
//! let id = pool.allocate(&target.id().to_string(), "conn-1");
//! assert_eq!(id, 1);
//!
//! pool.free("conn-1");
//! balancer.release_borrower("conn-1");
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod pooling;
pub mod routing;
pub mod stability;
pub mod stats;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BalancerSpec, PolicyKind, ToolkitConfig};
pub use error::{Result, ToolkitError};
pub use pooling::{
    Allocation, Cache, CacheConfig, CacheStats, HashingLoadBalancer, HealthCache,
    LeastWorkLoadBalancer, LoadBalancer, LoadBalancerConfig, PoolStats, ResourcePool,
    RoundRobinLoadBalancer, Target, TargetList, Validator,
};
pub use routing::UrlRouter;
pub use stability::{KeyedQuota, Quota, QuotaConfig};
pub use stats::Percentile;
