//! Resource selection and lifecycle caching

pub mod cache;
pub mod load_balancer;
pub mod resource_pool;

pub use cache::{Cache, CacheConfig, CacheStats};
pub use load_balancer::{
    Allocation, HashingLoadBalancer, HealthCache, LeastWorkLoadBalancer, LoadBalancer,
    LoadBalancerConfig, RoundRobinLoadBalancer, Target, TargetList, Validator,
};
pub use resource_pool::{PoolStats, ResourcePool};
