//! Latency and size statistics

pub mod percentile;

pub use percentile::Percentile;
