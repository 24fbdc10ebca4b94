//! Admission control

pub mod quota;

pub use quota::{KeyedQuota, Quota, QuotaConfig};
