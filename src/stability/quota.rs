//! Quota counters with token bucket replenishment

use crate::clock::{system_clock, Clock};
use crate::config::duration_opt;
use crate::error::{Result, ToolkitError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default wait between attempts when no replenishment period is configured
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Quota configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Bucket capacity and starting amount
    pub initial: f64,
    /// Units added back per elapsed period
    pub produce: f64,
    /// Replenishment period, `None` disables automatic replenishment
    #[serde(with = "duration_opt")]
    pub per: Option<Duration>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            initial: 100.0,
            produce: 0.0,
            per: None,
        }
    }
}

impl QuotaConfig {
    /// Create a new quota configuration
    pub fn new(initial: f64) -> Self {
        Self {
            initial,
            ..Self::default()
        }
    }

    /// Set bucket capacity
    pub fn with_initial(mut self, initial: f64) -> Self {
        self.initial = initial;
        self
    }

    /// Replenish `amount` units every `per`
    pub fn with_produce(mut self, amount: f64, per: Duration) -> Self {
        self.produce = amount;
        self.per = Some(per);
        self
    }

    /// Create configuration for N units per second
    pub fn per_second(rate: f64) -> Self {
        Self::new(rate).with_produce(rate, Duration::from_secs(1))
    }

    /// Create configuration for N units per minute
    pub fn per_minute(rate: f64) -> Self {
        Self::new(rate).with_produce(rate, Duration::from_secs(60))
    }

    fn replenishment(&self) -> Option<(f64, Duration)> {
        match self.per {
            Some(per) if !per.is_zero() && self.produce > 0.0 => Some((self.produce, per)),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.initial.is_finite() || self.initial < 0.0 {
            return Err(ToolkitError::invalid_argument(format!(
                "quota initial value must be a finite non-negative number, got {}",
                self.initial
            )));
        }
        if self.produce.is_nan() || self.produce < 0.0 {
            return Err(ToolkitError::invalid_argument(format!(
                "quota produce rate must not be negative, got {}",
                self.produce
            )));
        }
        Ok(())
    }
}

/// Token bucket state
struct Bucket {
    current: f64,
    last_refill: Instant,
}

/// Quota counter
///
/// `current` always stays within `[0, initial]`.
pub struct Quota {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    bucket: parking_lot::Mutex<Bucket>,
}

impl Quota {
    /// Create a quota without automatic replenishment
    pub fn new(initial: f64) -> Result<Self> {
        Self::with_config(QuotaConfig::new(initial))
    }

    /// Create a quota with custom configuration
    pub fn with_config(config: QuotaConfig) -> Result<Self> {
        config.validate()?;
        let clock = system_clock();

        Ok(Self {
            bucket: parking_lot::Mutex::new(Bucket {
                current: config.initial,
                last_refill: clock.now(),
            }),
            config,
            clock,
        })
    }

    /// Create a quota refilling N units per second
    pub fn per_second(rate: f64) -> Result<Self> {
        Self::with_config(QuotaConfig::per_second(rate))
    }

    /// Use a different time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.bucket.get_mut().last_refill = clock.now();
        self.clock = clock;
        self
    }

    /// Bucket capacity
    pub fn initial(&self) -> f64 {
        self.config.initial
    }

    /// Currently available units, after replenishment
    pub fn current(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.replenish(&mut bucket);
        bucket.current
    }

    /// Refill to the initial value
    pub fn reset(&self) {
        let mut bucket = self.bucket.lock();
        bucket.current = self.config.initial;
        bucket.last_refill = self.clock.now();
    }

    /// Add units, capped at the initial value
    pub fn produce(&self, amount: f64) -> Result<()> {
        check_amount(amount)?;

        let mut bucket = self.bucket.lock();
        bucket.current = (bucket.current + amount).min(self.config.initial);
        Ok(())
    }

    /// Deduct up to `amount` units, returning how many were deducted
    pub fn consume(&self, amount: f64) -> Result<f64> {
        check_amount(amount)?;

        let mut bucket = self.bucket.lock();
        self.replenish(&mut bucket);

        let taken = amount.min(bucket.current);
        bucket.current -= taken;
        Ok(taken)
    }

    /// Deduct exactly `amount` units if available, otherwise nothing
    pub fn try_consume(&self, amount: f64) -> Result<bool> {
        check_amount(amount)?;

        let mut bucket = self.bucket.lock();
        self.replenish(&mut bucket);

        if bucket.current >= amount {
            bucket.current -= amount;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Wait until `amount` units can be deducted in full (async) with timeout
    pub async fn acquire(&self, amount: f64, timeout: Duration) -> Result<()> {
        if amount > self.config.initial {
            return Err(ToolkitError::invalid_argument(format!(
                "requested {} exceeds quota capacity {}",
                amount, self.config.initial
            )));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let wait_time = match self.config.replenishment() {
            Some((rate, per)) => per.mul_f64((1.0 / rate).min(1.0)),
            None => IDLE_POLL_INTERVAL,
        };

        loop {
            if self.try_consume(amount)? {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ToolkitError::timeout(format!(
                    "waiting for {} quota units",
                    amount
                )));
            }

            let sleep_duration = wait_time.min(deadline.saturating_duration_since(now));
            if !sleep_duration.is_zero() {
                tokio::time::sleep(sleep_duration).await;
            }
        }
    }

    /// Apply whole elapsed periods of replenishment
    fn replenish(&self, bucket: &mut Bucket) {
        let Some((rate, per)) = self.config.replenishment() else {
            return;
        };

        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let periods = elapsed.as_nanos() / per.as_nanos();
        if periods == 0 {
            return;
        }

        bucket.current = (bucket.current + periods as f64 * rate).min(self.config.initial);
        bucket.last_refill = u32::try_from(periods)
            .ok()
            .and_then(|n| per.checked_mul(n))
            .map_or(now, |advance| bucket.last_refill + advance);
    }
}

impl std::fmt::Debug for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quota")
            .field("config", &self.config)
            .field("current", &self.bucket.lock().current)
            .finish()
    }
}

fn check_amount(amount: f64) -> Result<()> {
    if amount >= 0.0 {
        Ok(())
    } else {
        Err(ToolkitError::invalid_argument(format!(
            "quota amount must not be negative, got {}",
            amount
        )))
    }
}

/// Per-key quotas for per-client limiting
///
/// Quotas are created on first use from a shared configuration and handed out
/// as shared handles, so several workers can draw from the same key.
pub struct KeyedQuota<K: Hash + Eq> {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    quotas: Arc<parking_lot::RwLock<HashMap<K, Arc<Quota>>>>,
}

impl<K: Hash + Eq + Clone> KeyedQuota<K> {
    /// Create a new keyed quota
    pub fn new(config: QuotaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock: system_clock(),
            quotas: Arc::new(parking_lot::RwLock::new(HashMap::new())),
        })
    }

    /// Use a different time source for quotas created from now on
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Quota for a key, created on first use
    pub fn quota(&self, key: &K) -> Arc<Quota> {
        if let Some(quota) = self.quotas.read().get(key) {
            return Arc::clone(quota);
        }

        let mut quotas = self.quotas.write();
        let quota = quotas.entry(key.clone()).or_insert_with(|| {
            let bucket = Bucket {
                current: self.config.initial,
                last_refill: self.clock.now(),
            };
            Arc::new(Quota {
                config: self.config.clone(),
                clock: Arc::clone(&self.clock),
                bucket: parking_lot::Mutex::new(bucket),
            })
        });
        Arc::clone(quota)
    }

    /// Deduct up to `amount` units from a key's quota
    pub fn consume(&self, key: &K, amount: f64) -> Result<f64> {
        self.quota(key).consume(amount)
    }

    /// Add units to a key's quota
    pub fn produce(&self, key: &K, amount: f64) -> Result<()> {
        self.quota(key).produce(amount)
    }

    /// Get number of tracked keys
    pub fn key_count(&self) -> usize {
        self.quotas.read().len()
    }

    /// Remove a key from tracking
    pub fn remove_key(&self, key: &K) {
        self.quotas.write().remove(key);
    }

    /// Clear all keys
    pub fn clear(&self) {
        self.quotas.write().clear();
    }
}

impl<K: Hash + Eq> Clone for KeyedQuota<K> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            quotas: Arc::clone(&self.quotas),
        }
    }
}
