//! Bucketed percentile estimation
//!
//! Samples are counted into buckets with ascending upper limits. A percentile
//! is located by walking the cumulative counts and interpolating linearly
//! inside the bucket where it falls.

/// Histogram over fixed bucket limits
#[derive(Debug, Clone)]
pub struct Percentile {
    limits: Vec<f64>,
    counts: Vec<u64>,
    /// Samples above the last limit
    overflow: u64,
    samples: u64,
}

impl Percentile {
    /// Create a histogram with the given bucket upper limits
    ///
    /// Limits are expected in ascending order; anything else is logged and
    /// kept as given.
    pub fn new(limits: Vec<f64>) -> Self {
        for (i, pair) in limits.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                tracing::warn!(
                    "Percentile buckets are not in ascending order: {} then {} at #{}",
                    pair[0],
                    pair[1],
                    i + 1
                );
            }
        }

        Self {
            counts: vec![0; limits.len()],
            limits,
            overflow: 0,
            samples: 0,
        }
    }

    /// Bucket upper limits
    pub fn limits(&self) -> &[f64] {
        &self.limits
    }

    /// Total number of samples observed
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Samples that fell above the last bucket
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// Count a sample into the first bucket whose limit covers it
    pub fn observe(&mut self, sample: f64) {
        self.samples += 1;
        match self.limits.iter().position(|limit| sample <= *limit) {
            Some(bucket) => self.counts[bucket] += 1,
            None => self.overflow += 1,
        }
    }

    /// Count in one bucket, 0 when out of range
    pub fn get(&self, bucket: usize) -> u64 {
        self.counts.get(bucket).copied().unwrap_or(0)
    }

    /// Overwrite the count of one bucket, ignoring out of range buckets
    pub fn set(&mut self, bucket: usize, count: u64) {
        if let Some(slot) = self.counts.get_mut(bucket) {
            self.samples = self.samples - *slot + count;
            *slot = count;
        }
    }

    /// Clear all counts
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|count| *count = 0);
        self.overflow = 0;
        self.samples = 0;
    }

    /// Estimate the value below which `percentage` percent of samples fall
    ///
    /// Returns 0 for a non-positive percentage or an empty histogram and
    /// `f64::INFINITY` when the rank lands among overflowed samples.
    pub fn calculate(&self, percentage: u32) -> f64 {
        if percentage == 0 || self.samples == 0 {
            return 0.0;
        }

        let rank = self.samples * u64::from(percentage) / 100;
        let mut count = 0u64;

        for (i, (&limit, &bucket)) in self.limits.iter().zip(&self.counts).enumerate() {
            count += bucket;
            if bucket > 0 && count >= rank {
                let lower = if i > 0 { self.limits[i - 1] } else { 0.0 };
                let beyond = (count - rank) as f64;
                return limit - (limit - lower) * beyond / bucket as f64;
            }
        }

        f64::INFINITY
    }

    /// Pairs of (bucket limit, samples at or below it)
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        self.limits
            .iter()
            .zip(&self.counts)
            .scan(0u64, |sum, (&limit, &count)| {
                *sum += count;
                Some((limit, *sum))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency() -> Percentile {
        Percentile::new(vec![10.0, 20.0, 50.0, 100.0])
    }

    #[test]
    fn test_observe_buckets() {
        let mut p = latency();
        for sample in [1.0, 10.0, 15.0, 45.0, 99.0, 500.0] {
            p.observe(sample);
        }

        assert_eq!(p.get(0), 2);
        assert_eq!(p.get(1), 1);
        assert_eq!(p.get(2), 1);
        assert_eq!(p.get(3), 1);
        assert_eq!(p.get(4), 0);
        assert_eq!(p.overflow(), 1);
        assert_eq!(p.samples(), 6);
    }

    #[test]
    fn test_calculate_interpolates() {
        let mut p = latency();
        for _ in 0..50 {
            p.observe(5.0);
        }
        for _ in 0..50 {
            p.observe(15.0);
        }

        assert_eq!(p.calculate(50), 10.0);
        assert_eq!(p.calculate(100), 20.0);
        // 75th sample sits halfway through the 10..20 bucket
        assert_eq!(p.calculate(75), 15.0);
        assert_eq!(p.calculate(0), 0.0);
    }

    #[test]
    fn test_calculate_overflow() {
        let mut p = Percentile::new(vec![1.0]);
        p.observe(0.5);
        p.observe(2.0);

        assert_eq!(p.calculate(50), 1.0);
        assert_eq!(p.calculate(100), f64::INFINITY);
    }

    #[test]
    fn test_empty() {
        let p = latency();
        assert_eq!(p.calculate(99), 0.0);
        assert_eq!(p.cumulative(), vec![(10.0, 0), (20.0, 0), (50.0, 0), (100.0, 0)]);
    }

    #[test]
    fn test_set_and_reset() {
        let mut p = latency();
        p.set(1, 4);
        p.set(3, 6);
        p.set(9, 100);
        assert_eq!(p.samples(), 10);

        p.set(3, 1);
        assert_eq!(p.samples(), 5);
        assert_eq!(p.cumulative(), vec![(10.0, 0), (20.0, 4), (50.0, 4), (100.0, 5)]);

        p.reset();
        assert_eq!(p.samples(), 0);
        assert_eq!(p.get(1), 0);
    }

    #[test]
    fn test_unordered_limits_still_usable() {
        let mut p = Percentile::new(vec![50.0, 10.0]);
        p.observe(5.0);
        assert_eq!(p.get(0), 1);
    }
}
