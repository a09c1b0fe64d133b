//! Bounded price history window
//!
//! Append-only, time-ordered retention of recent samples. The estimators
//! read a contiguous snapshot; nothing here mutates a recorded sample.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::config::PairConfig;
use crate::types::PriceSample;

/// Trailing window of market samples for one pair.
///
/// Out-of-order samples (timestamp earlier than the newest recorded one)
/// are dropped rather than inserted: recorded history is immutable.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    samples: VecDeque<PriceSample>,
    max_samples: usize,
    max_age: Duration,
}

impl PriceHistory {
    pub fn new(config: &PairConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.max_samples.min(4096)),
            max_samples: config.max_samples,
            max_age: Duration::seconds(config.max_age_secs),
        }
    }

    /// Append a sample, evicting anything past the retention bounds.
    /// Returns false if the sample was rejected as out of order.
    pub fn push(&mut self, sample: PriceSample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.timestamp < last.timestamp {
                trace!(
                    "dropping out-of-order sample at {} (newest is {})",
                    sample.timestamp,
                    last.timestamp
                );
                return false;
            }
        }
        self.samples.push_back(sample);
        self.evict(sample.timestamp);
        true
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        let cutoff = now - self.max_age;
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&PriceSample> {
        self.samples.back()
    }

    /// Contiguous copy of the full window, oldest first
    pub fn snapshot(&self) -> Vec<PriceSample> {
        self.samples.iter().copied().collect()
    }

    /// Contiguous copy of the most recent `n` samples, oldest first
    pub fn tail(&self, n: usize) -> Vec<PriceSample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_at(secs: i64, price: f64) -> PriceSample {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        PriceSample::new_unchecked(ts, price, 1.0)
    }

    fn history(max_samples: usize, max_age_secs: i64) -> PriceHistory {
        PriceHistory::new(&PairConfig {
            symbol: "TEST".to_string(),
            max_samples,
            max_age_secs,
        })
    }

    #[test]
    fn test_push_and_snapshot_order() {
        let mut h = history(10, 3600);
        for i in 0..5 {
            assert!(h.push(sample_at(i, 100.0 + i as f64)));
        }
        let snap = h.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].price, 100.0);
        assert_eq!(snap[4].price, 104.0);
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let mut h = history(3, 3600);
        for i in 0..5 {
            h.push(sample_at(i, i as f64));
        }
        let snap = h.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].price, 2.0);
    }

    #[test]
    fn test_age_bound_evicts_stale() {
        let mut h = history(100, 60);
        h.push(sample_at(0, 1.0));
        h.push(sample_at(10, 2.0));
        h.push(sample_at(120, 3.0)); // first two now older than 60s
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest().unwrap().price, 3.0);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut h = history(10, 3600);
        assert!(h.push(sample_at(100, 1.0)));
        assert!(!h.push(sample_at(50, 2.0)));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_tail() {
        let mut h = history(10, 3600);
        for i in 0..6 {
            h.push(sample_at(i, i as f64));
        }
        let tail = h.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].price, 4.0);
        assert_eq!(tail[1].price, 5.0);
    }
}
