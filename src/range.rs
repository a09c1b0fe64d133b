//! Range estimation via kernel density
//!
//! Builds a volume-weighted Gaussian kernel density estimate over observed
//! prices, locates the dominant mode, and expands around it until a
//! configured share of the probability mass is captured. Pure and
//! deterministic: identical input yields bit-identical output.

use itertools::{Itertools, MinMaxResult};
use statrs::distribution::{Continuous, Normal};
use tracing::debug;

use crate::config::EstimatorConfig;
use crate::types::{EngineError, PriceSample, RangeEstimate};

/// Discretized density over price, shared with grid construction and sizing.
///
/// `mass[j]` is the probability mass attributed to grid point `j`
/// (normalized to sum to 1).
#[derive(Debug, Clone)]
pub struct DensityProfile {
    points: Vec<f64>,
    mass: Vec<f64>,
    mode_index: usize,
}

impl DensityProfile {
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    /// Price at the dominant mode
    pub fn mode_price(&self) -> f64 {
        self.points[self.mode_index]
    }

    /// Probability mass falling inside [lower, upper]
    pub fn mass_between(&self, lower: f64, upper: f64) -> f64 {
        self.points
            .iter()
            .zip(&self.mass)
            .filter(|(p, _)| **p >= lower && **p <= upper)
            .map(|(_, m)| m)
            .sum()
    }

    /// Price at cumulative-mass quantile `q` of the density restricted to
    /// [lower, upper]. `q` is clamped to [0, 1].
    pub fn quantile_in(&self, lower: f64, upper: f64, q: f64) -> f64 {
        let q = q.clamp(0.0, 1.0);
        let total = self.mass_between(lower, upper);
        if total <= 0.0 {
            // No mass inside: fall back to linear interpolation
            return lower + q * (upper - lower);
        }
        let target = q * total;
        let mut acc = 0.0;
        for (p, m) in self.points.iter().zip(&self.mass) {
            if *p < lower || *p > upper {
                continue;
            }
            acc += m;
            if acc >= target {
                return *p;
            }
        }
        upper
    }

    /// Normalized local density at `price` (linear interpolation between
    /// grid points; zero outside the evaluated span)
    pub fn weight_at(&self, price: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if price < first || price > last || self.points.len() < 2 {
            return 0.0;
        }
        let step = self.points[1] - self.points[0];
        if step <= 0.0 {
            return self.mass[0];
        }
        let pos = (price - first) / step;
        let i = (pos.floor() as usize).min(self.points.len() - 2);
        let frac = pos - i as f64;
        self.mass[i] * (1.0 - frac) + self.mass[i + 1] * frac
    }
}

/// Range estimate plus the density profile it was derived from.
///
/// The profile is cycle-local working data for GridBuilder and
/// PositionSizer; only the estimate itself is a published value.
#[derive(Debug, Clone)]
pub struct RangeAnalysis {
    pub estimate: RangeEstimate,
    pub profile: DensityProfile,
}

/// Kernel density range estimator.
///
/// Bandwidth follows Scott's rule on the volume-weighted price spread, with
/// the adaptive widening/narrowing factor keyed to relative volatility.
#[derive(Debug, Clone)]
pub struct RangeEstimator {
    config: EstimatorConfig,
}

impl RangeEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    /// Estimate the probable trading range from a sample window.
    ///
    /// Pure function of its input: no hidden state, no randomness, and the
    /// estimate timestamp is taken from the newest sample so repeated calls
    /// on a frozen window are identical.
    pub fn estimate(&self, samples: &[PriceSample]) -> Result<RangeAnalysis, EngineError> {
        if samples.len() < self.config.min_samples {
            return Err(EngineError::InsufficientData {
                got: samples.len(),
                need: self.config.min_samples,
            });
        }

        let prices: Vec<f64> = samples.iter().map(|s| s.price).collect();
        let total_volume: f64 = samples.iter().map(|s| s.volume).sum();
        // Zero-volume windows degrade to an unweighted estimate
        let weights: Vec<f64> = if total_volume > 0.0 {
            samples.iter().map(|s| s.volume / total_volume).collect()
        } else {
            vec![1.0 / samples.len() as f64; samples.len()]
        };

        let mean: f64 = prices.iter().zip(&weights).map(|(p, w)| p * w).sum();
        let variance: f64 = prices
            .iter()
            .zip(&weights)
            .map(|(p, w)| w * (p - mean) * (p - mean))
            .sum();
        let sigma = variance.sqrt();

        let bandwidth = self.bandwidth(sigma, mean, prices.len());

        let (lo, hi) = span(&prices, bandwidth);
        let m = self.config.evaluation_points.max(2);
        let step = (hi - lo) / (m - 1) as f64;
        let points: Vec<f64> = (0..m).map(|j| lo + step * j as f64).collect();

        // statrs Normal::new only fails on non-finite or non-positive sigma,
        // which bandwidth() has already excluded
        let kernel = Normal::new(0.0, 1.0).map_err(|_| EngineError::InsufficientData {
            got: samples.len(),
            need: self.config.min_samples,
        })?;

        let mut density: Vec<f64> = points
            .iter()
            .map(|x| {
                prices
                    .iter()
                    .zip(&weights)
                    .map(|(p, w)| w * kernel.pdf((x - p) / bandwidth))
                    .sum::<f64>()
                    / bandwidth
            })
            .collect();

        let total: f64 = density.iter().sum();
        if total > 0.0 {
            for d in &mut density {
                *d /= total;
            }
        }

        let mode_index = density
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let (left, right, captured) =
            expand_around_mode(&density, mode_index, self.config.density_mass_target);

        let estimate = RangeEstimate {
            lower_bound: points[left],
            upper_bound: points[right],
            confidence: (captured / self.config.density_mass_target).min(1.0),
            estimated_at: samples[samples.len() - 1].timestamp,
        };

        debug!(
            lower = estimate.lower_bound,
            upper = estimate.upper_bound,
            confidence = estimate.confidence,
            bandwidth,
            "range estimated"
        );

        Ok(RangeAnalysis {
            estimate,
            profile: DensityProfile {
                points,
                mass: density,
                mode_index,
            },
        })
    }

    /// Scott's rule with adaptive adjustment for unusually quiet or
    /// turbulent windows
    fn bandwidth(&self, sigma: f64, mean: f64, n: usize) -> f64 {
        let scott = 1.06 * sigma * (n as f64).powf(-0.2);
        let relative_vol = if mean > 0.0 { sigma / mean } else { 0.0 };
        let factor = if relative_vol > self.config.high_volatility_threshold {
            1.2
        } else if relative_vol < self.config.low_volatility_threshold {
            0.8
        } else {
            1.0
        };
        let bw = scott * factor;
        if bw > 0.0 && bw.is_finite() {
            bw
        } else {
            // Flat window: fall back to a sliver of the price level
            (mean * 1e-4).max(f64::MIN_POSITIVE)
        }
    }
}

fn span(prices: &[f64], bandwidth: f64) -> (f64, f64) {
    let (min, max) = match prices.iter().copied().minmax_by(f64::total_cmp) {
        MinMaxResult::MinMax(lo, hi) => (lo, hi),
        MinMaxResult::OneElement(p) => (p, p),
        MinMaxResult::NoElements => (0.0, 0.0),
    };
    (min - 3.0 * bandwidth, max + 3.0 * bandwidth)
}

/// Grow [left, right] outward from the mode, absorbing the denser neighbor
/// first, until the target mass is captured or the grid is exhausted.
fn expand_around_mode(mass: &[f64], mode: usize, target: f64) -> (usize, usize, f64) {
    let mut left = mode;
    let mut right = mode;
    let mut captured = mass[mode];

    while captured < target && (left > 0 || right < mass.len() - 1) {
        let left_next = if left > 0 { mass[left - 1] } else { f64::NEG_INFINITY };
        let right_next = if right < mass.len() - 1 {
            mass[right + 1]
        } else {
            f64::NEG_INFINITY
        };

        if left_next >= right_next && left > 0 {
            left -= 1;
            captured += mass[left];
        } else {
            right += 1;
            captured += mass[right];
        }
    }

    (left, right, captured)
}
