//! Market regime classification
//!
//! A five-state hidden-state model with Gaussian emissions over two window
//! features: standardized drift and relative volatility. Each update is one
//! forward-filter step; the full posterior is kept as a plain probability
//! vector so hysteresis and tests can inspect it directly, with no dynamic
//! dispatch between "strategy" objects.

use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};
use tracing::{debug, info};

use crate::config::RegimeConfig;
use crate::types::{EngineError, PriceSample};

/// Qualitative market behavior mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Ranging,
    TrendingUp,
    TrendingDown,
    Volatile,
    Unknown,
}

pub const REGIME_COUNT: usize = 5;

/// All regimes, in probability-vector index order
pub const ALL_REGIMES: [Regime; REGIME_COUNT] = [
    Regime::Ranging,
    Regime::TrendingUp,
    Regime::TrendingDown,
    Regime::Volatile,
    Regime::Unknown,
];

impl Regime {
    fn index(self) -> usize {
        match self {
            Regime::Ranging => 0,
            Regime::TrendingUp => 1,
            Regime::TrendingDown => 2,
            Regime::Volatile => 3,
            Regime::Unknown => 4,
        }
    }

    pub fn is_trending(self) -> bool {
        matches!(self, Regime::TrendingUp | Regime::TrendingDown)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Regime::Ranging => "RANGING",
            Regime::TrendingUp => "TRENDING_UP",
            Regime::TrendingDown => "TRENDING_DOWN",
            Regime::Volatile => "VOLATILE",
            Regime::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

/// Posterior regime state published after each update.
///
/// `regime` is the maximum-a-posteriori state; `probabilities` is the full
/// vector (index order of [`ALL_REGIMES`]). A regime only counts as
/// `confirmed` once it has held for the configured dwell minimum;
/// downstream consumers treat anything unconfirmed as UNKNOWN.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub probabilities: [f64; REGIME_COUNT],
    pub dwell_cycles: u32,
    pub confirmed: bool,
}

impl RegimeState {
    pub fn initial() -> Self {
        let mut probabilities = [0.025; REGIME_COUNT];
        probabilities[Regime::Unknown.index()] = 0.9;
        Self {
            regime: Regime::Unknown,
            probabilities,
            dwell_cycles: 0,
            confirmed: false,
        }
    }

    /// Regime with single-cycle noise filtered out
    pub fn effective(&self) -> Regime {
        if self.confirmed {
            self.regime
        } else {
            Regime::Unknown
        }
    }

    pub fn probability_of(&self, regime: Regime) -> f64 {
        self.probabilities[regime.index()]
    }
}

/// Per-state Gaussian emission model over (standardized drift, vol ratio)
#[derive(Debug, Clone, Copy)]
struct Emission {
    drift_mean: f64,
    drift_sd: f64,
    vol_mean: f64,
    vol_sd: f64,
}

impl Emission {
    fn likelihood(&self, drift_z: f64, vol_ratio: f64) -> f64 {
        // Parameters are fixed positive constants, so construction cannot fail
        let drift = Normal::new(self.drift_mean, self.drift_sd)
            .map(|n| n.pdf(drift_z))
            .unwrap_or(0.0);
        let vol = Normal::new(self.vol_mean, self.vol_sd)
            .map(|n| n.pdf(vol_ratio))
            .unwrap_or(0.0);
        drift * vol
    }
}

#[derive(Debug, Clone)]
struct FittedModel {
    /// Baseline per-step log-return volatility from the fit window
    baseline_vol: f64,
    emissions: [Emission; REGIME_COUNT],
}

/// Incremental regime classifier.
///
/// `fit` estimates the baseline volatility and instantiates the emission
/// models; `update` runs one forward step over a fresh observation window.
/// Refitting is cheap and may run off the cycle path; the engine swaps the
/// classifier state under its lock so a cycle never observes a half-built
/// model.
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config: RegimeConfig,
    model: Option<FittedModel>,
    state: RegimeState,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            model: None,
            state: RegimeState::initial(),
        }
    }

    pub fn is_fit(&self) -> bool {
        self.model.is_some()
    }

    pub fn state(&self) -> &RegimeState {
        &self.state
    }

    /// Carry a posterior across a model refit
    pub(crate) fn set_state(&mut self, state: RegimeState) {
        self.state = state;
    }

    /// Estimate the baseline volatility and build the emission models.
    ///
    /// Needs at least one observation window of history.
    pub fn fit(&mut self, samples: &[PriceSample]) -> Result<(), EngineError> {
        let need = self.config.window + 1;
        if samples.len() < need {
            return Err(EngineError::InsufficientData {
                got: samples.len(),
                need,
            });
        }

        let returns = log_returns(samples);
        let baseline_vol = std_dev(&returns).max(1e-9);

        let trend = self.config.trend_drift_sigmas;
        let volatile = self.config.volatile_vol_multiple;
        let emissions = [
            // Ranging: drift near zero, volatility near baseline
            Emission {
                drift_mean: 0.0,
                drift_sd: 1.0,
                vol_mean: 1.0,
                vol_sd: 0.3,
            },
            // TrendingUp
            Emission {
                drift_mean: trend,
                drift_sd: 1.0,
                vol_mean: 1.0,
                vol_sd: 0.5,
            },
            // TrendingDown
            Emission {
                drift_mean: -trend,
                drift_sd: 1.0,
                vol_mean: 1.0,
                vol_sd: 0.5,
            },
            // Volatile: spread drift, elevated volatility
            Emission {
                drift_mean: 0.0,
                drift_sd: 2.0,
                vol_mean: volatile,
                vol_sd: 0.8,
            },
            // Unknown: diffuse catch-all
            Emission {
                drift_mean: 0.0,
                drift_sd: 3.0,
                vol_mean: 1.5,
                vol_sd: 1.5,
            },
        ];

        self.model = Some(FittedModel {
            baseline_vol,
            emissions,
        });
        info!(baseline_vol, "regime model fit");
        Ok(())
    }

    /// One forward-filter step over the most recent observation window.
    pub fn update(&mut self, window: &[PriceSample]) -> Result<RegimeState, EngineError> {
        let model = self.model.as_ref().ok_or(EngineError::ModelNotFit)?;

        let returns = log_returns(window);
        if returns.is_empty() {
            // Nothing new to observe; the posterior stands
            return Ok(self.state);
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let vol = std_dev(&returns);
        let drift_z = mean * n.sqrt() / model.baseline_vol;
        let vol_ratio = vol / model.baseline_vol;

        let prior = self.propagate(&self.state.probabilities);
        let mut posterior = [0.0; REGIME_COUNT];
        for (i, emission) in model.emissions.iter().enumerate() {
            posterior[i] = prior[i] * emission.likelihood(drift_z, vol_ratio);
        }
        let total: f64 = posterior.iter().sum();
        if total > 0.0 && total.is_finite() {
            for p in &mut posterior {
                *p /= total;
            }
        } else {
            // Likelihood underflow: fall back to the propagated prior
            posterior = prior;
        }

        let map = ALL_REGIMES[argmax(&posterior)];
        let dwell_cycles = if map == self.state.regime {
            self.state.dwell_cycles + 1
        } else {
            1
        };
        let confirmed = dwell_cycles >= self.config.min_dwell_cycles;

        if map != self.state.regime {
            debug!(from = %self.state.regime, to = %map, "regime MAP change");
        }

        self.state = RegimeState {
            regime: map,
            probabilities: posterior,
            dwell_cycles,
            confirmed,
        };
        Ok(self.state)
    }

    /// Apply the sticky transition matrix to a probability vector
    fn propagate(&self, probs: &[f64; REGIME_COUNT]) -> [f64; REGIME_COUNT] {
        let stay = self.config.transition_stickiness;
        let spread = (1.0 - stay) / (REGIME_COUNT - 1) as f64;
        let mut out = [0.0; REGIME_COUNT];
        for (j, slot) in out.iter_mut().enumerate() {
            *slot = probs
                .iter()
                .enumerate()
                .map(|(i, p)| p * if i == j { stay } else { spread })
                .sum();
        }
        out
    }
}

fn log_returns(samples: &[PriceSample]) -> Vec<f64> {
    samples
        .windows(2)
        .filter(|w| w[0].price > 0.0 && w[1].price > 0.0)
        .map(|w| (w[1].price / w[0].price).ln())
        .collect()
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
