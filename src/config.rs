//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files. Every numeric
//! the decision engine depends on is a tunable here with a documented
//! default; nothing is hard-coded in the components.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pair: PairConfig,
    pub estimator: EstimatorConfig,
    pub regime: RegimeConfig,
    pub grid: GridConfig,
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.sizing.max_level_fraction <= self.sizing.max_total_fraction,
            "per-level cap ({}) cannot exceed aggregate cap ({})",
            self.sizing.max_level_fraction,
            self.sizing.max_total_fraction
        );
        anyhow::ensure!(
            self.risk.soft_stop_drawdown < self.risk.hard_stop_drawdown,
            "soft-stop drawdown ({}) must be below hard-stop drawdown ({})",
            self.risk.soft_stop_drawdown,
            self.risk.hard_stop_drawdown
        );
        anyhow::ensure!(
            self.estimator.density_mass_target > 0.0 && self.estimator.density_mass_target <= 1.0,
            "density_mass_target must be in (0, 1], got {}",
            self.estimator.density_mass_target
        );
        Ok(())
    }
}

/// Traded pair and history retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairConfig {
    pub symbol: String,
    /// Maximum samples kept in the trailing window
    pub max_samples: usize,
    /// Maximum sample age in seconds
    pub max_age_secs: i64,
}

impl Default for PairConfig {
    fn default() -> Self {
        PairConfig {
            symbol: "SOLUSDT".to_string(),
            max_samples: 5_000,
            max_age_secs: 48 * 3600,
        }
    }
}

/// Range estimator (kernel density) parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Minimum history length before an estimate is attempted
    pub min_samples: usize,
    /// Number of points on the density evaluation grid
    pub evaluation_points: usize,
    /// Density mass the range bounds must capture around the mode
    pub density_mass_target: f64,
    /// Relative volatility above which the bandwidth widens
    pub high_volatility_threshold: f64,
    /// Relative volatility below which the bandwidth narrows
    pub low_volatility_threshold: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            min_samples: 100,
            evaluation_points: 512,
            density_mass_target: 0.80,
            high_volatility_threshold: 0.02,
            low_volatility_threshold: 0.005,
        }
    }
}

/// Regime classifier parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Samples per observation window fed to update()
    pub window: usize,
    /// Self-transition probability; the remainder spreads evenly
    pub transition_stickiness: f64,
    /// Typical standardized drift (mean return in units of its standard
    /// error) emitted by a trending state
    pub trend_drift_sigmas: f64,
    /// Volatility multiple (vs baseline) typical of the volatile state
    pub volatile_vol_multiple: f64,
    /// Cycles a MAP state must hold before the regime is confirmed
    pub min_dwell_cycles: u32,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            window: 50,
            transition_stickiness: 0.90,
            trend_drift_sigmas: 2.0,
            volatile_vol_multiple: 2.5,
            min_dwell_cycles: 3,
        }
    }
}

/// Grid construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Level count in a ranging market
    pub base_levels: usize,
    /// Level-count multiplier applied in trending regimes
    pub trend_level_factor: f64,
    /// Fraction of density mass shifted toward the trend direction
    pub trend_skew: f64,
    /// Below this range confidence no new levels are emitted
    pub min_confidence: f64,
    /// Minimum separation between a new level and a preserved one,
    /// as a fraction of the local inter-level spacing
    pub min_level_separation: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            base_levels: 10,
            trend_level_factor: 0.6,
            trend_skew: 0.35,
            min_confidence: 0.5,
            min_level_separation: 0.2,
        }
    }
}

/// Position sizing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Fraction of full Kelly actually deployed
    pub kelly_fraction: f64,
    /// Hard cap per level, as a fraction of equity
    pub max_level_fraction: f64,
    /// Hard cap on aggregate grid exposure, as a fraction of equity
    pub max_total_fraction: f64,
    /// Equity floor below which sizing refuses to allocate
    pub min_equity: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        SizingConfig {
            kelly_fraction: 0.25,
            max_level_fraction: 0.02,
            max_total_fraction: 0.40,
            min_equity: 100.0,
        }
    }
}

/// Risk governor thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Drawdown at which new allocations are scaled down
    pub soft_stop_drawdown: f64,
    /// Allocation multiplier while the soft stop is tripped
    pub soft_stop_scale: f64,
    /// Drawdown at which new entries are vetoed outright
    pub hard_stop_drawdown: f64,
    /// Losing settlements in a row before entries pause
    pub loss_streak_limit: u32,
    /// Aggregate exposure cap enforced per allocation
    pub max_exposure_pct: f64,
    /// Cycle-over-cycle relative range widening (0.75 = range grew 75%)
    /// treated as a catastrophic volatility spike
    pub volatility_spike_threshold: f64,
    /// Breaker cooldown in seconds
    pub cooldown_secs: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            soft_stop_drawdown: 0.10,
            soft_stop_scale: 0.50,
            hard_stop_drawdown: 0.20,
            loss_streak_limit: 3,
            max_exposure_pct: 0.40,
            volatility_spike_threshold: 0.75,
            cooldown_secs: 30 * 60,
        }
    }
}

/// Orchestrator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for any collaborator interaction within a cycle, in ms
    pub collaborator_timeout_ms: u64,
    /// Win-rate estimate fed to the sizer until fills provide a better one
    pub initial_win_rate: f64,
    /// Payoff-ratio estimate fed to the sizer until fills provide a better one
    pub initial_payoff_ratio: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            collaborator_timeout_ms: 5_000,
            initial_win_rate: 0.55,
            initial_payoff_ratio: 1.2,
        }
    }
}
