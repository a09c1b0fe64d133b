//! Position sizing
//!
//! Fractional-Kelly capital allocation split across grid levels by their
//! density weight. The hard caps are applied after the formula and always
//! bind, whatever the formula says.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SizingConfig;
use crate::grid::{Grid, LevelState};
use crate::risk::RiskSnapshot;
use crate::types::{EngineError, Money};

/// Capital assigned to one grid level for this cycle.
///
/// Derived data: recomputed every cycle from the grid and risk snapshot,
/// never mutated in place and never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionAllocation {
    pub level_price: f64,
    pub capital_fraction: f64,
    /// Base-asset quantity at the level price
    pub absolute_size: Money,
}

/// Kelly-based sizer with hard per-level and aggregate caps
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Allocate capital across the grid's planned levels.
    ///
    /// Fails `NoCapitalAvailable` below the equity floor; the engine skips
    /// the cycle (zero new allocations) and the prior grid stands.
    pub fn size(
        &self,
        grid: &Grid,
        risk: &RiskSnapshot,
        win_rate: f64,
        payoff_ratio: f64,
    ) -> Result<Vec<PositionAllocation>, EngineError> {
        if risk.equity < self.config.min_equity {
            return Err(EngineError::NoCapitalAvailable {
                equity: risk.equity,
                minimum: self.config.min_equity,
            });
        }

        let levels: Vec<_> = grid
            .levels()
            .filter(|l| l.state == LevelState::Planned)
            .collect();
        if levels.is_empty() {
            return Ok(Vec::new());
        }

        let total_fraction = self
            .kelly_fraction(win_rate, payoff_ratio)
            .min(self.config.max_total_fraction);

        let weight_sum: f64 = levels.iter().map(|l| l.density_weight).sum();

        let allocations = levels
            .iter()
            .map(|level| {
                // Degenerate weights fall back to an even split
                let share = if weight_sum > 0.0 {
                    level.density_weight / weight_sum
                } else {
                    1.0 / levels.len() as f64
                };
                let capital_fraction =
                    (total_fraction * share).min(self.config.max_level_fraction);
                let quantity = if level.price > 0.0 {
                    risk.equity * capital_fraction / level.price
                } else {
                    0.0
                };
                PositionAllocation {
                    level_price: level.price,
                    capital_fraction,
                    absolute_size: Money::from_f64(quantity),
                }
            })
            .collect::<Vec<_>>();

        let deployed: f64 = allocations.iter().map(|a| a.capital_fraction).sum();
        debug!(
            levels = allocations.len(),
            total_fraction,
            deployed,
            win_rate,
            payoff_ratio,
            "positions sized"
        );

        Ok(allocations)
    }

    /// Kelly criterion `f = w - (1-w)/r`, floored at zero and scaled down
    /// by the fractional multiplier
    fn kelly_fraction(&self, win_rate: f64, payoff_ratio: f64) -> f64 {
        if payoff_ratio <= 0.0 {
            return 0.0;
        }
        let win_rate = win_rate.clamp(0.0, 1.0);
        let full = win_rate - (1.0 - win_rate) / payoff_ratio;
        full.max(0.0) * self.config.kelly_fraction
    }
}
