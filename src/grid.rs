//! Grid construction
//!
//! A grid is an ordered set of price levels, keyed by price. The builder
//! places levels at equal-cumulative-mass quantiles of the range's density
//! estimate, so each inter-level gap carries roughly the same information
//! content rather than the same price distance. Regime decides the level
//! count and skew; working orders inside the new range are never cancelled
//! by a rebuild.

use std::collections::BTreeMap;

use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GridConfig;
use crate::range::RangeAnalysis;
use crate::regime::{Regime, RegimeState};
use crate::types::{EngineError, Money, Side};

/// Lifecycle of a single grid level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelState {
    /// Created by the builder, not yet handed to execution
    Planned,
    /// Working order resting at the exchange
    Placed,
    /// Execution reported a fill
    Filled,
    /// Retired; a cancel is owed to the execution collaborator
    Cancelled,
}

/// One price level of the grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    pub side: Side,
    /// Base-asset quantity assigned by the sizer (zero until sized)
    pub target_size: Money,
    /// Normalized local density at this price, the sizer's split weight
    pub density_weight: f64,
    pub state: LevelState,
}

impl GridLevel {
    pub fn planned(price: f64, side: Side, density_weight: f64) -> Self {
        Self {
            price,
            side,
            target_size: Money::ZERO,
            density_weight,
            state: LevelState::Planned,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, LevelState::Planned | LevelState::Placed)
    }
}

/// Ordered set of grid levels keyed by price.
///
/// Price is identity: at most one level per price, which keeps allocations
/// free of back-references (they are recomputed each cycle, never mutated).
#[derive(Debug, Clone, Default)]
pub struct Grid {
    levels: BTreeMap<NotNan<f64>, GridLevel>,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a level; rejects NaN prices and duplicate active prices.
    /// Returns false if the level was not inserted.
    pub fn insert(&mut self, level: GridLevel) -> bool {
        let key = match NotNan::new(level.price) {
            Ok(k) => k,
            Err(_) => {
                warn!("rejecting grid level with NaN price");
                return false;
            }
        };
        match self.levels.get(&key) {
            Some(existing) if existing.is_active() => false,
            _ => {
                self.levels.insert(key, level);
                true
            }
        }
    }

    pub fn get(&self, price: f64) -> Option<&GridLevel> {
        NotNan::new(price).ok().and_then(|k| self.levels.get(&k))
    }

    pub fn get_mut(&mut self, price: f64) -> Option<&mut GridLevel> {
        NotNan::new(price)
            .ok()
            .and_then(move |k| self.levels.get_mut(&k))
    }

    /// All levels in ascending price order
    pub fn levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values()
    }

    pub fn levels_mut(&mut self) -> impl Iterator<Item = &mut GridLevel> {
        self.levels.values_mut()
    }

    /// Planned and placed levels, ascending by price
    pub fn active_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values().filter(|l| l.is_active())
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active_levels().count()
    }

    /// Drop the level at `price` entirely (for levels that never reached
    /// the exchange). Returns false when no level exists at that price.
    pub fn remove(&mut self, price: f64) -> bool {
        NotNan::new(price)
            .ok()
            .and_then(|k| self.levels.remove(&k))
            .is_some()
    }

    /// Transition the level at `price` after an execution event.
    /// Returns false when no level exists at that price.
    pub fn transition(&mut self, price: f64, to: LevelState) -> bool {
        match self.get_mut(price) {
            Some(level) => {
                level.state = to;
                true
            }
            None => false,
        }
    }
}

/// Regime-aware grid builder
#[derive(Debug, Clone)]
pub struct GridBuilder {
    config: GridConfig,
}

impl GridBuilder {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    /// Build the next grid from a fresh range analysis and regime.
    ///
    /// Existing PLACED levels inside the new range are carried over
    /// untouched; PLACED levels outside it are marked CANCELLED so the plan
    /// can retire them explicitly. A degenerate range fails `InvalidRange`
    /// and the caller keeps the prior grid.
    pub fn build(
        &self,
        analysis: &RangeAnalysis,
        regime: &RegimeState,
        existing: &Grid,
    ) -> Result<Grid, EngineError> {
        let est = &analysis.estimate;
        if est.upper_bound <= est.lower_bound {
            return Err(EngineError::InvalidRange {
                lower: est.lower_bound,
                upper: est.upper_bound,
            });
        }

        let mut grid = Grid::new();

        // Carry working orders; retire the ones the range left behind
        for level in existing.levels() {
            if level.state != LevelState::Placed {
                continue;
            }
            let mut carried = level.clone();
            if !est.contains(level.price) {
                carried.state = LevelState::Cancelled;
            }
            grid.insert(carried);
        }

        let effective = regime.effective();
        if est.confidence < self.config.min_confidence {
            debug!(
                confidence = est.confidence,
                threshold = self.config.min_confidence,
                "range confidence too low, emitting no new levels"
            );
            return Ok(grid);
        }

        let count = self.level_count(effective);
        if count == 0 {
            return Ok(grid);
        }

        let spacing = est.width() / count as f64;
        let min_gap = spacing * self.config.min_level_separation;
        let mode = analysis
            .profile
            .mode_price()
            .clamp(est.lower_bound, est.upper_bound);

        for i in 0..count {
            let q = self.skewed_quantile((i as f64 + 0.5) / count as f64, effective);
            let price = analysis
                .profile
                .quantile_in(est.lower_bound, est.upper_bound, q);

            // Keep clear of carried working orders
            let conflicts = grid
                .levels()
                .any(|l| l.state == LevelState::Placed && (l.price - price).abs() < min_gap);
            if conflicts {
                continue;
            }

            let side = if price <= mode { Side::Buy } else { Side::Sell };
            let weight = analysis.profile.weight_at(price);
            grid.insert(GridLevel::planned(price, side, weight));
        }

        debug!(
            regime = %effective,
            levels = grid.active_count(),
            lower = est.lower_bound,
            upper = est.upper_bound,
            "grid built"
        );

        Ok(grid)
    }

    fn level_count(&self, regime: Regime) -> usize {
        let base = self.config.base_levels;
        match regime {
            Regime::Ranging => base,
            Regime::TrendingUp | Regime::TrendingDown => {
                ((base as f64 * self.config.trend_level_factor).round() as usize).max(2)
            }
            // Wider information spacing, less exposure
            Regime::Volatile | Regime::Unknown => (base / 2).max(2),
        }
    }

    /// Shift the quantile window toward the trend direction
    fn skewed_quantile(&self, q: f64, regime: Regime) -> f64 {
        let skew = self.config.trend_skew;
        match regime {
            Regime::TrendingUp => skew + q * (1.0 - skew),
            Regime::TrendingDown => q * (1.0 - skew),
            _ => q,
        }
    }
}
