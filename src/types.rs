//! Core data types shared across the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine error taxonomy.
///
/// All four variants are recoverable-by-skip: the orchestrator logs the
/// condition, keeps the prior grid and risk state, and retries next cycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient data: {got} samples, need at least {need}")]
    InsufficientData { got: usize, need: usize },

    #[error("regime model not fit; call fit() before update()")]
    ModelNotFit,

    #[error("invalid range: upper ({upper}) must exceed lower ({lower})")]
    InvalidRange { lower: f64, upper: f64 },

    #[error("no capital available: equity {equity} below minimum {minimum}")]
    NoCapitalAvailable { equity: f64, minimum: f64 },
}

/// Validation errors for price samples
#[derive(Debug, Error)]
pub enum SampleValidationError {
    #[error("price ({0}) must be positive and finite")]
    InvalidPrice(f64),

    #[error("volume ({0}) must be >= 0 and finite")]
    InvalidVolume(f64),
}

/// A single observed trade print or candle close: the unit of market history.
///
/// Samples are immutable once recorded and held in an append-only,
/// time-ordered window (see [`crate::history::PriceHistory`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

impl PriceSample {
    /// Create a new sample with validation
    pub fn new(
        timestamp: DateTime<Utc>,
        price: f64,
        volume: f64,
    ) -> Result<Self, SampleValidationError> {
        let sample = Self {
            timestamp,
            price,
            volume,
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Create a sample without validation (for trusted sources)
    pub fn new_unchecked(timestamp: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            timestamp,
            price,
            volume,
        }
    }

    pub fn validate(&self) -> Result<(), SampleValidationError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(SampleValidationError::InvalidPrice(self.price));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(SampleValidationError::InvalidVolume(self.volume));
        }
        Ok(())
    }
}

/// Most-likely trading range derived from the density estimate.
///
/// Produced fresh each cycle and never mutated, only replaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeEstimate {
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Fraction of the targeted density mass actually captured, in [0, 1].
    pub confidence: f64,
    pub estimated_at: DateTime<Utc>,
}

impl RangeEstimate {
    pub fn width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower_bound && price <= self.upper_bound
    }

    /// Relative width against the range midpoint
    pub fn relative_width(&self) -> f64 {
        let mid = (self.upper_bound + self.lower_bound) / 2.0;
        if mid <= 0.0 {
            return 0.0;
        }
        self.width() / mid
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

// ============================================================================
// Money: decimal quantities on the order-plan boundary
// ============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Decimal quantity for everything that crosses into an order plan: level
/// sizes, notional exposure, settled pnl.
///
/// Statistical code stays in f64; the conversion happens exactly once, at
/// the boundary where a computed number becomes something the execution
/// collaborator could act on. A value that does not survive that conversion
/// (NaN, infinity, out of decimal range) is not an actable quantity, so it
/// converts to zero and the corresponding order simply never exists.
///
/// Comparisons and ordering delegate to the underlying decimal; only the
/// arithmetic the plan pipeline needs (add, subtract, multiply) is exposed,
/// so there is no division to guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Convert a computed f64 into an actable quantity; anything
    /// non-representable becomes zero (no order)
    pub fn from_f64(value: f64) -> Self {
        match Decimal::from_f64(value) {
            Some(d) => Money(d),
            None => Money::ZERO,
        }
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_validation() {
        let now = Utc::now();
        assert!(PriceSample::new(now, 100.0, 10.0).is_ok());
        assert!(PriceSample::new(now, -1.0, 10.0).is_err());
        assert!(PriceSample::new(now, 0.0, 10.0).is_err());
        assert!(PriceSample::new(now, 100.0, -5.0).is_err());
        assert!(PriceSample::new(now, f64::NAN, 10.0).is_err());
    }

    #[test]
    fn test_range_contains() {
        let range = RangeEstimate {
            lower_bound: 99.0,
            upper_bound: 101.0,
            confidence: 0.9,
            estimated_at: Utc::now(),
        };
        assert!(range.contains(100.0));
        assert!(range.contains(99.0));
        assert!(!range.contains(98.9));
        assert_eq!(range.width(), 2.0);
    }

    #[test]
    fn test_money_precision() {
        // 0.1 + 0.2 != 0.3 in f64; Money must not inherit that
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        assert_eq!(a + b, Money::from_f64(0.3));
    }

    #[test]
    fn test_money_matches_decimal_literal() {
        use rust_decimal_macros::dec;
        assert_eq!(Money::from_f64(0.3), Money(dec!(0.3)));
        assert_eq!(Money::from_f64(100.25), Money(dec!(100.25)));
    }

    #[test]
    fn test_money_non_representable_is_no_quantity() {
        assert_eq!(Money::from_f64(f64::NAN), Money::ZERO);
        assert_eq!(Money::from_f64(f64::INFINITY), Money::ZERO);
        assert_eq!(Money::from_f64(f64::NEG_INFINITY), Money::ZERO);
        assert!(!Money::from_f64(f64::NAN).is_positive());
    }

    #[test]
    fn test_money_ordering() {
        assert!(Money::from_f64(-1.0) < Money::ZERO);
        assert!(Money::from_f64(2.0) > Money::from_f64(1.5));
        assert!(Money::from_f64(1.0).is_positive());
        assert!(!Money::from_f64(-1.0).is_positive());
        assert!(Money::ZERO.is_zero());
    }
}
