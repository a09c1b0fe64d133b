//! Adaptive Grid Trading Core
//!
//! The decision engine of an automated grid-trading system for a single
//! asset pair: kernel-density range estimation, hidden-state regime
//! classification, entropy-weighted grid construction, fractional-Kelly
//! position sizing, and a layered risk governor that can veto, scale down,
//! or force-flatten trading activity.

pub mod config;
pub mod data;
pub mod engine;
pub mod grid;
pub mod history;
pub mod range;
pub mod regime;
pub mod risk;
pub mod sizing;
pub mod types;

pub use config::Config;
pub use types::*;
