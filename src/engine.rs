//! Cycle orchestrator
//!
//! Ties the estimators, builder, sizer, and governor into one decision
//! cycle per call: refresh regime and range, rebuild the grid, size the
//! levels, and pass everything through the risk governor. The cycle's
//! working set lives on the stack of `run_cycle` and is only committed
//! after approval; any skip or abort leaves the published grid and risk
//! state exactly as they were.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::grid::{Grid, GridBuilder, LevelState};
use crate::history::PriceHistory;
use crate::range::RangeEstimator;
use crate::regime::{RegimeClassifier, RegimeState};
use crate::risk::{
    ApprovedPlan, PlannedOrder, ProposedPlan, RiskGovernor, RiskSnapshot, RiskVerdict, VetoReason,
};
use crate::sizing::PositionSizer;
use crate::types::{EngineError, Money, PriceSample};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Pull-style account collaborator: current equity and open exposure
pub trait AccountService: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, anyhow::Result<AccountUpdate>>;
}

/// Equity refresh pushed into (or pulled by) the engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub equity: f64,
    pub exposure_pct: f64,
}

/// Execution collaborator notification, correlated by level price and an
/// opaque order identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub level_price: f64,
    pub order_id: String,
    pub kind: FillKind,
    /// Realized pnl when this fill settles a round trip
    pub realized_pnl: Option<Money>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillKind {
    Filled,
    Cancelled,
}

/// Why a cycle produced no plan at all
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SkipReason {
    InsufficientData { got: usize, need: usize },
    ModelNotFit,
    InvalidRange,
    NoCapitalAvailable,
    CycleInProgress,
    AccountUnavailable,
}

impl From<EngineError> for SkipReason {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InsufficientData { got, need } => {
                SkipReason::InsufficientData { got, need }
            }
            EngineError::ModelNotFit => SkipReason::ModelNotFit,
            EngineError::InvalidRange { .. } => SkipReason::InvalidRange,
            EngineError::NoCapitalAvailable { .. } => SkipReason::NoCapitalAvailable,
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::InsufficientData { got, need } => {
                write!(f, "insufficient data ({}/{})", got, need)
            }
            SkipReason::ModelNotFit => write!(f, "regime model not fit"),
            SkipReason::InvalidRange => write!(f, "degenerate range estimate"),
            SkipReason::NoCapitalAvailable => write!(f, "equity below minimum"),
            SkipReason::CycleInProgress => write!(f, "cycle already in progress"),
            SkipReason::AccountUnavailable => write!(f, "account service unavailable"),
        }
    }
}

/// Outcome of one decision cycle
#[derive(Debug, Clone)]
pub enum CycleResult {
    Approved(ApprovedPlan),
    /// New entries refused; `allowed` still carries the risk-reducing
    /// actions (cancels of retired working orders) the host must execute
    Vetoed {
        reason: VetoReason,
        allowed: ApprovedPlan,
    },
    Skipped(SkipReason),
    EmergencyFlatten { reason: String },
}

/// Running win/payoff estimates from settled round trips
#[derive(Debug, Clone, Default)]
struct TradeStats {
    wins: u32,
    losses: u32,
    total_win: f64,
    total_loss: f64,
}

impl TradeStats {
    fn record(&mut self, pnl: f64) {
        if pnl >= 0.0 {
            self.wins += 1;
            self.total_win += pnl;
        } else {
            self.losses += 1;
            self.total_loss += -pnl;
        }
    }

    fn win_rate(&self, initial: f64) -> f64 {
        let n = self.wins + self.losses;
        if n == 0 {
            initial
        } else {
            self.wins as f64 / n as f64
        }
    }

    fn payoff_ratio(&self, initial: f64) -> f64 {
        if self.wins == 0 || self.losses == 0 {
            return initial;
        }
        let avg_win = self.total_win / self.wins as f64;
        let avg_loss = self.total_loss / self.losses as f64;
        if avg_loss > 0.0 {
            avg_win / avg_loss
        } else {
            initial
        }
    }
}

/// Per-pair decision engine.
///
/// `run_cycle` is the host-facing entry point, callable on a fixed or
/// event-driven schedule; `on_sample`, `on_fill`, and `on_account_update`
/// are the asynchronous notification entry points. Cycles never overlap:
/// a call that finds one in flight skips instead of queueing.
pub struct GridEngine {
    config: Config,
    estimator: RangeEstimator,
    classifier: RwLock<RegimeClassifier>,
    builder: GridBuilder,
    sizer: PositionSizer,
    governor: RiskGovernor,
    history: RwLock<PriceHistory>,
    grid: RwLock<Grid>,
    stats: RwLock<TradeStats>,
    cycle_lock: tokio::sync::Mutex<()>,
    account: Option<Arc<dyn AccountService>>,
}

impl GridEngine {
    pub fn new(config: Config, initial_equity: f64) -> Self {
        Self {
            estimator: RangeEstimator::new(config.estimator.clone()),
            classifier: RwLock::new(RegimeClassifier::new(config.regime.clone())),
            builder: GridBuilder::new(config.grid.clone()),
            sizer: PositionSizer::new(config.sizing.clone()),
            governor: RiskGovernor::new(config.risk.clone(), initial_equity),
            history: RwLock::new(PriceHistory::new(&config.pair)),
            grid: RwLock::new(Grid::new()),
            stats: RwLock::new(TradeStats::default()),
            cycle_lock: tokio::sync::Mutex::new(()),
            account: None,
            config,
        }
    }

    /// Attach the pull-style account collaborator
    pub fn with_account_service(mut self, service: Arc<dyn AccountService>) -> Self {
        self.account = Some(service);
        self
    }

    /// Market-data entry point
    pub fn on_sample(&self, sample: PriceSample) {
        self.history.write().unwrap().push(sample);
    }

    /// Execution-report entry point: transitions the matching level and
    /// settles pnl into the risk governor
    pub fn on_fill(&self, event: FillEvent) {
        let to = match event.kind {
            FillKind::Filled => LevelState::Filled,
            FillKind::Cancelled => LevelState::Cancelled,
        };
        let known = self.grid.write().unwrap().transition(event.level_price, to);
        if !known {
            warn!(
                price = event.level_price,
                order_id = %event.order_id,
                "fill event for unknown grid level"
            );
        }
        if let Some(pnl) = event.realized_pnl {
            self.governor.record_settlement(pnl, Utc::now());
            self.stats.write().unwrap().record(pnl.to_f64());
        }
    }

    /// Push-style account refresh
    pub fn on_account_update(&self, update: AccountUpdate) {
        self.governor
            .update_account(update.equity, update.exposure_pct, Utc::now());
    }

    /// Host notification that a planned order is now resting
    pub fn on_order_placed(&self, level_price: f64) {
        self.grid
            .write()
            .unwrap()
            .transition(level_price, LevelState::Placed);
    }

    /// Catastrophic condition from a collaborator (e.g. connectivity loss)
    pub fn report_emergency(&self, reason: impl Into<String>) {
        self.governor.report_emergency(reason);
    }

    pub fn clear_emergency(&self) {
        self.governor.clear_emergency();
    }

    /// Refit the regime model on the current history, off the cycle path.
    ///
    /// The fit runs on a detached copy; the refreshed classifier is
    /// published in one swap (carrying the newest posterior), so a cycle
    /// always reads a complete, consistent model.
    pub fn refit_regime_model(&self) -> Result<(), EngineError> {
        let samples = self.history.read().unwrap().snapshot();
        let mut fitted = self.classifier.read().unwrap().clone();
        fitted.fit(&samples)?;
        let mut live = self.classifier.write().unwrap();
        fitted.set_state(*live.state());
        *live = fitted;
        Ok(())
    }

    pub fn risk_snapshot(&self) -> RiskSnapshot {
        self.governor.snapshot()
    }

    pub fn regime_state(&self) -> RegimeState {
        *self.classifier.read().unwrap().state()
    }

    /// Copy of the currently published grid
    pub fn grid(&self) -> Grid {
        self.grid.read().unwrap().clone()
    }

    /// Run one decision cycle.
    ///
    /// Every failure path is a skip: the prior grid and risk state stand,
    /// and nothing is emitted. An approval commits the new grid and
    /// returns the full plan; a veto commits and returns only the
    /// risk-reducing remainder (cancels), never a new entry.
    pub async fn run_cycle(&self) -> CycleResult {
        let _guard = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return CycleResult::Skipped(SkipReason::CycleInProgress),
        };

        if let Some(account) = &self.account {
            let timeout = Duration::from_millis(self.config.engine.collaborator_timeout_ms);
            match tokio::time::timeout(timeout, account.fetch()).await {
                Ok(Ok(update)) => self.on_account_update(update),
                Ok(Err(err)) => {
                    warn!(%err, "account refresh failed, skipping cycle");
                    return CycleResult::Skipped(SkipReason::AccountUnavailable);
                }
                Err(_) => {
                    warn!("account refresh timed out, skipping cycle");
                    return CycleResult::Skipped(SkipReason::AccountUnavailable);
                }
            }
        }

        let samples = self.history.read().unwrap().snapshot();

        let analysis = match self.estimator.estimate(&samples) {
            Ok(a) => a,
            Err(err) => {
                info!(%err, "skipping cycle");
                return CycleResult::Skipped(err.into());
            }
        };

        let regime = {
            let mut classifier = self.classifier.write().unwrap();
            if !classifier.is_fit() {
                if let Err(err) = classifier.fit(&samples) {
                    info!(%err, "skipping cycle");
                    return CycleResult::Skipped(err.into());
                }
            }
            let window = tail(&samples, self.config.regime.window + 1);
            match classifier.update(window) {
                Ok(state) => state,
                Err(err) => {
                    info!(%err, "skipping cycle");
                    return CycleResult::Skipped(err.into());
                }
            }
        };

        // Feed the spike detector before anything can be emitted
        self.governor
            .observe_range_width(analysis.estimate.relative_width(), Utc::now());

        let prior_grid = self.grid.read().unwrap().clone();
        let mut candidate = match self.builder.build(&analysis, &regime, &prior_grid) {
            Ok(grid) => grid,
            Err(err) => {
                info!(%err, "skipping cycle, prior grid retained");
                return CycleResult::Skipped(err.into());
            }
        };

        let snapshot = self.governor.snapshot();
        let (win_rate, payoff_ratio) = {
            let stats = self.stats.read().unwrap();
            (
                stats.win_rate(self.config.engine.initial_win_rate),
                stats.payoff_ratio(self.config.engine.initial_payoff_ratio),
            )
        };
        let allocations = match self
            .sizer
            .size(&candidate, &snapshot, win_rate, payoff_ratio)
        {
            Ok(allocations) => allocations,
            Err(err) => {
                info!(%err, "skipping cycle, no allocations");
                return CycleResult::Skipped(err.into());
            }
        };

        for allocation in &allocations {
            if let Some(level) = candidate.get_mut(allocation.level_price) {
                level.target_size = allocation.absolute_size;
            }
        }

        let plan = proposed_plan(&candidate);
        match self.governor.evaluate(&plan) {
            RiskVerdict::Approved(approved) => {
                // Rejected allocations never become resting orders
                for price in &approved.rejected_levels {
                    candidate.remove(*price);
                }
                if approved.scale < 1.0 {
                    let scale = Money::from_f64(approved.scale);
                    for level in candidate.levels_mut() {
                        if level.state == LevelState::Planned {
                            level.target_size = level.target_size * scale;
                        }
                    }
                }
                *self.grid.write().unwrap() = candidate;
                info!(
                    places = approved.places.len(),
                    cancels = approved.cancels.len(),
                    scale = approved.scale,
                    "cycle approved"
                );
                CycleResult::Approved(approved)
            }
            RiskVerdict::Veto { reason, allowed } => {
                // No new entries, but retirements still go out: mark the
                // levels cancelled in the published grid so the host's
                // cancel confirmations find them
                if !allowed.cancels.is_empty() {
                    let mut grid = self.grid.write().unwrap();
                    for price in &allowed.cancels {
                        grid.transition(*price, LevelState::Cancelled);
                    }
                }
                info!(
                    %reason,
                    cancels = allowed.cancels.len(),
                    "cycle vetoed, closing actions still pass"
                );
                CycleResult::Vetoed { reason, allowed }
            }
            RiskVerdict::EmergencyFlatten { reason } => {
                error!(%reason, "emergency flatten signalled");
                CycleResult::EmergencyFlatten { reason }
            }
        }
    }
}

fn tail(samples: &[PriceSample], n: usize) -> &[PriceSample] {
    &samples[samples.len().saturating_sub(n)..]
}

/// Derive the order plan from a sized candidate grid: place every funded
/// planned level, cancel every retired one
fn proposed_plan(grid: &Grid) -> ProposedPlan {
    let places = grid
        .levels()
        .filter(|l| l.state == LevelState::Planned && l.target_size.is_positive())
        .map(|l| PlannedOrder {
            price: l.price,
            side: l.side,
            size: l.target_size,
        })
        .collect();
    let cancels = grid
        .levels()
        .filter(|l| l.state == LevelState::Cancelled)
        .map(|l| l.price)
        .collect();
    ProposedPlan { places, cancels }
}
