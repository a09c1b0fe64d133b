//! Risk governor
//!
//! A layered set of independent circuit breakers evaluated in one pass,
//! least to most severe, with the most severe trip superseding the rest.
//! The governor owns the risk snapshot across cycles; everything else in
//! the engine only ever reads a copy of it. No plan leaves this module
//! without an explicit approval: absence of approval is always no action.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::types::{Money, Side};

/// Risk dimension guarded by a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerKind {
    Drawdown,
    LossStreak,
    Exposure,
    VolatilitySpike,
}

impl std::fmt::Display for BreakerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BreakerKind::Drawdown => "drawdown",
            BreakerKind::LossStreak => "loss_streak",
            BreakerKind::Exposure => "exposure",
            BreakerKind::VolatilitySpike => "volatility_spike",
        };
        write!(f, "{}", name)
    }
}

/// Latching safety control over one risk metric.
///
/// Trips when the observed value reaches the threshold. Clears only when
/// the cooldown has elapsed AND the value is back below threshold, so a
/// metric that recovers instantly cannot flap the breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub kind: BreakerKind,
    pub threshold: f64,
    pub current_value: f64,
    pub tripped: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(skip, default = "default_cooldown")]
    cooldown: Duration,
}

fn default_cooldown() -> Duration {
    Duration::zero()
}

impl CircuitBreaker {
    pub fn new(kind: BreakerKind, threshold: f64, cooldown: Duration) -> Self {
        Self {
            kind,
            threshold,
            current_value: 0.0,
            tripped: false,
            cooldown_until: None,
            cooldown,
        }
    }

    /// Record a fresh observation of the guarded metric
    pub fn observe(&mut self, value: f64, now: DateTime<Utc>) {
        self.current_value = value;
        if self.tripped {
            let cooled = self.cooldown_until.is_some_and(|until| now >= until);
            if cooled && value < self.threshold {
                info!(kind = %self.kind, value, "breaker reset");
                self.tripped = false;
                self.cooldown_until = None;
            }
        } else if value >= self.threshold {
            warn!(kind = %self.kind, value, threshold = self.threshold, "breaker tripped");
            self.tripped = true;
            self.cooldown_until = Some(now + self.cooldown);
        }
    }
}

/// Point-in-time view of account risk, owned by the governor.
///
/// Copied out on every read; replaced whole on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub consecutive_losses: u32,
    pub exposure_pct: f64,
    pub breaker_states: Vec<(BreakerKind, bool)>,
}

/// A desired resting order at one grid level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedOrder {
    pub price: f64,
    pub side: Side,
    pub size: Money,
}

impl PlannedOrder {
    pub fn notional(&self) -> f64 {
        (self.size * Money::from_f64(self.price)).to_f64()
    }
}

/// Cycle output proposed to the governor: orders to place, levels to retire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposedPlan {
    pub places: Vec<PlannedOrder>,
    /// Level prices whose working orders should be cancelled
    pub cancels: Vec<f64>,
}

impl ProposedPlan {
    pub fn is_empty(&self) -> bool {
        self.places.is_empty() && self.cancels.is_empty()
    }
}

/// Plan that cleared every risk layer, possibly scaled or thinned
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovedPlan {
    pub places: Vec<PlannedOrder>,
    pub cancels: Vec<f64>,
    /// Multiplier applied to every place size (1.0 unless soft-stopped)
    pub scale: f64,
    /// Level prices whose allocations the exposure layer rejected
    pub rejected_levels: Vec<f64>,
}

/// Why new entries were refused this cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VetoReason {
    HardStop { drawdown_pct: f64 },
    LossStreak { count: u32 },
}

impl std::fmt::Display for VetoReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VetoReason::HardStop { drawdown_pct } => {
                write!(f, "hard stop: drawdown {:.1}%", drawdown_pct * 100.0)
            }
            VetoReason::LossStreak { count } => {
                write!(f, "loss streak: {} consecutive losses", count)
            }
        }
    }
}

/// Outcome of a governor evaluation
#[derive(Debug, Clone)]
pub enum RiskVerdict {
    Approved(ApprovedPlan),
    /// New entries refused; `allowed` keeps only risk-reducing actions
    /// (cancels), so positions can still be unwound
    Veto {
        reason: VetoReason,
        allowed: ApprovedPlan,
    },
    /// Full liquidation intent, escalated to the execution collaborator
    EmergencyFlatten { reason: String },
}

#[derive(Debug)]
struct GovernorState {
    equity: f64,
    peak_equity: f64,
    consecutive_losses: u32,
    exposure_pct: f64,
    last_range_width: Option<f64>,
    drawdown_breaker: CircuitBreaker,
    loss_breaker: CircuitBreaker,
    exposure_breaker: CircuitBreaker,
    volatility_breaker: CircuitBreaker,
    emergency: Option<String>,
}

impl GovernorState {
    fn drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
    }

    fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            equity: self.equity,
            peak_equity: self.peak_equity,
            drawdown_pct: self.drawdown_pct(),
            consecutive_losses: self.consecutive_losses,
            exposure_pct: self.exposure_pct,
            breaker_states: vec![
                (BreakerKind::Drawdown, self.drawdown_breaker.tripped),
                (BreakerKind::LossStreak, self.loss_breaker.tripped),
                (BreakerKind::Exposure, self.exposure_breaker.tripped),
                (BreakerKind::VolatilitySpike, self.volatility_breaker.tripped),
            ],
        }
    }
}

/// Layered risk state machine with process-wide lifetime.
///
/// Single writer: every mutation happens under the write lock and replaces
/// the affected state wholesale, so an `evaluate` running concurrently with
/// a fill sees either the pre-fill or post-fill snapshot, never a partial
/// update.
#[derive(Debug)]
pub struct RiskGovernor {
    config: RiskConfig,
    state: RwLock<GovernorState>,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig, initial_equity: f64) -> Self {
        let cooldown = Duration::seconds(config.cooldown_secs);
        let state = GovernorState {
            equity: initial_equity,
            peak_equity: initial_equity,
            consecutive_losses: 0,
            exposure_pct: 0.0,
            last_range_width: None,
            drawdown_breaker: CircuitBreaker::new(
                BreakerKind::Drawdown,
                config.hard_stop_drawdown,
                cooldown,
            ),
            loss_breaker: CircuitBreaker::new(
                BreakerKind::LossStreak,
                config.loss_streak_limit as f64,
                cooldown,
            ),
            exposure_breaker: CircuitBreaker::new(
                BreakerKind::Exposure,
                config.max_exposure_pct,
                cooldown,
            ),
            volatility_breaker: CircuitBreaker::new(
                BreakerKind::VolatilitySpike,
                config.volatility_spike_threshold,
                cooldown,
            ),
            emergency: None,
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    /// Copy-on-read view of the current risk state
    pub fn snapshot(&self) -> RiskSnapshot {
        self.state.read().unwrap().snapshot()
    }

    /// Apply an account refresh (equity and open exposure)
    pub fn update_account(&self, equity: f64, exposure_pct: f64, now: DateTime<Utc>) {
        let mut state = self.state.write().unwrap();
        state.equity = equity;
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        state.exposure_pct = exposure_pct;
        let drawdown = state.drawdown_pct();
        state.drawdown_breaker.observe(drawdown, now);
        state.exposure_breaker.observe(exposure_pct, now);
    }

    /// Apply one settled round trip; negative pnl extends the loss streak
    pub fn record_settlement(&self, pnl: Money, now: DateTime<Utc>) {
        let mut state = self.state.write().unwrap();
        if pnl < Money::ZERO {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
        let streak = state.consecutive_losses as f64;
        state.loss_breaker.observe(streak, now);
    }

    /// Feed the relative range width of the latest cycle; a sudden widening
    /// is the volatility-spike emergency condition
    pub fn observe_range_width(&self, relative_width: f64, now: DateTime<Utc>) {
        let mut state = self.state.write().unwrap();
        if let Some(prev) = state.last_range_width {
            if prev > 0.0 {
                let widening = relative_width / prev - 1.0;
                state.volatility_breaker.observe(widening, now);
            }
        }
        state.last_range_width = Some(relative_width);
    }

    /// Catastrophic condition reported by a collaborator
    /// (e.g. connectivity loss)
    pub fn report_emergency(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "emergency reported to risk governor");
        self.state.write().unwrap().emergency = Some(reason);
    }

    /// Manual all-clear after an emergency, operator-driven
    pub fn clear_emergency(&self) {
        self.state.write().unwrap().emergency = None;
    }

    /// Run the proposed plan through every layer, least to most severe.
    ///
    /// The most severe tripped layer decides the verdict; lighter layers
    /// still shape the surviving plan (soft-stop scaling, per-allocation
    /// exposure rejection).
    pub fn evaluate(&self, plan: &ProposedPlan) -> RiskVerdict {
        // Copy-on-read: one consistent view for the whole evaluation
        let (snapshot, emergency, loss_tripped, drawdown_latched, volatility_spike) = {
            let state = self.state.read().unwrap();
            (
                state.snapshot(),
                state.emergency.clone(),
                state.loss_breaker.tripped,
                state.drawdown_breaker.tripped,
                state.volatility_breaker.tripped,
            )
        };

        // Layer 1 (least severe): soft-stop scales new allocations
        let soft_stopped = snapshot.drawdown_pct >= self.config.soft_stop_drawdown;
        let scale = if soft_stopped {
            self.config.soft_stop_scale
        } else {
            1.0
        };

        // Layer 2: exposure cap rejects the breaching allocations only
        let mut places = Vec::with_capacity(plan.places.len());
        let mut rejected_levels = Vec::new();
        let mut running_exposure = snapshot.exposure_pct;
        for order in &plan.places {
            let scaled = PlannedOrder {
                price: order.price,
                side: order.side,
                size: order.size * Money::from_f64(scale),
            };
            let added = if snapshot.equity > 0.0 {
                scaled.notional() / snapshot.equity
            } else {
                f64::INFINITY
            };
            if running_exposure + added > self.config.max_exposure_pct {
                warn!(
                    price = order.price,
                    "exposure cap: rejecting allocation ({:.1}% + {:.1}% > {:.1}%)",
                    running_exposure * 100.0,
                    added * 100.0,
                    self.config.max_exposure_pct * 100.0
                );
                rejected_levels.push(order.price);
            } else {
                running_exposure += added;
                places.push(scaled);
            }
        }

        // Layer 3: consecutive-loss breaker pauses new entries.
        // Layer 4: hard-stop vetoes new entries outright.
        let hard_stopped =
            drawdown_latched || snapshot.drawdown_pct >= self.config.hard_stop_drawdown;

        // Layer 5 (most severe): emergency flatten
        if let Some(reason) = emergency {
            return RiskVerdict::EmergencyFlatten { reason };
        }
        if volatility_spike {
            return RiskVerdict::EmergencyFlatten {
                reason: "volatility spike".to_string(),
            };
        }
        if hard_stopped {
            return RiskVerdict::Veto {
                reason: VetoReason::HardStop {
                    drawdown_pct: snapshot.drawdown_pct,
                },
                allowed: ApprovedPlan {
                    places: Vec::new(),
                    cancels: plan.cancels.clone(),
                    scale: 0.0,
                    rejected_levels: Vec::new(),
                },
            };
        }
        if loss_tripped {
            return RiskVerdict::Veto {
                reason: VetoReason::LossStreak {
                    count: snapshot.consecutive_losses,
                },
                allowed: ApprovedPlan {
                    places: Vec::new(),
                    cancels: plan.cancels.clone(),
                    scale: 0.0,
                    rejected_levels: Vec::new(),
                },
            };
        }

        RiskVerdict::Approved(ApprovedPlan {
            places,
            cancels: plan.cancels.clone(),
            scale,
            rejected_levels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default(), 100_000.0)
    }

    fn plan_with_places(n: usize, price: f64, size: f64) -> ProposedPlan {
        ProposedPlan {
            places: (0..n)
                .map(|i| PlannedOrder {
                    price: price + i as f64,
                    side: Side::Buy,
                    size: Money::from_f64(size),
                })
                .collect(),
            cancels: vec![],
        }
    }

    #[test]
    fn test_clean_state_approves_full_plan() {
        let gov = governor();
        // 4 levels x 90 units @ ~100 = ~36k notional on 100k equity
        let plan = plan_with_places(4, 100.0, 90.0);
        match gov.evaluate(&plan) {
            RiskVerdict::Approved(approved) => {
                assert_eq!(approved.places.len(), 4);
                assert_eq!(approved.scale, 1.0);
                assert!(approved.rejected_levels.is_empty());
            }
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[test]
    fn test_soft_stop_scales_by_half() {
        let gov = governor();
        gov.update_account(88_000.0, 0.0, t(0)); // 12% drawdown
        let plan = plan_with_places(2, 100.0, 10.0);
        match gov.evaluate(&plan) {
            RiskVerdict::Approved(approved) => {
                assert_eq!(approved.scale, 0.5);
                assert_eq!(approved.places[0].size, Money::from_f64(5.0));
            }
            other => panic!("expected scaled approval, got {:?}", other),
        }
    }

    #[test]
    fn test_hard_stop_vetoes_but_allows_cancels() {
        let gov = governor();
        gov.update_account(65_000.0, 0.0, t(0)); // 35% drawdown
        let mut plan = plan_with_places(2, 100.0, 10.0);
        plan.cancels = vec![95.0, 105.0];
        match gov.evaluate(&plan) {
            RiskVerdict::Veto { reason, allowed } => {
                assert!(matches!(reason, VetoReason::HardStop { .. }));
                assert!(allowed.places.is_empty());
                assert_eq!(allowed.cancels, vec![95.0, 105.0]);
            }
            other => panic!("expected veto, got {:?}", other),
        }
    }

    #[test]
    fn test_hard_stop_supersedes_soft_stop() {
        let gov = governor();
        gov.update_account(98_000.0, 0.0, t(0)); // 2%: clean
        match gov.evaluate(&plan_with_places(1, 100.0, 1.0)) {
            RiskVerdict::Approved(a) => assert_eq!(a.scale, 1.0),
            other => panic!("expected approval, got {:?}", other),
        }
        // Flash event: 2% -> 35% between cycles
        gov.update_account(65_000.0, 0.0, t(2));
        match gov.evaluate(&plan_with_places(1, 100.0, 1.0)) {
            RiskVerdict::Veto { reason, .. } => {
                assert!(matches!(reason, VetoReason::HardStop { .. }))
            }
            other => panic!("hard stop must supersede soft stop, got {:?}", other),
        }
    }

    #[test]
    fn test_three_losses_trip_the_streak_breaker() {
        let gov = governor();
        for i in 0..3 {
            gov.record_settlement(Money::from_f64(-50.0), t(i));
        }
        match gov.evaluate(&plan_with_places(3, 100.0, 1.0)) {
            RiskVerdict::Veto { reason, .. } => {
                assert_eq!(reason, VetoReason::LossStreak { count: 3 });
            }
            other => panic!("expected loss-streak veto, got {:?}", other),
        }
    }

    #[test]
    fn test_loss_breaker_hysteresis() {
        let cooldown = RiskConfig::default().cooldown_secs;
        let gov = governor();
        for i in 0..3 {
            gov.record_settlement(Money::from_f64(-50.0), t(i));
        }
        // A win resets the streak, but the breaker holds through cooldown
        gov.record_settlement(Money::from_f64(10.0), t(5));
        assert!(matches!(
            gov.evaluate(&plan_with_places(1, 100.0, 1.0)),
            RiskVerdict::Veto { .. }
        ));

        // After cooldown with the condition clear, a fresh observation resets
        gov.record_settlement(Money::from_f64(10.0), t(cooldown + 10));
        assert!(matches!(
            gov.evaluate(&plan_with_places(1, 100.0, 1.0)),
            RiskVerdict::Approved(_)
        ));
    }

    #[test]
    fn test_breaker_stays_tripped_during_cooldown() {
        let mut breaker =
            CircuitBreaker::new(BreakerKind::Drawdown, 0.20, Duration::seconds(600));
        breaker.observe(0.25, t(0));
        assert!(breaker.tripped);

        // Metric recovers instantly; breaker must not follow
        breaker.observe(0.0, t(1));
        assert!(breaker.tripped);
        breaker.observe(0.0, t(599));
        assert!(breaker.tripped);

        // Cooldown elapsed and condition clear: reset
        breaker.observe(0.0, t(601));
        assert!(!breaker.tripped);
    }

    #[test]
    fn test_breaker_needs_both_cooldown_and_recovery() {
        let mut breaker =
            CircuitBreaker::new(BreakerKind::Drawdown, 0.20, Duration::seconds(600));
        breaker.observe(0.25, t(0));
        // Cooldown elapsed but condition still holds: stays tripped
        breaker.observe(0.30, t(700));
        assert!(breaker.tripped);
        breaker.observe(0.10, t(701));
        assert!(!breaker.tripped);
    }

    #[test]
    fn test_exposure_rejects_breaching_allocation_only() {
        let gov = governor();
        // Each place is 15% of equity; the third breaches the 40% cap
        let plan = plan_with_places(3, 100.0, 150.0);
        match gov.evaluate(&plan) {
            RiskVerdict::Approved(approved) => {
                assert_eq!(approved.places.len(), 2);
                assert_eq!(approved.rejected_levels.len(), 1);
            }
            other => panic!("expected partial approval, got {:?}", other),
        }
    }

    #[test]
    fn test_reported_emergency_flattens() {
        let gov = governor();
        gov.report_emergency("connectivity lost");
        match gov.evaluate(&plan_with_places(1, 100.0, 1.0)) {
            RiskVerdict::EmergencyFlatten { reason } => {
                assert_eq!(reason, "connectivity lost");
            }
            other => panic!("expected flatten, got {:?}", other),
        }
    }

    #[test]
    fn test_volatility_spike_flattens() {
        let gov = governor();
        gov.observe_range_width(0.02, t(0));
        gov.observe_range_width(0.06, t(60)); // range tripled
        assert!(matches!(
            gov.evaluate(&plan_with_places(1, 100.0, 1.0)),
            RiskVerdict::EmergencyFlatten { .. }
        ));
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let gov = governor();
        gov.update_account(90_000.0, 0.25, t(0));
        gov.record_settlement(Money::from_f64(-10.0), t(1));
        let snap = gov.snapshot();
        assert_eq!(snap.equity, 90_000.0);
        assert_eq!(snap.peak_equity, 100_000.0);
        assert!((snap.drawdown_pct - 0.10).abs() < 1e-12);
        assert_eq!(snap.consecutive_losses, 1);
        assert_eq!(snap.exposure_pct, 0.25);
    }
}
