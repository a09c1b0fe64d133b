//! Simulate command implementation
//!
//! Replays a CSV history through the engine with a paper account, acting as
//! a reference host: it pushes samples and account updates in, runs cycles
//! on a fixed sample interval, simulates resting-order fills, and feeds the
//! results back through the engine's notification entry points.

use anyhow::Result;
use tracing::{debug, info, warn};

use adaptive_grid::engine::{AccountUpdate, CycleResult, FillEvent, FillKind, GridEngine};
use adaptive_grid::types::{Money, PriceSample, Side};
use adaptive_grid::{data, Config};

/// Paper account: long-only inventory at average cost
struct PaperAccount {
    cash: f64,
    inventory: f64,
    avg_cost: f64,
}

impl PaperAccount {
    fn new(capital: f64) -> Self {
        Self {
            cash: capital,
            inventory: 0.0,
            avg_cost: 0.0,
        }
    }

    fn equity(&self, price: f64) -> f64 {
        self.cash + self.inventory * price
    }

    fn exposure_pct(&self, price: f64) -> f64 {
        let equity = self.equity(price);
        if equity > 0.0 {
            (self.inventory * price / equity).max(0.0)
        } else {
            0.0
        }
    }

    /// Execute a buy; quantity is clamped to available cash
    fn fill_buy(&mut self, price: f64, quantity: f64) -> f64 {
        let quantity = if price > 0.0 {
            quantity.min(self.cash / price)
        } else {
            0.0
        };
        if quantity <= 0.0 {
            return 0.0;
        }
        let new_inventory = self.inventory + quantity;
        self.avg_cost = (self.avg_cost * self.inventory + price * quantity) / new_inventory;
        self.inventory = new_inventory;
        self.cash -= price * quantity;
        quantity
    }

    /// Execute a sell against inventory; returns (quantity, realized pnl)
    fn fill_sell(&mut self, price: f64, quantity: f64) -> (f64, f64) {
        let quantity = quantity.min(self.inventory);
        if quantity <= 0.0 {
            return (0.0, 0.0);
        }
        let pnl = (price - self.avg_cost) * quantity;
        self.inventory -= quantity;
        self.cash += price * quantity;
        if self.inventory <= 0.0 {
            self.avg_cost = 0.0;
        }
        (quantity, pnl)
    }
}

/// A simulated resting order
struct RestingOrder {
    price: f64,
    side: Side,
    quantity: f64,
    order_id: String,
}

pub fn run(
    config_path: Option<String>,
    data_path: String,
    capital: f64,
    cycle_every: usize,
) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(&path)?
        }
        None => Config::default(),
    };

    let samples = data::load_csv(&data_path)?;
    anyhow::ensure!(!samples.is_empty(), "No samples in {}", data_path);
    anyhow::ensure!(cycle_every > 0, "cycle interval must be positive");

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(simulate(config, samples, capital, cycle_every))
}

async fn simulate(
    config: Config,
    samples: Vec<PriceSample>,
    capital: f64,
    cycle_every: usize,
) -> Result<()> {
    let engine = GridEngine::new(config, capital);
    let mut account = PaperAccount::new(capital);
    let mut resting: Vec<RestingOrder> = Vec::new();
    let mut order_seq: u64 = 0;

    let mut cycles = 0usize;
    let mut approved = 0usize;
    let mut vetoed = 0usize;
    let mut skipped = 0usize;
    let mut flattens = 0usize;
    let mut fills = 0usize;

    info!(
        "Simulating {} samples, cycle every {} samples, capital {:.2}",
        samples.len(),
        cycle_every,
        capital
    );

    for (i, sample) in samples.iter().enumerate() {
        // Match resting orders against the new print
        let mut kept = Vec::with_capacity(resting.len());
        for order in resting.drain(..) {
            let crossed = match order.side {
                Side::Buy => sample.price <= order.price,
                Side::Sell => sample.price >= order.price,
            };
            if !crossed {
                kept.push(order);
                continue;
            }
            let realized_pnl = match order.side {
                Side::Buy => {
                    account.fill_buy(order.price, order.quantity);
                    None
                }
                Side::Sell => {
                    let (_, pnl) = account.fill_sell(order.price, order.quantity);
                    Some(Money::from_f64(pnl))
                }
            };
            fills += 1;
            engine.on_fill(FillEvent {
                level_price: order.price,
                order_id: order.order_id,
                kind: FillKind::Filled,
                realized_pnl,
            });
        }
        resting = kept;

        engine.on_sample(*sample);

        if (i + 1) % cycle_every != 0 {
            continue;
        }

        engine.on_account_update(AccountUpdate {
            equity: account.equity(sample.price),
            exposure_pct: account.exposure_pct(sample.price),
        });

        cycles += 1;
        match engine.run_cycle().await {
            CycleResult::Approved(plan) => {
                approved += 1;
                for cancel_price in &plan.cancels {
                    resting.retain(|o| {
                        if o.price == *cancel_price {
                            engine.on_fill(FillEvent {
                                level_price: o.price,
                                order_id: o.order_id.clone(),
                                kind: FillKind::Cancelled,
                                realized_pnl: None,
                            });
                            false
                        } else {
                            true
                        }
                    });
                }
                for place in &plan.places {
                    order_seq += 1;
                    resting.push(RestingOrder {
                        price: place.price,
                        side: place.side,
                        quantity: place.size.to_f64(),
                        order_id: format!("sim-{}", order_seq),
                    });
                    engine.on_order_placed(place.price);
                }
                debug!(
                    sample = i,
                    places = plan.places.len(),
                    cancels = plan.cancels.len(),
                    "plan executed"
                );
            }
            CycleResult::Vetoed { reason, allowed } => {
                vetoed += 1;
                // New entries are refused, but retirements still execute
                for cancel_price in &allowed.cancels {
                    resting.retain(|o| {
                        if o.price == *cancel_price {
                            engine.on_fill(FillEvent {
                                level_price: o.price,
                                order_id: o.order_id.clone(),
                                kind: FillKind::Cancelled,
                                realized_pnl: None,
                            });
                            false
                        } else {
                            true
                        }
                    });
                }
                debug!(
                    sample = i,
                    %reason,
                    cancels = allowed.cancels.len(),
                    "cycle vetoed"
                );
            }
            CycleResult::Skipped(reason) => {
                skipped += 1;
                debug!(sample = i, %reason, "cycle skipped");
            }
            CycleResult::EmergencyFlatten { reason } => {
                flattens += 1;
                warn!(sample = i, %reason, "flattening paper account");
                for order in resting.drain(..) {
                    engine.on_fill(FillEvent {
                        level_price: order.price,
                        order_id: order.order_id,
                        kind: FillKind::Cancelled,
                        realized_pnl: None,
                    });
                }
                if account.inventory > 0.0 {
                    let inventory = account.inventory;
                    let (_, pnl) = account.fill_sell(sample.price, inventory);
                    info!(pnl, "inventory liquidated");
                }
                engine.clear_emergency();
            }
        }
    }

    let last_price = samples[samples.len() - 1].price;
    let final_equity = account.equity(last_price);
    let snapshot = engine.risk_snapshot();

    println!("\n{}", "=".repeat(60));
    println!("SIMULATION RESULTS");
    println!("{}", "=".repeat(60));
    println!("Samples:            {}", samples.len());
    println!("Cycles:             {}", cycles);
    println!("  approved:         {}", approved);
    println!("  vetoed:           {}", vetoed);
    println!("  skipped:          {}", skipped);
    println!("  flattens:         {}", flattens);
    println!("Fills:              {}", fills);
    println!("Initial capital:    {:.2}", capital);
    println!("Final equity:       {:.2}", final_equity);
    println!(
        "Return:             {:.2}%",
        (final_equity / capital - 1.0) * 100.0
    );
    println!("Final drawdown:     {:.2}%", snapshot.drawdown_pct * 100.0);
    println!("Final regime:       {}", engine.regime_state().regime);
    println!("{}", "=".repeat(60));

    Ok(())
}
