//! Range command implementation
//!
//! One-shot range estimate over a CSV history, printed as a report.

use adaptive_grid::range::RangeEstimator;
use adaptive_grid::{data, Config};
use anyhow::Result;
use tracing::info;

pub fn run(config_path: Option<String>, data_path: String) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(&path)?
        }
        None => Config::default(),
    };

    let samples = data::load_csv(&data_path)?;
    info!("Estimating range over {} samples", samples.len());

    let estimator = RangeEstimator::new(config.estimator.clone());
    let analysis = estimator.estimate(&samples)?;
    let est = analysis.estimate;

    println!("\n{}", "=".repeat(60));
    println!("RANGE ESTIMATE");
    println!("{}", "=".repeat(60));
    println!("Samples:         {}", samples.len());
    println!("Lower bound:     {:.4}", est.lower_bound);
    println!("Upper bound:     {:.4}", est.upper_bound);
    println!("Width:           {:.4} ({:.2}%)", est.width(), est.relative_width() * 100.0);
    println!("Mode price:      {:.4}", analysis.profile.mode_price());
    println!("Confidence:      {:.2}%", est.confidence * 100.0);
    println!("Estimated at:    {}", est.estimated_at);
    println!("{}", "=".repeat(60));

    Ok(())
}
