//! Data loading
//!
//! Loads price/volume history from CSV files for the CLI harness. Accepts
//! either a three-column (timestamp, price, volume) layout or a standard
//! OHLCV export, in which case close and volume are taken.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

use crate::types::PriceSample;

/// Load price samples from a CSV file
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<PriceSample>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut samples = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing timestamp column")?;
        let timestamp = parse_timestamp(dt_str)
            .context(format!("Failed to parse timestamp: {}", dt_str))?;

        // 3 columns: timestamp,price,volume. 6 columns: OHLCV, take close.
        let (price_idx, volume_idx) = if record.len() >= 6 { (4, 5) } else { (1, 2) };

        let price: f64 = record
            .get(price_idx)
            .context("Missing price column")?
            .parse()
            .context("Failed to parse price")?;
        let volume: f64 = record
            .get(volume_idx)
            .map(|v| v.parse().unwrap_or(0.0))
            .unwrap_or(0.0);

        let sample = PriceSample::new(timestamp, price, volume)
            .map_err(|e| anyhow::anyhow!("Row {}: {}", row_idx + 1, e))?;
        samples.push(sample);
    }

    info!(
        "Loaded {} samples from {}",
        samples.len(),
        path.as_ref().display()
    );
    Ok(samples)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
    }
    // Unix seconds or milliseconds
    let raw: i64 = s.parse().context("unrecognized timestamp format")?;
    let (secs, millis) = if raw > 10_000_000_000 {
        (raw / 1000, raw % 1000)
    } else {
        (raw, 0)
    };
    DateTime::from_timestamp(secs, millis as u32 * 1_000_000)
        .context("timestamp out of range")
}
