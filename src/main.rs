//! Adaptive grid trading core - main entry point
//!
//! This binary provides two subcommands:
//! - simulate: Replay a CSV history through the engine with a paper account
//! - range: Print the range estimate for a CSV history

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "adaptive-grid")]
#[command(about = "Regime-aware adaptive grid trading core", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a CSV history through the decision engine
    Simulate {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// Path to the CSV price history
        #[arg(short, long)]
        data: String,

        /// Initial paper capital
        #[arg(long, default_value = "100000")]
        capital: f64,

        /// Run a decision cycle every N samples
        #[arg(long, default_value = "25")]
        cycle_every: usize,
    },

    /// Estimate the probable trading range for a CSV history
    Range {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// Path to the CSV price history
        #[arg(short, long)]
        data: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Simulate { .. } => "simulate",
        Commands::Range { .. } => "range",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Simulate {
            config,
            data,
            capital,
            cycle_every,
        } => commands::simulate::run(config, data, capital, cycle_every),

        Commands::Range { config, data } => commands::range::run(config, data),
    }
}
