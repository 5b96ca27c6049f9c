mod config;
mod database;
mod error;
mod features;
mod feedback;
mod ml;
mod pipeline;
mod prediction;
mod types;
mod web;

#[cfg(test)]
mod test_support;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::Settings;
use ml::TrainingMode;
use pipeline::{Pipeline, RunSummary, TickerSelection};
use types::{NewsSentiment, PriceBar};
use web::{start_api_server, AppState};

#[derive(Parser)]
#[command(name = "signal-pipeline")]
#[command(version)]
#[command(about = "Daily feature, training, prediction and feedback pipeline for equity signals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML) layered over the built-in defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Priority,
    Full,
}

impl From<ModeArg> for TrainingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Priority => TrainingMode::PrioritySignals,
            ModeArg::Full => TrainingMode::FullBatch,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build feature windows
    BuildFeatures {
        /// Tickers to build (default: whole universe)
        #[arg(short, long, value_delimiter = ',')]
        tickers: Vec<String>,
        /// As-of date (YYYY-MM-DD, default: today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Train candidate models and promote improvements
    Train {
        #[arg(short, long, value_enum, default_value = "full")]
        mode: ModeArg,
    },
    /// Score tickers with the promoted models
    Predict {
        #[arg(short, long, value_delimiter = ',')]
        tickers: Vec<String>,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Compare past predictions with realized prices
    Validate {
        /// Sessions ahead to measure the outcome (default from settings)
        #[arg(long)]
        horizon: Option<usize>,
        /// Validation date (default: today)
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Compute feedback metrics, retrain signals and threshold recommendations
    Feedback {
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Run build, train (when due), predict, validate and feedback in order
    Cycle {
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Show latest runs, active snapshot and accuracy digest
    Status,
    /// Serve the read-only status API
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Print the effective settings
    Settings,
    /// Load canonical daily bars from a JSON array file
    ImportPrices {
        file: PathBuf,
    },
    /// Load daily news sentiment aggregates from a JSON array file
    ImportSentiment {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Settings => {
            print!("{}", settings.render()?);
        }
        Commands::Status => {
            let pipeline = Pipeline::open(settings).await?;
            let state = AppState::new(pipeline.database(), pipeline.settings().clone());
            print_json(&state.status(today).await?)?;
        }
        Commands::Serve { port } => {
            let pipeline = Pipeline::open(settings).await?;
            let state = AppState::new(pipeline.database(), pipeline.settings().clone());
            start_api_server(state, port).await?;
        }
        Commands::ImportPrices { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let bars: Vec<PriceBar> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
            let pipeline = Pipeline::open(settings).await?;
            let written = pipeline.import_prices(&bars).await?;
            info!("Imported {} bars from {}", written, file.display());
        }
        Commands::ImportSentiment { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let rows: Vec<NewsSentiment> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
            let pipeline = Pipeline::open(settings).await?;
            let written = pipeline.import_sentiment(&rows).await?;
            info!("Imported {} sentiment rows from {}", written, file.display());
        }
        Commands::BuildFeatures { tickers, as_of } => {
            let pipeline = Pipeline::open(settings).await?;
            let summary = pipeline
                .run_feature_build(selection(tickers), as_of.unwrap_or(today))
                .await?;
            report(&summary)?;
        }
        Commands::Train { mode } => {
            let pipeline = Pipeline::open(settings).await?;
            report(&pipeline.run_training(mode.into()).await?)?;
        }
        Commands::Predict { tickers, as_of } => {
            let pipeline = Pipeline::open(settings).await?;
            let summary = pipeline
                .run_prediction(selection(tickers), as_of.unwrap_or(today))
                .await?;
            report(&summary)?;
        }
        Commands::Validate { horizon, today: date } => {
            let pipeline = Pipeline::open(settings).await?;
            report(&pipeline.run_validation(horizon, date.unwrap_or(today)).await?)?;
        }
        Commands::Feedback { as_of } => {
            let pipeline = Pipeline::open(settings).await?;
            report(&pipeline.run_feedback(as_of.unwrap_or(today)).await?)?;
        }
        Commands::Cycle { as_of } => {
            let pipeline = Pipeline::open(settings).await?;
            report(&pipeline.run_cycle(as_of.unwrap_or(today)).await?)?;
        }
    }

    Ok(())
}

fn selection(tickers: Vec<String>) -> TickerSelection {
    if tickers.is_empty() {
        TickerSelection::All
    } else {
        TickerSelection::Only(tickers)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the summary and turn a failed run into a non-zero exit
fn report(summary: &RunSummary) -> Result<()> {
    print_json(summary)?;
    if summary.status.is_failed() {
        error!(
            "{} run {} failed: {}",
            summary.stage,
            summary.run_id,
            summary.error.as_deref().unwrap_or("unknown error")
        );
        bail!("{} run failed", summary.stage);
    }
    info!(
        "{} run {} finished with status {} ({} warnings)",
        summary.stage,
        summary.run_id,
        summary.status.as_str(),
        summary.warnings.len()
    );
    Ok(())
}
