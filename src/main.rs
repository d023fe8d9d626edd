//! CLI entry point for the transit ingestion pipeline.
//!
//! `run` starts the full pipeline (both sources, aggregation, persistence,
//! bus) until interrupted; `recent` and `health` are read-only queries
//! against the relational store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_pipeline::config::{self, Settings};
use transit_pipeline::orchestrator::Pipeline;
use transit_pipeline::storage::PersistenceGateway;

#[derive(Parser)]
#[command(name = "transit-pipeline")]
#[command(about = "Real-time transit data ingestion and aggregation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline until interrupted
    Run,
    /// Show the most recently stored predictions
    Recent {
        /// Maximum rows to print
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Show the stored-side service health summary
    Health {
        /// Trailing window, in hours
        #[arg(long, default_value_t = 1)]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/transit_pipeline.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_pipeline.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run().await?,
        Commands::Recent { limit } => {
            let gateway = PersistenceGateway::connect(&config::database_url_from_env()).await?;
            let rows = gateway.recent_predictions(limit).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Health { hours } => {
            let gateway = PersistenceGateway::connect(&config::database_url_from_env()).await?;
            let summary = gateway.service_health_summary(hours).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

#[tracing::instrument(skip_all)]
async fn run() -> Result<()> {
    let settings = Settings::from_env()?;
    info!(
        poll_interval_secs = settings.poll_interval.as_secs(),
        rate_limit_per_minute = settings.rate_limit_per_minute,
        "starting pipeline"
    );

    let pipeline = Pipeline::start(&settings).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");

    let report = pipeline.service_summary().await;
    info!(
        score = report.score,
        status = report.status.as_str(),
        total_predictions = report.health.total_predictions,
        anomalies = report.anomalies.anomalies.len(),
        "final service summary"
    );

    pipeline.shutdown().await?;
    Ok(())
}
