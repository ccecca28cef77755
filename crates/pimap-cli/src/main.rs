//! PIMAP CLI - Command Line Interface
//!
//! Command-line tool for running the Store + Analyze engine over PIMAP
//! formatted data and inspecting what it stored.
//!
//! Key Features:
//! - Ingest PIMAP samples from a file or stdin
//! - Query stored samples and metrics by time range
//! - Export metrics as JSON records or PIMAP metric data
//! - Configuration validation
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use clap::{Parser, Subcommand, ValueEnum};
use pimap_analyze::MetricRegistry;
use pimap_common::{
    MetricId, MetricRecord, PimapError, PipelineConfig, Result, ScopeId, StreamId, Timestamp,
};
use pimap_pipeline::{Datum, Pipeline};
use pimap_storage::{MetricStore, SampleStore};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Parser)]
#[command(name = "pimap")]
#[command(author = "PIMAP Development Team")]
#[command(version = "0.1.0")]
#[command(about = "PIMAP Store + Analyze", long_about = None)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, default_value = "pimap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store samples and compute metrics for PIMAP data
    Ingest {
        /// Input file, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
        /// Close every window of the ingested streams at end of input
        #[arg(long)]
        finish: bool,
    },
    /// Print stored samples of a stream
    Samples {
        #[arg(short, long)]
        stream: String,
        /// Range start, epoch seconds
        #[arg(long)]
        start: Option<f64>,
        /// Range end (exclusive), epoch seconds
        #[arg(long)]
        end: Option<f64>,
    },
    /// Print stored metrics of a scope
    Metrics {
        #[arg(short, long)]
        metric: String,
        #[arg(short, long)]
        scope: String,
        #[arg(long)]
        start: Option<f64>,
        #[arg(long)]
        end: Option<f64>,
        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Validate the configuration file and print it
    CheckConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Pimap,
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(class = ?err.class(), "{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Ingest { input, finish } => ingest(config, &input, finish).await,
        Commands::Samples { stream, start, end } => {
            let store = SampleStore::open(&config.storage)?;
            let (start, end) = range(start, end)?;
            for sample in store.read_range(&StreamId::new(stream), start, end) {
                println!("{}", to_json(&sample)?);
            }
            Ok(())
        }
        Commands::Metrics {
            metric,
            scope,
            start,
            end,
            format,
        } => {
            let store = MetricStore::open(&config.storage)?;
            let (start, end) = range(start, end)?;
            let records =
                store.read_range(&MetricId::new(metric), &ScopeId::new(scope), start, end);
            print_metrics(&records, format)
        }
        Commands::CheckConfig => {
            println!("{}", to_json(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    if path.exists() {
        PipelineConfig::from_file(path)
    } else {
        tracing::warn!(
            path = %path.display(),
            "config file not found, running in-memory with defaults"
        );
        Ok(PipelineConfig::in_memory())
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn ingest(config: PipelineConfig, input: &str, finish: bool) -> Result<()> {
    let text = read_input(input)?;
    let pipeline = Pipeline::open(config, Arc::new(MetricRegistry::new())).await?;

    let mut streams = BTreeSet::new();
    let mut rejected = 0usize;
    for parsed in Datum::parse_all(&text) {
        let submitted = parsed
            .and_then(|datum| datum.to_sample())
            .and_then(|sample| {
                let stream = sample.stream_id.clone();
                pipeline.submit_sample(sample)?;
                Ok(stream)
            });
        match submitted {
            Ok(stream) => {
                streams.insert(stream);
            }
            Err(err) => {
                rejected += 1;
                tracing::warn!(error = %err, "datum rejected");
            }
        }
    }

    if finish {
        for stream in &streams {
            pipeline.finish_stream(stream)?;
        }
    }
    pipeline.wait_idle().await;

    let stats = pipeline.stats();
    pipeline.shutdown().await?;
    tracing::info!(streams = streams.len(), rejected, "ingest complete");
    println!("{}", to_json(&stats)?);
    Ok(())
}

fn print_metrics(records: &[MetricRecord], format: Format) -> Result<()> {
    for record in records {
        match (format, record) {
            (Format::Json, record) => println!("{}", to_json(record)?),
            (Format::Pimap, MetricRecord::Computed(metric)) => {
                println!("{}", Datum::from_metric(metric).encode())
            }
            (Format::Pimap, MetricRecord::Failed(failure)) => {
                tracing::warn!(
                    metric = %failure.metric_id,
                    window_start = %failure.window_start,
                    error = %failure.error,
                    "skipping failed metric"
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        Ok(std::fs::read_to_string(input)?)
    }
}

fn range(start: Option<f64>, end: Option<f64>) -> Result<(Timestamp, Timestamp)> {
    let convert = |secs: Option<f64>, default: Timestamp| match secs {
        None => Ok(default),
        Some(secs) => Timestamp::from_secs_f64(secs)
            .ok_or_else(|| PimapError::Configuration(format!("invalid time {}", secs))),
    };
    Ok((
        convert(start, Timestamp::MIN)?,
        convert(end, Timestamp::MAX)?,
    ))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| PimapError::Serialization(e.to_string()))
}
