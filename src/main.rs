use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use adaptive_filter::config;
use adaptive_filter::processor::{FilterProcessor, MetricsStage};
use adaptive_filter::types::MetricBatch;

#[derive(Parser, Debug)]
#[command(name = "adaptive-filter", about = "Adaptive per-resource telemetry filter")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/adaptive-filter/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Newline-delimited JSON batches to filter (defaults to stdin)
    #[arg(short, long)]
    input: Option<String>,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.agent.hostname,
        "Starting adaptive filter"
    );

    if let Err(e) = run(config, cli.input).await {
        error!(error = %e, "Filter terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &config::Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    // Filtered batches go to stdout, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

async fn run(config: config::Config, input: Option<String>) -> Result<()> {
    let processor = FilterProcessor::new(&config)?;
    processor.start().await?;

    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match &input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input: {}", path))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();
    let mut stdout = tokio::io::stdout();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_cancel.cancel();
        }
    });

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read input")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let batch: MetricBatch = match serde_json::from_str(&line) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed batch");
                continue;
            }
        };

        let output = match processor.process_batch(&cancel, batch).await {
            Ok(filtered) => filtered,
            Err(e) => {
                tracing::warn!(error = %e, "Forwarding unfiltered batch");
                e.into_batch()
            }
        };

        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    processor.shutdown().await?;
    info!("Adaptive filter stopped");
    Ok(())
}
