//! finsight server - headless signal fusion runtime
//!
//! Reads raw events as newline-delimited JSON (one `RawEvent` per line, tagged
//! by `kind`) from a file or stdin, and prints subscribed topics as JSON lines.
//! Metrics are pushed via structured JSON logs to stdout.
//!
//! # Usage
//! ```sh
//! cat events.ndjson | cargo run --bin server -- --subscribe predictions/AAPL
//! ```
//!
//! # Environment Variables
//! - `OBSERVABILITY_ENABLED` - Enable metrics reporting (default: true)
//! - `OBSERVABILITY_INTERVAL` - Interval in seconds between metric outputs (default: 60)
//! - `DATABASE_URL` - SQLite export target (export disabled when unset)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use finsight::application::broadcast::Topic;
use finsight::application::system::Application;
use finsight::config::Config;
use finsight::domain::raw_event::{RawEnvelope, RawEvent};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{Level, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// NDJSON event file; stdin when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Topic to print, e.g. `predictions/AAPL` or `signals/MSFT/technical` (repeatable)
    #[arg(long = "subscribe")]
    topics: Vec<String>,

    /// Keep running after the input is exhausted, until Ctrl+C
    #[arg(long, default_value_t = false)]
    follow: bool,
}

/// An input line; `received_at` defaults to the read time.
#[derive(Debug, Deserialize)]
struct InputLine {
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    event: RawEvent,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .pretty();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stderr_layer)
        .init();

    info!("finsight server {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: Instruments={:?}, Triggers={:?}",
        config.ingestion.instruments, config.broadcast.trigger_families
    );

    let app = Application::build(config).await?;
    let handle = app.start().await?;

    for name in &args.topics {
        let Some(topic) = Topic::parse(name) else {
            warn!("Ignoring unknown topic: {}", name);
            continue;
        };
        let mut subscription = handle.service.broadcast().subscribe("server", topic.clone());
        tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                match serde_json::to_string(payload.as_ref()) {
                    Ok(json) => println!("EVENT_JSON:{}", json),
                    Err(e) => warn!("Failed to serialize {} payload: {}", topic, e),
                }
            }
        });
    }

    let reader = tokio::spawn(read_events(args.input.clone(), handle.ingest_tx.clone()));

    if args.follow {
        info!("Server running. Press Ctrl+C to shutdown.");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received.");
        reader.abort();
    } else {
        tokio::select! {
            result = reader => {
                let lines = result.context("Input reader panicked")??;
                info!("Input exhausted after {} lines", lines);
            }
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received."),
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn read_events(input: Option<PathBuf>, tx: mpsc::Sender<RawEnvelope>) -> Result<usize> {
    let mut lines = match &input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .context(format!("Failed to open {}", path.display()))?;
            BufReader::new(Box::new(file) as Box<dyn tokio::io::AsyncRead + Send + Unpin>).lines()
        }
        None => BufReader::new(Box::new(tokio::io::stdin()) as Box<dyn tokio::io::AsyncRead + Send + Unpin>)
            .lines(),
    };

    let mut count = 0;
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        count += 1;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: InputLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping line {}: {}", count, e);
                continue;
            }
        };
        let envelope = RawEnvelope::new(parsed.received_at.unwrap_or_else(Utc::now), parsed.event);
        if tx.send(envelope).await.is_err() {
            break;
        }
    }
    Ok(count)
}
