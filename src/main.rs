//! Exoplanet Classifier - Main Entry Point
//!
//! Reads newline-delimited JSON classify requests from stdin, classifies them
//! concurrently and writes one JSON result line per request to stdout.

use anyhow::{Context, Result};
use exoplanet_classifier::{
    config::AppConfig,
    metrics::{MetricsReporter, ServiceMetrics},
    service::PredictionService,
    types::{Classification, RawClassifyRequest},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// One input line: an optional caller id plus the request fields
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: RawClassifyRequest,
}

/// One output line
#[derive(Debug, Serialize)]
struct ResponseLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(flatten)]
    outcome: Outcome,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outcome {
    Classified(Classification),
    Failed { error: &'static str, message: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load_from_path(&path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => AppConfig::load()?,
    };

    // Initialize logging
    config.logging.init_subscriber()?;

    info!("Starting Exoplanet Classifier");
    info!(
        cache_dir = %config.artifacts.cache_dir.display(),
        remote = config.artifacts.remote_base_url.as_deref().unwrap_or("none"),
        "Artifact store configured"
    );

    // Initialize metrics
    let metrics = Arc::new(ServiceMetrics::new());

    // Artifacts load lazily on the first request
    let service = Arc::new(
        PredictionService::from_config(&config)
            .context("Failed to initialize prediction service")?
            .with_metrics(Arc::clone(&metrics)),
    );

    if config.service.metrics_interval_secs > 0 {
        let reporter = MetricsReporter::new(Arc::clone(&metrics), config.service.metrics_interval_secs);
        tokio::spawn(reporter.start());
    }

    // Single writer keeps output lines whole
    let (tx, mut rx) = mpsc::channel::<String>(1024);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await
    });

    // Semaphore to limit concurrent classifications
    let num_workers = config.service.workers.max(1);
    let semaphore = Arc::new(Semaphore::new(num_workers));
    let received = Arc::new(AtomicU64::new(0));
    info!(workers = num_workers, "Reading classify requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let permit = Arc::clone(&semaphore).acquire_owned().await?;
        let service = Arc::clone(&service);
        let tx = tx.clone();
        let count = received.fetch_add(1, Ordering::Relaxed) + 1;

        tokio::spawn(async move {
            let response = match serde_json::from_str::<RequestEnvelope>(&line) {
                Ok(envelope) => {
                    let outcome = match service.classify_raw(&envelope.request).await {
                        Ok(classification) => Outcome::Classified(classification),
                        Err(e) => Outcome::Failed {
                            error: e.kind(),
                            message: e.to_string(),
                        },
                    };
                    ResponseLine {
                        id: envelope.id,
                        outcome,
                    }
                }
                Err(e) => {
                    warn!(line = count, error = %e, "Failed to deserialize request");
                    ResponseLine {
                        id: None,
                        outcome: Outcome::Failed {
                            error: "malformed_request",
                            message: e.to_string(),
                        },
                    }
                }
            };

            match serde_json::to_string(&response) {
                Ok(json) => {
                    if tx.send(json).await.is_err() {
                        error!(line = count, "Output writer closed");
                    }
                }
                Err(e) => error!(line = count, error = %e, "Failed to serialize response"),
            }

            if count % 100 == 0 {
                let latency = service.metrics().get_latency_stats();
                info!(
                    processed = count,
                    throughput = format!("{:.1} req/s", service.metrics().get_throughput()),
                    avg_latency_us = latency.mean_us,
                    "Processing milestone"
                );
            }

            // Release permit when done
            drop(permit);
        });
    }

    // Wait for in-flight requests
    let _all = semaphore.acquire_many(num_workers as u32).await?;
    drop(tx);
    writer.await?.context("Failed to write results")?;

    debug!(requests = received.load(Ordering::Relaxed), "Input exhausted");
    info!("Classifier shutting down...");
    metrics.print_summary();

    Ok(())
}
