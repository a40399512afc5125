//! Loki Shipper - ships stdin lines to Grafana Loki
//!
//! Every line read from stdin becomes an info-level record. Records are
//! batched and pushed in the background; on EOF or Ctrl+C the logger is
//! closed, which flushes whatever is still buffered.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LOKI_SHIPPER_URL`: Loki base URL (default: http://localhost:3100)
//! - `LOKI_SHIPPER_APP_NAME`: Value of the `app` label (default: app)
//! - `LOKI_SHIPPER_LABELS`: Extra labels, `k=v,k2=v2`
//! - `LOKI_SHIPPER_BATCH_SIZE`: Records per push (default: 100)
//! - `LOKI_SHIPPER_FLUSH_INTERVAL_MS`: Milliseconds between flushes (default: 5000)
//! - `LOKI_SHIPPER_MAX_RETRIES`: Retries per push (default: 3)
//! - `LOKI_SHIPPER_USERNAME` / `LOKI_SHIPPER_PASSWORD`: Basic auth
//! - `LOKI_SHIPPER_MAX_LOGS_PER_SECOND`: Rate limit, 0 disables (default: 0)
//! - `RUST_LOG`: Diagnostics filter for this binary (default: info)

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loki_shipper::config::{Config, Handlers};
use loki_shipper::logger::Logger;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Loki shipper...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                url = %config.url,
                app = %config.app_name,
                batch_size = config.batch_size,
                flush_interval_ms = config.flush_interval.as_millis() as u64,
                max_retries = config.max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let handlers = Handlers {
        on_rate_limit: Some(Arc::new(|dropped: u64, sampled: u64| {
            warn!(dropped = dropped, sampled = sampled, "Input is being rate limited");
        })),
        ..Handlers::default()
    };

    let logger = match Logger::new(config, handlers) {
        Ok(logger) => logger,
        Err(e) => {
            error!(error = %e, "Failed to create logger");
            std::process::exit(1);
        }
    };

    info!("Shipping stdin lines. Press Ctrl+C to stop.");
    let shipped = tokio::select! {
        shipped = ship_stdin(&logger) => Some(shipped),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            None
        }
    };
    if let Some(lines) = shipped {
        info!(lines = lines, "Reached end of input");
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    match logger.close().await {
        Ok(()) => info!("Logger closed"),
        Err(e) => warn!(error = %e, "Logger did not shut down cleanly"),
    }

    info!("Loki shipper stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Log every non-empty stdin line. Returns the number of lines shipped once
/// stdin is exhausted or unreadable.
async fn ship_stdin(logger: &Logger) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shipped: u64 = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                logger.info(line, None).await;
                shipped += 1;
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }

    shipped
}
