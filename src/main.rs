// =============================================================================
// Exchange Aggregator — Main Entry Point
// =============================================================================
//
// Reads newline-delimited JSON exchange events from stdin, aggregates them
// for the configured pair and keeps the results in an in-memory store that
// is snapshotted to disk on shutdown and reloaded on the next start.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exchange_aggregator::{AggregationEngine, AggregatorConfig, ExchangeEvent, MemoryStore};

const DEFAULT_CONFIG_PATH: &str = "aggregator_config.json";

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("EXAGG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = AggregatorConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AggregatorConfig::default()
    });
    config.apply_overrides(|var| std::env::var(var).ok());

    info!(pair = %config.pair, native = %config.native_currency, "Exchange aggregator starting");

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store = if config.snapshot_path.exists() {
        MemoryStore::load_snapshot(&config.snapshot_path).unwrap_or_else(|e| {
            error!(error = %e, "Failed to load storage snapshot, starting empty");
            MemoryStore::new()
        })
    } else {
        MemoryStore::new()
    };
    let store = Arc::new(store);

    // ── 3. Engine + background tasks ─────────────────────────────────────
    let engine = Arc::new(AggregationEngine::new(&config, store.clone()));
    engine.bootstrap(Utc::now()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cycle_loop = tokio::spawn(engine.clone().run(shutdown_rx));
    let purge_timer = tokio::spawn(engine.clone().run_purge_timer());

    // ── 4. Ingest until end of input or Ctrl+C ───────────────────────────
    tokio::select! {
        result = ingest_stdin(&engine, &store) => match result {
            Ok(count) => info!(events = count, "Input exhausted"),
            Err(e) => error!(error = %e, "Input stream failed"),
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Shutdown signal received, draining queue");
        }
    }

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    cycle_loop.await.context("aggregation loop panicked")?;
    purge_timer.abort();

    if let Err(e) = store.save_snapshot(&config.snapshot_path) {
        error!(error = %e, "Failed to save storage snapshot on shutdown");
    }

    info!("Exchange aggregator shut down complete.");
    Ok(())
}

/// Feed every JSON line on stdin to the engine. Malformed lines are logged
/// and skipped.
async fn ingest_stdin(engine: &AggregationEngine, store: &MemoryStore) -> Result<usize> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ExchangeEvent>(line) {
            Ok(event) => {
                store.record_exchanges(engine.pair(), [event.clone()]);
                engine.add(event, None);
                count += 1;
            }
            Err(e) => warn!(error = %e, "failed to parse exchange event"),
        }
    }

    Ok(count)
}
