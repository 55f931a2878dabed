//! Datalink Hub - aviation datalink message aggregator
//!
//! Ingests ACARS, VDL-M2, HFDL, IMSL and IRDM decoder feeds over UDP,
//! TCP or pub-sub, normalizes and stores every message, matches alert
//! terms, and keeps precomputed per-window message-rate series in memory
//! for connected viewers.

mod broadcast;
mod config;
mod db;
mod ingest;
mod listener;
mod migration;
mod scheduler;
mod stats;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broadcast::HubBroadcaster;
use config::HubConfig;
use db::Store;
use ingest::{AlertCache, Pipeline};
use listener::build_listener;
use migration::MigrationGate;
use scheduler::RetentionManager;
use stats::{CounterFlusher, MessageCounters, TimeSeriesCache};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // The migration worker re-invokes this binary; handle that before
    // any logging or config so its output stays clean for the parent.
    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("migrate") {
        let Some(db_path) = args.next() else {
            eprintln!("usage: datalink-hub migrate <db-path>");
            std::process::exit(2);
        };
        match db::run_schema_migration(&db_path) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("migration failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("datalink_hub=info".parse()?))
        .init();

    let cfg = HubConfig::load();
    tracing::info!("Starting Datalink Hub");
    tracing::info!("Using database at {}", cfg.db_path);

    // Schema migration runs in a worker process so this loop stays
    // responsive; clients arriving meanwhile are parked behind the gate.
    let gate = Arc::new(MigrationGate::new());
    migration::run_migration(&gate, &cfg.db_path).await?;

    let store = Arc::new(Store::new(&cfg.db_path)?);
    let journal_mode = store.journal_mode()?;
    if journal_mode.eq_ignore_ascii_case("wal") {
        tracing::info!("Database initialized, journal mode {}", journal_mode);
    } else {
        tracing::warn!(
            "Database journal mode is {} instead of wal; durability is degraded",
            journal_mode
        );
    }
    let mirror = match &cfg.db_backup_path {
        Some(path) => {
            tracing::info!("Mirroring messages to {}", path);
            Some(Arc::new(Store::new(path)?))
        }
        None => None,
    };

    let bus = HubBroadcaster::default();

    let alerts = Arc::new(AlertCache::new());
    alerts.initialize(&store)?;

    let cache = Arc::new(TimeSeriesCache::new(store.clone(), bus.clone()));
    cache.prime()?;
    cache.start();

    let counters = Arc::new(MessageCounters::new());
    let flusher = Arc::new(CounterFlusher::new(store.clone(), counters.clone()));
    flusher.start();

    let retention = Arc::new(RetentionManager::new(store.clone(), cfg.retention_days));
    retention.start();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut listeners = Vec::new();
    for (decoder, endpoint) in &cfg.sources {
        tracing::info!("Starting {} listener on {}", decoder, endpoint);
        let l = build_listener(*decoder, endpoint.clone(), cfg.reconnect_delay, events_tx.clone());
        l.start();
        listeners.push(l);
    }
    if listeners.is_empty() {
        tracing::warn!("No decoder sources configured; nothing will be ingested");
    }
    drop(events_tx);

    let pipeline = Arc::new(Pipeline::new(store, mirror, alerts, counters, bus));
    let ingest_loop = tokio::spawn(ingest::run(events_rx, pipeline));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    for l in &listeners {
        l.stop();
    }
    cache.stop();
    flusher.stop();
    retention.stop();
    // Listeners hold event senders until their tasks notice the stop;
    // the ingest loop ends once the last sender is gone.
    drop(listeners);
    let _ = ingest_loop.await;

    Ok(())
}
