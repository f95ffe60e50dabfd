//! gavel daemon entry point.
//!
//! Wires config -> logging -> store -> finalizer/scheduler and runs the
//! durable scheduling loop:
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌───────────┐    ┌──────────┐
//! │  Config  │───▶│   Store   │───▶│ Scheduler │───▶│ Finalizer│
//! │  (YAML)  │    │ (PG/mem)  │    │(timers+   │    │ (close)  │
//! └──────────┘    └───────────┘    │   sweep)  │    └──────────┘
//!                                  └───────────┘
//! ```
//!
//! Bid placement (`SettlementEngine`) is a library surface driven by
//! the embedding service; this binary owns the lifecycle side: startup
//! reconciliation, start/end timers, and the safety-net sweep.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use gavel::audit::{Audit, TracingActivityLog};
use gavel::config::AppConfig;
use gavel::logging::init_logging;
use gavel::notify::{NotificationFanout, TracingSink};
use gavel::scheduler::{AuctionScheduler, SchedulerConfig};
use gavel::store::{schema, AuctionStore, BidStore, MemoryStore, PgStore};
use gavel::Finalizer;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _guard = init_logging(&config);

    tracing::info!(env = %env, "gavel starting");

    let (auctions, bids): (Arc<dyn AuctionStore>, Arc<dyn BidStore>) = match &config.postgres_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            schema::init_schema(&pool).await?;
            let store = Arc::new(PgStore::new(pool));
            let auctions: Arc<dyn AuctionStore> = store.clone();
            let bids: Arc<dyn BidStore> = store;
            (auctions, bids)
        }
        None => {
            tracing::warn!("No postgres_url configured; running with the in-memory store");
            let store = Arc::new(MemoryStore::new());
            let auctions: Arc<dyn AuctionStore> = store.clone();
            let bids: Arc<dyn BidStore> = store;
            (auctions, bids)
        }
    };

    let fanout = NotificationFanout::new(Arc::new(TracingSink));
    let audit = Audit::new(Arc::new(TracingActivityLog));

    let finalizer = Arc::new(Finalizer::new(
        auctions.clone(),
        bids.clone(),
        fanout.clone(),
        audit.clone(),
    ));
    let scheduler = Arc::new(AuctionScheduler::new(
        auctions,
        finalizer,
        fanout,
        audit,
        SchedulerConfig {
            sweep_interval: Duration::from_secs(config.scheduler.sweep_interval_secs),
            batch_size: config.scheduler.batch_size,
        },
    ));

    // In-process timers died with the previous process; rebuild them
    // from the store before the first sweep.
    let reconciled = scheduler.reconcile().await?;
    tracing::info!(reconciled, "Reconciliation done, entering sweep loop");

    scheduler.run_sweep().await
}
