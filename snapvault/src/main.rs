mod spool;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use contract_store::{ContractStore, PostgresContractStore, StoreError};
use core_types::config::{AppConfig, ConfigError};
use ingestion_service::IngestionService;
use lifecycle_engine::{LifecycleEngine, MaintenanceScheduler};
use spool::SnapshotSpool;
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("signal error: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("snapvault failed: {err}");
        process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    env_logger::init();
    let config = AppConfig::load()?;

    let store = PostgresContractStore::connect(
        &config.database_url,
        config.store.max_connections,
        config.store.lock_wait_ms,
    )
    .await?;
    let store: Arc<dyn ContractStore> = Arc::new(store);

    let ingestion = Arc::new(IngestionService::new(
        store.clone(),
        config.ingest.retry_policy(),
    ));
    let engine = Arc::new(LifecycleEngine::new(store.clone(), &config.lifecycle));
    let scheduler = Arc::new(MaintenanceScheduler::new(engine));

    let summary = store.live_summary().await?;
    println!(
        "snapvault booted: {} live contracts across {} symbols",
        summary.rows, summary.distinct_symbols
    );
    println!(
        "Ingestion retry policy: {} attempts, {}ms base delay; lifecycle cutoffs: expired {}d, stale {}d",
        config.ingest.max_retries,
        config.ingest.base_delay_ms,
        config.lifecycle.expired_after_days,
        config.lifecycle.stale_after_days
    );
    println!(
        "Snapshot spool: {:?} every {}s; maintenance tick every {}s",
        config.spool.dir, config.spool.poll_interval_s, config.scheduler.tick_interval_s
    );

    let scheduler_task = scheduler
        .clone()
        .spawn(Duration::from_secs(config.scheduler.tick_interval_s));
    let spool = SnapshotSpool::new(
        &config.spool.dir,
        Duration::from_secs(config.spool.poll_interval_s),
        ingestion.clone(),
    );
    let spool_task = spool.spawn();

    println!("Maintenance scheduler and snapshot spool are running; press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;
    println!("Shutdown signal received; stopping workers...");
    spool_task.abort();
    scheduler_task.abort();
    for status in [ingestion.status_handle(), scheduler.status_handle()] {
        let snapshot = status.snapshot();
        println!("{}: {:?}", snapshot.name, snapshot.overall);
    }
    Ok(())
}
