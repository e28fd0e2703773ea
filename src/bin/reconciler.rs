//! Reconciliation process: the forward / backward / gap worker trio.
//!
//! Usage:
//!   cargo run --bin reconciler

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use betflow::chain::PredictionClient;
use betflow::config::{self, Config};
use betflow::reconcile::range::BlockRange;
use betflow::reconcile::{EpochLock, EpochSync, RangeEstimator, ReconcileWorkers};
use betflow::shutdown;
use betflow::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");
    let _ = dotenvy::dotenv();

    let config = Config::load_default()?;
    config::init_tracing(&config.logging);

    let client = Arc::new(PredictionClient::connect(
        &config.chain,
        config.sync.retry_max,
    )?);
    let store = Store::connect(&config.database).await?;
    let lock = Arc::new(tokio::sync::Mutex::new(
        EpochLock::connect(&config.redis.url, config.sync.lock_ttl_secs).await?,
    ));

    let fallback = match (
        config.sync.fallback_from_block,
        config.sync.fallback_to_block,
    ) {
        (Some(from_block), Some(to_block)) => Some(BlockRange {
            from_block,
            to_block,
        }),
        _ => None,
    };
    let estimator = RangeEstimator::new(config.sync.blocks_per_epoch_default, fallback);

    let sync = Arc::new(EpochSync::new(
        client.clone(),
        store.clone(),
        lock,
        estimator,
        &config.sync,
    ));

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let _signals = shutdown::spawn_signal_listener(shutdown_tx);

    let workers = ReconcileWorkers::new(
        sync,
        store.clone(),
        client,
        &config.sync,
        shutdown_rx.clone(),
    )
    .start();

    let mut shutdown_rx = shutdown_rx;
    let _ = shutdown_rx.changed().await;
    info!("draining reconciliation workers");

    let drained = shutdown::drain(workers).await;
    store.close().await;
    if !drained {
        warn!("reconciliation workers did not drain in time");
        std::process::exit(1);
    }
    Ok(())
}
