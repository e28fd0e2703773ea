//! Prediction process: the live aggregator and its bus router.
//!
//! Usage:
//!   cargo run --bin predictor

use anyhow::Result;
use tracing::{info, warn};

use betflow::bus::Bus;
use betflow::config::{self, Config};
use betflow::predict::PredictionEngine;
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

    let store = Store::connect(&config.database).await?;
    let bus = Bus::connect(&config.redis.url).await?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let _signals = shutdown::spawn_signal_listener(shutdown_tx);

    let engine = PredictionEngine::connect(
        &config.redis.url,
        store.clone(),
        bus,
        config.predict.clone(),
        shutdown_rx.clone(),
    )
    .await?;
    let aggregator = engine.aggregator.start();
    let router = engine.router;

    let mut shutdown_rx = shutdown_rx;
    let _ = shutdown_rx.changed().await;
    info!("draining prediction engine");

    let drained = shutdown::drain(vec![aggregator, router]).await;
    store.close().await;
    if !drained {
        warn!("prediction engine did not drain in time");
        std::process::exit(1);
    }
    Ok(())
}
