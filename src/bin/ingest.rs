//! Live ingest process: push-socket listener + buffer consumer.
//!
//! Usage:
//!   cargo run --bin ingest

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use betflow::buffer::BetStream;
use betflow::bus::Bus;
use betflow::chain::{abi, PredictionClient};
use betflow::config::{self, Config};
use betflow::live::{BufferConsumer, LiveListener};
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

    for (signature, ok) in abi::verify_topic_hashes() {
        if !ok {
            error!(signature = signature, "event topic hash mismatch");
            std::process::exit(1);
        }
    }

    let client = Arc::new(PredictionClient::connect(
        &config.chain,
        config.sync.retry_max,
    )?);
    let store = Store::connect(&config.database).await?;

    // Independent connections for the listener's produce path and the
    // consumer's read path.
    let listener_buffer = BetStream::connect(&config.redis).await?;
    let consumer_buffer = BetStream::connect(&config.redis).await?;
    let listener_bus = Bus::connect(&config.redis.url).await?;
    let consumer_bus = Bus::connect(&config.redis.url).await?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let _signals = shutdown::spawn_signal_listener(shutdown_tx);

    let listener = LiveListener::new(
        config.chain.clone(),
        config.live.clone(),
        client.clone(),
        listener_buffer,
        listener_bus,
        shutdown_rx.clone(),
    )?
    .start();
    let consumer = BufferConsumer::new(
        consumer_buffer,
        store.clone(),
        consumer_bus,
        config.live.clone(),
        shutdown_rx.clone(),
    )
    .start();

    let mut shutdown_rx = shutdown_rx;
    let _ = shutdown_rx.changed().await;
    info!("draining ingest workers");

    let drained = shutdown::drain(vec![listener, consumer]).await;
    store.close().await;
    if !drained {
        warn!("ingest workers did not drain in time");
        std::process::exit(1);
    }
    Ok(())
}
