//! Trader process: prediction-driven, window-timed bet dispatch.
//!
//! Needs PRIVATE_KEY in the environment unless running dry.
//!
//! Usage:
//!   cargo run --bin trader

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use betflow::bus::Bus;
use betflow::chain::PredictionClient;
use betflow::config::{self, Config};
use betflow::shutdown;
use betflow::store::Store;
use betflow::trader::Trader;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");
    let _ = dotenvy::dotenv();

    let config = Config::load_default()?;
    config::init_tracing(&config.logging);

    // A signing client when a key is present; dry runs and disabled
    // traders can watch the market without one.
    let client = if config.has_signing_key() {
        Arc::new(PredictionClient::connect_with_signer(
            &config.chain,
            config.sync.retry_max,
        )?)
    } else {
        if config.trader.enabled && !config.trader.dry_run {
            anyhow::bail!("trader enabled for live sends but PRIVATE_KEY is not set");
        }
        Arc::new(PredictionClient::connect(
            &config.chain,
            config.sync.retry_max,
        )?)
    };

    let store = Store::connect(&config.database).await?;
    let bus = Bus::connect(&config.redis.url).await?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let _signals = shutdown::spawn_signal_listener(shutdown_tx);

    let delta_ms = config.trader_delta_ms();
    let (trader, router) = Trader::connect(
        &config.redis.url,
        client,
        store.clone(),
        bus,
        config.trader.clone(),
        delta_ms,
        shutdown_rx.clone(),
    )
    .await?;
    let trader = trader.start();

    let mut shutdown_rx = shutdown_rx;
    let _ = shutdown_rx.changed().await;
    info!("draining trader");

    let drained = shutdown::drain(vec![trader, router]).await;
    store.close().await;
    if !drained {
        warn!("trader did not drain in time");
        std::process::exit(1);
    }
    Ok(())
}
