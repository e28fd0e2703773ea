//! Live ingest: chain events → durable buffer → relational store.
//!
//! Two independent tasks:
//! - `LiveListener` holds the push socket, turns BetBull/BetBear events
//!   into Bet records, appends them to the durable buffer, and publishes
//!   instant-bet and round-update signals. Reconnects with backoff when
//!   the socket goes quiet.
//! - `BufferConsumer` drains the buffer in batches, writes the live-bet
//!   table in one transaction per batch, and acknowledges only after
//!   commit so a crash replays instead of losing bets.

use crate::buffer::{BetStream, BufferedBet};
use crate::bus::{
    AnalysisRequest, Bus, InstantBet, RoundStatus, RoundUpdate, ANALYSIS_CHANNEL,
    INSTANT_BET_CHANNEL, ROUND_UPDATE_CHANNEL,
};
use crate::chain::abi::PredictionMarket;
use crate::chain::types::{amount_from_wei, tx_hex, wallet_hex};
use crate::chain::PredictionClient;
use crate::config::{ChainConfig, LiveConfig};
use crate::model::{Bet, Direction, Round};
use crate::store::Store;

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending entries idle longer than this are re-claimed from a crashed
/// consumer.
const CLAIM_IDLE_MS: u64 = 60_000;

/// Derive the broadcast status of a round from its timestamps.
pub fn round_status(round: &Round, now: i64) -> RoundStatus {
    if now < round.lock_time {
        RoundStatus::Live
    } else if now < round.close_time {
        RoundStatus::Locked
    } else {
        RoundStatus::Ended
    }
}

/// Build the round-update payload broadcast on the bus.
pub fn round_update(round: &Round, now: i64) -> RoundUpdate {
    let status = round_status(round, now);
    let ended = status == RoundStatus::Ended && round.is_finalized();
    RoundUpdate {
        epoch: round.epoch,
        lock_ts: round.lock_time,
        close_ts: round.close_time,
        up_amount: round.up_amount,
        down_amount: round.down_amount,
        total_amount: round.total_amount,
        status,
        result: ended.then(|| round.result()),
        close_price: ended.then_some(round.close_price),
    }
}

/// The push-socket listener.
pub struct LiveListener {
    chain: ChainConfig,
    live: LiveConfig,
    client: Arc<PredictionClient>,
    buffer: BetStream,
    bus: Bus,
    contract: Address,
    block_ts_cache: LruCache<u64, u64>,
    shutdown: watch::Receiver<bool>,
}

impl LiveListener {
    pub fn new(
        chain: ChainConfig,
        live: LiveConfig,
        client: Arc<PredictionClient>,
        buffer: BetStream,
        bus: Bus,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let contract = Address::from_str(&chain.contract_addr).context("invalid contract address")?;
        let capacity = NonZeroUsize::new(live.block_ts_cache.max(1)).expect("nonzero capacity");
        Ok(Self {
            chain,
            live,
            client,
            buffer,
            bus,
            contract,
            block_ts_cache: LruCache::new(capacity),
            shutdown,
        })
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Connect, stream, reconnect on failure - forever, until shutdown.
    async fn run(mut self) {
        let backoff = Duration::from_secs(self.live.reconnect_backoff_secs);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.session().await {
                Ok(()) => {
                    info!("push socket session ended");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "push socket session error, reconnecting");
                }
            }
            tokio::time::sleep(backoff).await;
        }
        info!("live listener stopped");
    }

    /// One socket session: subscribe to bet events, heartbeat the chain,
    /// and bail out when the connection goes silent.
    async fn session(&mut self) -> Result<()> {
        let provider = PredictionClient::connect_ws(&self.chain.wss_url).await?;
        let filter = crate::chain::abi::live_bet_filter(self.contract);
        let sub = provider.subscribe_logs(&filter).await?;
        let mut stream = sub.into_stream();
        info!(contract = %self.contract, "subscribed to live bet events");

        let mut heartbeat = tokio::time::interval(Duration::from_secs(self.live.heartbeat_secs));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let silence_limit = Duration::from_secs(self.live.silence_timeout_secs);
        let mut last_activity = Instant::now();
        let mut last_epoch: Option<u64> = None;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                maybe_log = stream.next() => {
                    let Some(log) = maybe_log else {
                        return Err(anyhow!("event stream closed"));
                    };
                    last_activity = Instant::now();
                    if let Err(e) = self.handle_log(&log).await {
                        warn!(error = %e, "failed to process live bet event");
                    }
                }
                _ = heartbeat.tick() => {
                    match self.heartbeat(&mut last_epoch).await {
                        Ok(()) => last_activity = Instant::now(),
                        Err(e) => {
                            warn!(error = %e, "heartbeat read failed");
                            if last_activity.elapsed() > silence_limit {
                                return Err(anyhow!("no confirmed activity for {}s",
                                    silence_limit.as_secs()));
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Lightweight liveness read, doubling as the round-update publisher:
    /// the current round's state is broadcast every beat so the
    /// aggregator and trader learn epoch transitions from this process.
    async fn heartbeat(&mut self, last_epoch: &mut Option<u64>) -> Result<()> {
        let epoch = self.client.current_epoch().await?;
        let round = self.client.round(epoch).await?;
        let now = chrono::Utc::now().timestamp();
        let update = round_update(&round, now);
        if last_epoch.map_or(true, |prev| prev != epoch) {
            info!(epoch = epoch, lock_ts = round.lock_time, "round transition");
        }
        *last_epoch = Some(epoch);
        if let Err(e) = self.bus.publish(ROUND_UPDATE_CHANNEL, &update).await {
            warn!(error = %e, "round update publish failed");
        }
        Ok(())
    }

    /// Decode one event, append it durably, then broadcast it. The buffer
    /// write is the one that must not fail; the broadcast is best-effort.
    async fn handle_log(&mut self, log: &Log) -> Result<()> {
        let Some(topic0) = log.topic0() else {
            return Ok(());
        };

        let (sender, epoch, amount, direction) = match *topic0 {
            t if t == PredictionMarket::BetBull::SIGNATURE_HASH => {
                let decoded = log.log_decode::<PredictionMarket::BetBull>()?;
                let data = decoded.inner.data;
                (data.sender, data.epoch, data.amount, Direction::Up)
            }
            t if t == PredictionMarket::BetBear::SIGNATURE_HASH => {
                let decoded = log.log_decode::<PredictionMarket::BetBear>()?;
                let data = decoded.inner.data;
                (data.sender, data.epoch, data.amount, Direction::Down)
            }
            _ => {
                debug!(topic = %topic0, "unexpected event topic");
                return Ok(());
            }
        };

        let block_number = log.block_number.context("live log without block number")?;
        let tx_hash = log
            .transaction_hash
            .context("live log without tx hash")
            .map(|h| tx_hex(&h))?;
        let bet_time = self.resolve_block_time(block_number, log).await?;

        let bet = Bet {
            epoch: u64::try_from(epoch).map_err(|_| anyhow!("epoch out of range"))?,
            bet_time,
            wallet_address: wallet_hex(&sender),
            direction,
            amount: amount_from_wei(amount)?,
            block_number,
            tx_hash,
        };

        let id = self.buffer.publish(&bet).await?;
        debug!(
            epoch = bet.epoch,
            direction = %bet.direction,
            amount = %bet.amount,
            stream_id = %id,
            "live bet buffered"
        );

        if let Err(e) = self
            .bus
            .publish(INSTANT_BET_CHANNEL, &InstantBet::new(bet))
            .await
        {
            warn!(error = %e, "instant bet publish failed");
        }
        Ok(())
    }

    async fn resolve_block_time(&mut self, block_number: u64, log: &Log) -> Result<i64> {
        if let Some(ts) = log.block_timestamp {
            self.block_ts_cache.put(block_number, ts);
            return Ok(ts as i64);
        }
        if let Some(ts) = self.block_ts_cache.get(&block_number).copied() {
            return Ok(ts as i64);
        }
        let ts = self.client.block_timestamp(block_number).await?;
        self.block_ts_cache.put(block_number, ts);
        Ok(ts as i64)
    }
}

/// The buffer consumer: batch writer for the live-bet table.
pub struct BufferConsumer {
    buffer: BetStream,
    store: Store,
    bus: Bus,
    live: LiveConfig,
    shutdown: watch::Receiver<bool>,
}

impl BufferConsumer {
    pub fn new(
        buffer: BetStream,
        store: Store,
        bus: Bus,
        live: LiveConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            buffer,
            store,
            bus,
            live,
            shutdown,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        info!(
            batch_size = self.live.batch_size,
            flush_interval_ms = self.live.flush_interval_ms,
            "buffer consumer started"
        );

        // Recover anything a previous incarnation left pending.
        let mut queue: Vec<BufferedBet> = match self.buffer.claim_stale(0).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "stale claim on startup failed");
                Vec::new()
            }
        };

        let flush_interval = Duration::from_millis(self.live.flush_interval_ms);
        let mut last_flush = Instant::now();

        loop {
            if *self.shutdown.borrow() {
                // Drain: flush what we hold, then stop.
                self.flush(&mut queue).await;
                break;
            }

            match self
                .buffer
                .read_batch(self.live.batch_size, self.live.block_ms)
                .await
            {
                Ok(batch) if batch.is_empty() => {
                    // Idle: pick up entries stranded by a dead consumer.
                    if queue.is_empty() {
                        match self.buffer.claim_stale(CLAIM_IDLE_MS).await {
                            Ok(stale) => queue.extend(stale),
                            Err(e) => warn!(error = %e, "stale claim failed"),
                        }
                        if let (Ok(backlog), Ok(pending)) =
                            (self.buffer.len().await, self.buffer.pending_count().await)
                        {
                            debug!(backlog = backlog, pending = pending, "buffer idle");
                        }
                    }
                }
                Ok(batch) => queue.extend(batch),
                Err(e) => {
                    warn!(error = %e, "buffer read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            if queue.len() >= self.live.batch_size || last_flush.elapsed() >= flush_interval {
                self.flush(&mut queue).await;
                last_flush = Instant::now();
            }
        }
        info!("buffer consumer stopped");
    }

    /// One transaction inserts the batch, then every message is
    /// acknowledged, then each bet goes to the analysis channel. An insert
    /// failure acknowledges nothing - the buffer redelivers.
    async fn flush(&mut self, queue: &mut Vec<BufferedBet>) {
        if queue.is_empty() {
            return;
        }
        let bets: Vec<Bet> = queue.iter().map(|entry| entry.bet.clone()).collect();

        match self.store.insert_realbets(&bets).await {
            Ok(inserted) => {
                let ids: Vec<String> = queue.iter().map(|entry| entry.id.clone()).collect();
                if let Err(e) = self.buffer.ack(&ids).await {
                    // Committed but unacked: the redelivery will be
                    // absorbed by the (bet_time, tx_hash) key.
                    warn!(error = %e, "ack failed after commit");
                }
                debug!(
                    batch = queue.len(),
                    inserted = inserted,
                    "live bet batch committed"
                );
                for bet in bets {
                    if let Err(e) = self
                        .bus
                        .publish(ANALYSIS_CHANNEL, &AnalysisRequest::new(bet))
                        .await
                    {
                        warn!(error = %e, "analysis publish failed");
                        break;
                    }
                }
                queue.clear();
            }
            Err(e) => {
                warn!(batch = queue.len(), error = %e, "live bet insert failed, leaving pending");
                // Drop our local copies; the unacked entries stay pending
                // and come back via redelivery.
                queue.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn sample_round() -> Round {
        Round {
            epoch: 100,
            start_time: 1_700_000_000,
            lock_time: 1_700_000_300,
            close_time: 1_700_000_600,
            lock_price: dec!(250),
            close_price: dec!(252.5),
            total_amount: dec!(5),
            up_amount: dec!(3),
            down_amount: dec!(2),
        }
    }

    #[test]
    fn status_follows_timestamps() {
        let round = sample_round();
        assert_eq!(round_status(&round, 1_700_000_100), RoundStatus::Live);
        assert_eq!(round_status(&round, 1_700_000_300), RoundStatus::Locked);
        assert_eq!(round_status(&round, 1_700_000_700), RoundStatus::Ended);
    }

    #[test]
    fn ended_update_carries_result() {
        let round = sample_round();
        let update = round_update(&round, 1_700_000_700);
        assert_eq!(update.status, RoundStatus::Ended);
        assert_eq!(update.result, Some(Direction::Up));
        assert_eq!(update.close_price, Some(dec!(252.5)));

        let live = round_update(&round, 1_700_000_100);
        assert_eq!(live.result, None);
        assert_eq!(live.close_price, None);
    }

    #[test]
    fn unfinalized_ended_round_has_no_result() {
        let mut round = sample_round();
        round.close_price = Decimal::ZERO;
        let update = round_update(&round, 1_700_000_700);
        assert_eq!(update.result, None);
    }
}
