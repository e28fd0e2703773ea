//! Timed trader: one bet per round, inside the safe window.
//!
//! Consumes predictions and round updates. A strong pre-final signal arms
//! the round by reserving a nonce so the final dispatch path is minimal;
//! the final prediction is held (or rescheduled) until `t_stop - delta_ms`
//! and submitted with a bumped gas price. Chain errors are reported, never
//! retried - missing the window beats double-betting. A send whose outcome
//! is unknowable (timeout, dropped connection) marks the round uncertain
//! rather than placed, so the operator investigates instead of the
//! process silently re-betting.

use crate::bus::{
    Bus, RoundUpdate, Subscription, LIVE_PREDICTIONS_CHANNEL, ROUND_UPDATE_CHANNEL,
    TRADE_LOG_CHANNEL,
};
use crate::chain::PredictionClient;
use crate::config::TraderConfig;
use crate::model::Direction;
use crate::predict::momentum::Confidence;
use crate::predict::Prediction;
use crate::store::Store;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const PHASE_ARM: &str = "arm";
pub const PHASE_FINAL_DRYRUN: &str = "final_dryrun";
pub const PHASE_FINAL_SENT: &str = "final_sent";
pub const PHASE_FINAL_RECEIPT: &str = "final_receipt";

const STRATEGY: &str = "momentum";

/// Margin before the arming cutoff and around the reschedule wakeup.
const SCHEDULE_SLACK_MS: i64 = 500;

/// Submissions this close to `t_stop` are abandoned.
const TOO_LATE_MS: i64 = 100;

/// Keep per-epoch state for this many rounds behind the current one.
const STATE_RETENTION_EPOCHS: u64 = 3;

/// One observability record per trader phase, published on the bus and
/// appended to the trade_log table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogRecord {
    pub epoch: u64,
    pub phase: String,
    pub strategy: String,
    pub prediction: Direction,
    pub confidence: String,
    pub amount: Decimal,
    pub delta_ms: u64,
    /// Unix ms of the latest acceptable submission.
    pub t_stop: i64,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mined_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum TraderMsg {
    Update(RoundUpdate),
    Prediction(Prediction),
}

#[derive(Debug, Clone, Copy)]
struct EpochMeta {
    t_stop: i64,
}

#[derive(Debug, Clone, Copy)]
struct ArmedEntry {
    prediction: Direction,
    armed_at_ms: i64,
    nonce: u64,
    amount: Decimal,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Trader {
    client: Arc<PredictionClient>,
    store: Store,
    bus: Bus,
    config: TraderConfig,
    delta_ms: u64,
    min_confidence: Confidence,
    side_filter: Option<Direction>,
    buffer_secs: u64,
    rx: Option<mpsc::Receiver<TraderMsg>>,
    self_tx: mpsc::Sender<TraderMsg>,
    shutdown: watch::Receiver<bool>,
    meta: HashMap<u64, EpochMeta>,
    placed: HashSet<u64>,
    uncertain: HashSet<u64>,
    armed: HashMap<u64, ArmedEntry>,
}

impl Trader {
    /// Wire the bus into the trader mailbox and read the contract's
    /// buffer seconds once up front.
    pub async fn connect(
        redis_url: &str,
        client: Arc<PredictionClient>,
        store: Store,
        bus: Bus,
        config: TraderConfig,
        delta_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let min_confidence =
            Confidence::from_str(&config.min_confidence).unwrap_or(Confidence::High);
        let side_filter = match config.side_filter.to_ascii_lowercase().as_str() {
            "any" => None,
            other => Direction::from_str(other).ok(),
        };
        let buffer_secs = client
            .buffer_seconds()
            .await
            .context("read bufferSeconds")?;

        let (tx, rx) = mpsc::channel(256);
        let router = spawn_router(redis_url, tx.clone(), shutdown.clone()).await?;

        info!(
            enabled = config.enabled,
            dry_run = config.dry_run,
            amount = %config.amount,
            min_confidence = %min_confidence,
            delta_ms = delta_ms,
            buffer_secs = buffer_secs,
            "trader connected"
        );

        Ok((
            Self {
                client,
                store,
                bus,
                config,
                delta_ms,
                min_confidence,
                side_filter,
                buffer_secs,
                rx: Some(rx),
                self_tx: tx,
                shutdown,
                meta: HashMap::new(),
                placed: HashSet::new(),
                uncertain: HashSet::new(),
                armed: HashMap::new(),
            },
            router,
        ))
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        info!("trader started");
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(TraderMsg::Update(update)) => self.handle_update(update),
                        Some(TraderMsg::Prediction(prediction)) => {
                            self.handle_prediction(prediction).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("trader stopped");
    }

    /// Track the send window for each round and drop stale state.
    fn handle_update(&mut self, update: RoundUpdate) {
        let lock_ms = update.lock_ts * 1000;
        let t_stop = lock_ms - self.buffer_secs as i64 * 1000;
        self.meta.insert(update.epoch, EpochMeta { t_stop });

        let horizon = update.epoch.saturating_sub(STATE_RETENTION_EPOCHS);
        self.meta.retain(|epoch, _| *epoch >= horizon);
        self.placed.retain(|epoch| *epoch >= horizon);
        self.uncertain.retain(|epoch| *epoch >= horizon);
        let placed = &self.placed;
        self.armed
            .retain(|epoch, _| *epoch >= horizon && !placed.contains(epoch));
    }

    async fn handle_prediction(&mut self, prediction: Prediction) {
        if !self.config.enabled {
            return;
        }
        let signal = &prediction.strategies.momentum;
        if let Some(side) = self.side_filter {
            if signal.prediction != side {
                debug!(epoch = prediction.epoch, "prediction fails side filter");
                return;
            }
        }
        if signal.confidence < self.min_confidence {
            debug!(
                epoch = prediction.epoch,
                confidence = %signal.confidence,
                "prediction below confidence floor"
            );
            return;
        }

        if prediction.is_final {
            self.handle_final(prediction).await;
        } else {
            self.handle_arming(prediction).await;
        }
    }

    /// A strong pre-final signal reserves a nonce so the final send path
    /// does no account reads. One arming per epoch.
    async fn handle_arming(&mut self, prediction: Prediction) {
        if !self.config.arm_enabled {
            return;
        }
        let epoch = prediction.epoch;
        if self.armed.contains_key(&epoch) || self.placed.contains(&epoch) {
            return;
        }
        let signal = &prediction.strategies.momentum;
        let features = &signal.features;
        let strong = features.slope.abs() >= self.config.arm_slope_min
            && (features.volume_ratio >= self.config.arm_volume_min
                || features.up_ratio_diff.abs() >= self.config.arm_updiff_min);
        if !strong {
            return;
        }

        let Some(meta) = self.meta.get(&epoch).copied() else {
            debug!(epoch = epoch, "no epoch meta yet, skipping arm");
            return;
        };
        let now = now_ms();
        if now >= meta.t_stop - self.delta_ms as i64 - SCHEDULE_SLACK_MS {
            debug!(epoch = epoch, "too close to send window to arm");
            return;
        }

        let nonce = match self.client.pending_nonce().await {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(epoch = epoch, error = %e, "nonce reservation failed");
                return;
            }
        };

        let entry = ArmedEntry {
            prediction: signal.prediction,
            armed_at_ms: now,
            nonce,
            amount: self.config.amount,
        };
        self.armed.insert(epoch, entry);
        info!(
            epoch = epoch,
            prediction = %signal.prediction,
            nonce = nonce,
            "round armed"
        );

        let record = self.record(&prediction, PHASE_ARM, meta.t_stop);
        let record = TradeLogRecord {
            nonce: Some(nonce),
            ..record
        };
        self.emit_trade_log(record).await;
    }

    /// The final prediction: wait for the send point, re-check everything
    /// that could mean a duplicate, then dispatch exactly once.
    async fn handle_final(&mut self, prediction: Prediction) {
        let epoch = prediction.epoch;
        let meta = match self.meta.get(&epoch).copied() {
            Some(meta) => meta,
            None => match self.fetch_meta(epoch).await {
                Some(meta) => meta,
                None => return,
            },
        };

        let t_send = meta.t_stop - self.delta_ms as i64;
        let now = now_ms();

        // Early: hold the prediction and come back just before t_send.
        if now < t_send - 1000 {
            let wait = (t_send - now - SCHEDULE_SLACK_MS).max(0) as u64;
            debug!(epoch = epoch, wait_ms = wait, "final prediction early, rescheduling");
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(wait)).await;
                let _ = tx.send(TraderMsg::Prediction(prediction)).await;
            });
            return;
        }

        // Late: the contract would reject or race the lock.
        if now >= meta.t_stop - TOO_LATE_MS {
            warn!(
                epoch = epoch,
                late_ms = now - meta.t_stop,
                "send window missed, not betting"
            );
            return;
        }

        if self.placed.contains(&epoch) || self.uncertain.contains(&epoch) {
            debug!(epoch = epoch, "round already acted on");
            return;
        }

        // Cross-check the chain ledger: another instance (or a manual
        // bet) may already hold a position this round.
        if let Some(address) = self.client.signer_address() {
            match self.client.ledger(epoch, address).await {
                Ok(entry) if entry.has_bet() => {
                    info!(epoch = epoch, "ledger shows an existing bet, skipping");
                    self.placed.insert(epoch);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(epoch = epoch, error = %e, "ledger check failed, not betting");
                    return;
                }
            }
        }

        let signal = &prediction.strategies.momentum;
        let (nonce, amount) = match self.armed.get(&epoch) {
            Some(entry)
                if entry.prediction == signal.prediction
                    && now - entry.armed_at_ms <= self.config.arm_max_age_ms as i64 =>
            {
                (Some(entry.nonce), entry.amount)
            }
            _ => (None, self.config.amount),
        };

        if self.config.dry_run {
            self.placed.insert(epoch);
            info!(
                epoch = epoch,
                prediction = %signal.prediction,
                amount = %amount,
                "DRY RUN: would bet"
            );
            let record = TradeLogRecord {
                nonce,
                success: Some(true),
                ..self.record(&prediction, PHASE_FINAL_DRYRUN, meta.t_stop)
            };
            self.emit_trade_log(record).await;
            return;
        }

        let gas_price = match self.client.gas_price().await {
            Ok(base) => Some((base as f64 * self.config.gas_bump).floor() as u128),
            Err(e) => {
                warn!(epoch = epoch, error = %e, "gas price read failed, sending without bump");
                None
            }
        };

        let sent_record = TradeLogRecord {
            nonce,
            ..self.record(&prediction, PHASE_FINAL_SENT, meta.t_stop)
        };
        self.emit_trade_log(sent_record).await;

        match self
            .client
            .send_bet(signal.prediction, epoch, amount, nonce, gas_price)
            .await
        {
            Ok(receipt) => {
                self.placed.insert(epoch);
                self.armed.remove(&epoch);
                info!(
                    epoch = epoch,
                    prediction = %signal.prediction,
                    tx = %receipt.tx_hash,
                    total_ms = receipt.total_ms,
                    "bet placed"
                );
                let record = TradeLogRecord {
                    nonce,
                    tx_hash: Some(format!("{:x}", receipt.tx_hash)),
                    send_ms: Some(receipt.send_ms),
                    mined_ms: Some(receipt.mined_ms),
                    total_ms: Some(receipt.total_ms),
                    success: Some(true),
                    ..self.record(&prediction, PHASE_FINAL_RECEIPT, meta.t_stop)
                };
                self.emit_trade_log(record).await;
            }
            Err(e) => {
                let message = format!("{e:#}");
                if is_definite_rejection(&message) {
                    // The chain certainly refused it; the round is done
                    // for us.
                    self.placed.insert(epoch);
                } else {
                    // Outcome unknown: never re-bet, leave it to the
                    // operator.
                    self.uncertain.insert(epoch);
                }
                warn!(epoch = epoch, error = %message, "bet send failed");
                let record = TradeLogRecord {
                    nonce,
                    success: Some(false),
                    error: Some(message),
                    ..self.record(&prediction, PHASE_FINAL_RECEIPT, meta.t_stop)
                };
                self.emit_trade_log(record).await;
            }
        }
    }

    async fn fetch_meta(&mut self, epoch: u64) -> Option<EpochMeta> {
        match self.client.round(epoch).await {
            Ok(round) => {
                let t_stop = round.lock_time * 1000 - self.buffer_secs as i64 * 1000;
                let meta = EpochMeta { t_stop };
                self.meta.insert(epoch, meta);
                Some(meta)
            }
            Err(e) => {
                warn!(epoch = epoch, error = %e, "round meta fetch failed");
                None
            }
        }
    }

    fn record(&self, prediction: &Prediction, phase: &str, t_stop: i64) -> TradeLogRecord {
        let signal = &prediction.strategies.momentum;
        TradeLogRecord {
            epoch: prediction.epoch,
            phase: phase.to_string(),
            strategy: STRATEGY.to_string(),
            prediction: signal.prediction,
            confidence: signal.confidence.to_string(),
            amount: self.config.amount,
            delta_ms: self.delta_ms,
            t_stop,
            version: prediction.version,
            nonce: None,
            tx_hash: None,
            send_ms: None,
            mined_ms: None,
            total_ms: None,
            success: None,
            error: None,
        }
    }

    /// Publish the phase record on the bus and append it to the table.
    /// Both are best-effort: observability must not block the send path.
    async fn emit_trade_log(&mut self, record: TradeLogRecord) {
        if let Err(e) = self.bus.publish(TRADE_LOG_CHANNEL, &record).await {
            warn!(error = %e, "trade log publish failed");
        }
        if let Err(e) = self.store.insert_trade_log(&record).await {
            warn!(error = %e, "trade log insert failed");
        }
    }
}

/// Errors that prove the chain rejected the transaction (no bet exists).
/// Anything else leaves the outcome unknown.
fn is_definite_rejection(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("insufficient funds")
        || lower.contains("execution reverted")
        || lower.contains("nonce too low")
}

async fn spawn_router(
    redis_url: &str,
    tx: mpsc::Sender<TraderMsg>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let mut sub = Subscription::connect(
        redis_url,
        &[LIVE_PREDICTIONS_CHANNEL, ROUND_UPDATE_CHANNEL],
    )
    .await?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                message = sub.next_message() => {
                    let Some((channel, payload)) = message else {
                        warn!("trader subscription ended");
                        break;
                    };
                    let msg = match channel.as_str() {
                        LIVE_PREDICTIONS_CHANNEL => {
                            match serde_json::from_str::<Prediction>(&payload) {
                                Ok(prediction) => TraderMsg::Prediction(prediction),
                                Err(e) => {
                                    warn!(error = %e, "bad prediction payload");
                                    continue;
                                }
                            }
                        }
                        ROUND_UPDATE_CHANNEL => {
                            match serde_json::from_str::<RoundUpdate>(&payload) {
                                Ok(update) => TraderMsg::Update(update),
                                Err(e) => {
                                    warn!(error = %e, "bad round update payload");
                                    continue;
                                }
                            }
                        }
                        _ => continue,
                    };
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classification() {
        assert!(is_definite_rejection("server returned: insufficient funds for gas"));
        assert!(is_definite_rejection("Execution reverted: round not bettable"));
        assert!(is_definite_rejection("nonce too low"));
        assert!(!is_definite_rejection("request timed out"));
        assert!(!is_definite_rejection("connection reset by peer"));
    }

    #[test]
    fn confidence_ordering_matches_filter_semantics() {
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
        assert!(Confidence::High >= Confidence::High);
    }

    #[test]
    fn trade_log_omits_empty_fields() {
        let record = TradeLogRecord {
            epoch: 10,
            phase: PHASE_ARM.to_string(),
            strategy: STRATEGY.to_string(),
            prediction: Direction::Up,
            confidence: "high".to_string(),
            amount: rust_decimal_macros::dec!(0.001),
            delta_ms: 4000,
            t_stop: 1_700_000_000_000,
            version: 2,
            nonce: Some(7),
            tx_hash: None,
            send_ms: None,
            mined_ms: None,
            total_ms: None,
            success: None,
            error: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"nonce\":7"));
        assert!(!json.contains("tx_hash"));
        assert!(!json.contains("success"));
    }
}
