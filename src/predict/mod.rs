//! Live prediction engine.
//!
//! A single task owns all per-round state and is fed through a mailbox:
//! round updates and instant bets arrive from the bus, final ticks from a
//! one-shot timer. Nothing else touches the state, so ordering within an
//! epoch is exactly arrival order and an epoch reset is atomic.

pub mod momentum;

use crate::bus::{
    Bus, InstantBet, RoundUpdate, Subscription, INSTANT_BET_CHANNEL, LIVE_PREDICTIONS_CHANNEL,
    ROUND_UPDATE_CHANNEL,
};
use crate::config::PredictConfig;
use crate::model::Bet;
use crate::store::{RoundFeature, Store};
use momentum::{
    regression_slope, volume_bucket, FlowFeatures, MomentumSignal, VolumeBucket,
};

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ratio delta that forces a revision.
const RATIO_EMIT_DELTA: f64 = 0.03;

/// Window feeding the up-ratio regression slope.
const SLOPE_WINDOW_MS: i64 = 8_000;

/// Floor for a final tick scheduled too close to (or past) its due time.
const FINAL_FLOOR_MS: u64 = 500;

/// The emitted prediction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub epoch: u64,
    /// Unix milliseconds at emission.
    pub timestamp: i64,
    /// Monotone per epoch.
    pub version: u64,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub strategies: Strategies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategies {
    pub momentum: MomentumSignal,
}

/// Mailbox messages for the aggregator task.
#[derive(Debug)]
pub enum AggregatorMsg {
    RoundUpdate(RoundUpdate),
    Bet(Bet),
    FinalTick { epoch: u64 },
}

/// Decide whether a bet-driven revision should go out.
fn should_emit(
    last_ratio: Option<f64>,
    last_bucket: Option<VolumeBucket>,
    up_ratio: f64,
    bucket: VolumeBucket,
) -> bool {
    let Some(last) = last_ratio else {
        return true;
    };
    if (up_ratio - last).abs() >= RATIO_EMIT_DELTA {
        return true;
    }
    if (last < 0.5) != (up_ratio < 0.5) {
        return true;
    }
    last_bucket != Some(bucket)
}

/// Delay until the final revision for a round locking at `lock_ms`.
fn final_delay_ms(lock_ms: i64, advance_ms: u64, now_ms: i64) -> u64 {
    let due = lock_ms - advance_ms as i64;
    let delay = due - now_ms;
    if delay < FINAL_FLOOR_MS as i64 {
        FINAL_FLOOR_MS
    } else {
        delay as u64
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct EpochState {
    epoch: u64,
    lock_ms: i64,
    up_sum: Decimal,
    down_sum: Decimal,
    total_sum: Decimal,
    version: u64,
    last_emitted_ratio: Option<f64>,
    last_bucket: Option<VolumeBucket>,
    last_emit_at: Option<Instant>,
    final_emitted: bool,
    /// Bounded (t_ms, up_ratio, total) series for the slope.
    series: VecDeque<(i64, f64, Decimal)>,
    history: Vec<RoundFeature>,
    avg_up_ratio: f64,
    avg_volume: Decimal,
    timer: Option<JoinHandle<()>>,
}

impl EpochState {
    fn up_ratio(&self) -> f64 {
        if self.total_sum.is_zero() {
            0.5
        } else {
            (self.up_sum / self.total_sum).to_f64().unwrap_or(0.5)
        }
    }

    fn volume_ratio(&self) -> f64 {
        if self.avg_volume.is_zero() {
            0.0
        } else {
            (self.total_sum / self.avg_volume).to_f64().unwrap_or(0.0)
        }
    }
}

impl Drop for EpochState {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// The aggregator task plus its bus-to-mailbox router.
pub struct PredictionEngine {
    pub aggregator: Aggregator,
    pub router: JoinHandle<()>,
}

impl PredictionEngine {
    /// Wire the mailbox to the bus and build the aggregator.
    pub async fn connect(
        redis_url: &str,
        store: Store,
        bus: Bus,
        config: PredictConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1024);
        let router = spawn_router(redis_url, tx.clone(), shutdown.clone()).await?;
        let aggregator = Aggregator {
            store,
            bus,
            config,
            rx: Some(rx),
            self_tx: tx,
            state: None,
            shutdown,
        };
        Ok(Self { aggregator, router })
    }
}

async fn spawn_router(
    redis_url: &str,
    tx: mpsc::Sender<AggregatorMsg>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let mut sub =
        Subscription::connect(redis_url, &[ROUND_UPDATE_CHANNEL, INSTANT_BET_CHANNEL]).await?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                message = sub.next_message() => {
                    let Some((channel, payload)) = message else {
                        warn!("subscription stream ended");
                        break;
                    };
                    let msg = match channel.as_str() {
                        ROUND_UPDATE_CHANNEL => {
                            match serde_json::from_str::<RoundUpdate>(&payload) {
                                Ok(update) => AggregatorMsg::RoundUpdate(update),
                                Err(e) => {
                                    warn!(error = %e, "bad round update payload");
                                    continue;
                                }
                            }
                        }
                        INSTANT_BET_CHANNEL => {
                            match serde_json::from_str::<InstantBet>(&payload) {
                                Ok(instant) => AggregatorMsg::Bet(instant.data),
                                Err(e) => {
                                    warn!(error = %e, "bad instant bet payload");
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

pub struct Aggregator {
    store: Store,
    bus: Bus,
    config: PredictConfig,
    rx: Option<mpsc::Receiver<AggregatorMsg>>,
    self_tx: mpsc::Sender<AggregatorMsg>,
    state: Option<EpochState>,
    shutdown: watch::Receiver<bool>,
}

impl Aggregator {
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        info!("prediction aggregator started");
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(AggregatorMsg::RoundUpdate(update)) => {
                            self.handle_round_update(update).await;
                        }
                        Some(AggregatorMsg::Bet(bet)) => {
                            self.handle_bet(bet).await;
                        }
                        Some(AggregatorMsg::FinalTick { epoch }) => {
                            self.handle_final_tick(epoch).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.state = None; // drops the pending timer
        info!("prediction aggregator stopped");
    }

    async fn handle_round_update(&mut self, update: RoundUpdate) {
        let is_new = self
            .state
            .as_ref()
            .map_or(true, |state| state.epoch != update.epoch);

        if is_new {
            self.reset_state(&update).await;
        }

        // (Re)schedule the final tick off the freshest lock time. The
        // previous timer for this epoch is always cancelled first.
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.lock_ms = update.lock_ts * 1000;
        if state.final_emitted {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let now = now_ms();
        if now >= state.lock_ms {
            return;
        }
        let delay = final_delay_ms(state.lock_ms, self.config.final_advance_ms, now);
        let tx = self.self_tx.clone();
        let epoch = state.epoch;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(AggregatorMsg::FinalTick { epoch }).await;
        }));
        debug!(epoch = epoch, delay_ms = delay, "final revision scheduled");
    }

    /// Fresh state for a new epoch: seed sums from the live-bet table
    /// (catches a late subscription) and load historical features.
    async fn reset_state(&mut self, update: &RoundUpdate) {
        let (up_sum, down_sum, total_sum) = match self.store.realbet_sums(update.epoch).await {
            Ok(sums) => sums,
            Err(e) => {
                warn!(epoch = update.epoch, error = %e, "realbet seed failed, starting empty");
                (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
            }
        };

        let history = match self
            .store
            .recent_round_features(self.config.history_rounds as i64)
            .await
        {
            Ok(features) => features,
            Err(e) => {
                // Degrade gracefully: scoring falls back to the flow ratio.
                warn!(epoch = update.epoch, error = %e, "feature fetch failed");
                Vec::new()
            }
        };

        let avg_up_ratio = if history.is_empty() {
            0.5
        } else {
            history.iter().map(|r| r.up_ratio).sum::<f64>() / history.len() as f64
        };
        let avg_volume = if history.is_empty() {
            Decimal::ZERO
        } else {
            history.iter().map(|r| r.total_amount).sum::<Decimal>()
                / Decimal::from(history.len() as u64)
        };

        info!(
            epoch = update.epoch,
            seeded_total = %total_sum,
            history_rounds = history.len(),
            "aggregator reset for new epoch"
        );

        self.state = Some(EpochState {
            epoch: update.epoch,
            lock_ms: update.lock_ts * 1000,
            up_sum,
            down_sum,
            total_sum,
            version: 0,
            last_emitted_ratio: None,
            last_bucket: None,
            last_emit_at: None,
            final_emitted: false,
            series: VecDeque::with_capacity(self.config.series_cap),
            history,
            avg_up_ratio,
            avg_volume,
            timer: None,
        });
    }

    async fn handle_bet(&mut self, bet: Bet) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if bet.epoch != state.epoch {
            // Older-epoch bets are dropped silently by contract; a newer
            // epoch waits for its round update.
            debug!(
                bet_epoch = bet.epoch,
                current = state.epoch,
                "dropping out-of-epoch bet"
            );
            return;
        }

        match bet.direction {
            crate::model::Direction::Up => state.up_sum += bet.amount,
            crate::model::Direction::Down => state.down_sum += bet.amount,
        }
        state.total_sum += bet.amount;

        let up_ratio = state.up_ratio();
        state.series.push_back((now_ms(), up_ratio, state.total_sum));
        while state.series.len() > self.config.series_cap {
            state.series.pop_front();
        }

        let bucket = volume_bucket(state.volume_ratio());
        if should_emit(state.last_emitted_ratio, state.last_bucket, up_ratio, bucket) {
            self.emit(false, false).await;
        }
    }

    async fn handle_final_tick(&mut self, epoch: u64) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if state.epoch != epoch || state.final_emitted {
            return;
        }
        state.final_emitted = true;
        self.emit(true, true).await;
    }

    /// Compute and publish one revision. Non-forced revisions are rate
    /// limited to one per interval.
    async fn emit(&mut self, force: bool, is_final: bool) {
        let min_interval = Duration::from_millis(self.config.min_emit_interval_ms);
        let ttl = self.config.prediction_cache_ttl_secs;
        let Some(state) = self.state.as_mut() else {
            return;
        };

        if !force && !is_final {
            if let Some(last) = state.last_emit_at {
                if last.elapsed() < min_interval {
                    return;
                }
            }
        }

        let now = now_ms();
        let up_ratio = state.up_ratio();
        let volume_ratio = state.volume_ratio();
        let slope_points: Vec<(i64, f64)> = state
            .series
            .iter()
            .filter(|(t, _, _)| now - t <= SLOPE_WINDOW_MS)
            .map(|(t, ratio, _)| (*t, *ratio))
            .collect();
        let features = FlowFeatures {
            up_ratio,
            up_ratio_diff: up_ratio - state.avg_up_ratio,
            volume_ratio,
            slope: regression_slope(&slope_points),
        };

        let mut signal =
            momentum::score(&state.history, features, state.total_sum, state.avg_volume);
        if is_final {
            signal.confidence = signal.confidence.final_lift();
        }

        state.version += 1;
        let prediction = Prediction {
            epoch: state.epoch,
            timestamp: now,
            version: state.version,
            is_final,
            strategies: Strategies { momentum: signal },
        };

        state.last_emitted_ratio = Some(up_ratio);
        state.last_bucket = Some(volume_bucket(volume_ratio));
        state.last_emit_at = Some(Instant::now());

        debug!(
            epoch = prediction.epoch,
            version = prediction.version,
            prediction = %prediction.strategies.momentum.prediction,
            confidence = %prediction.strategies.momentum.confidence,
            r#final = is_final,
            "prediction revision"
        );

        match serde_json::to_string(&prediction) {
            Ok(json) => {
                if let Err(e) = self.bus.publish(LIVE_PREDICTIONS_CHANNEL, &prediction).await {
                    warn!(error = %e, "prediction publish failed");
                }
                if let Err(e) = self.bus.cache_prediction(&json, ttl).await {
                    warn!(error = %e, "prediction cache failed");
                }
            }
            Err(e) => warn!(error = %e, "prediction serialise failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_bet_always_emits() {
        assert!(should_emit(None, None, 0.5, VolumeBucket::Base));
    }

    #[test]
    fn small_drift_does_not_emit() {
        assert!(!should_emit(
            Some(0.60),
            Some(VolumeBucket::Base),
            0.61,
            VolumeBucket::Base
        ));
    }

    #[test]
    fn ratio_delta_emits() {
        assert!(should_emit(
            Some(0.60),
            Some(VolumeBucket::Base),
            0.64,
            VolumeBucket::Base
        ));
    }

    #[test]
    fn midline_cross_emits() {
        assert!(should_emit(
            Some(0.51),
            Some(VolumeBucket::Base),
            0.49,
            VolumeBucket::Base
        ));
    }

    #[test]
    fn bucket_change_emits() {
        assert!(should_emit(
            Some(0.60),
            Some(VolumeBucket::Base),
            0.60,
            VolumeBucket::Mid
        ));
    }

    #[test]
    fn final_delay_matches_advance() {
        // lock in 10s, advance 5s → fire in 5s
        let now = 1_700_000_000_000;
        assert_eq!(final_delay_ms(now + 10_000, 5_000, now), 5_000);
    }

    #[test]
    fn final_delay_floors_near_lock() {
        let now = 1_700_000_000_000;
        // due 200ms from now → floored to 500ms
        assert_eq!(final_delay_ms(now + 5_200, 5_000, now), 500);
        // already past due → still 500ms
        assert_eq!(final_delay_ms(now + 3_000, 5_000, now), 500);
    }

    #[test]
    fn prediction_serialises_final_keyword() {
        let prediction = Prediction {
            epoch: 7,
            timestamp: 1_700_000_000_000,
            version: 3,
            is_final: true,
            strategies: Strategies {
                momentum: MomentumSignal {
                    prediction: crate::model::Direction::Up,
                    confidence: momentum::Confidence::High,
                    score: 2,
                    reasons: vec!["test".to_string()],
                    features: FlowFeatures {
                        up_ratio: 0.6,
                        up_ratio_diff: 0.1,
                        volume_ratio: 1.3,
                        slope: 0.01,
                    },
                },
            },
        };
        let json = serde_json::to_string(&prediction).unwrap();
        assert!(json.contains("\"final\":true"));
        assert!(json.contains("\"confidence\":\"high\""));
        let back: Prediction = serde_json::from_str(&json).unwrap();
        assert!(back.is_final);
        assert_eq!(back.version, 3);
    }
}
