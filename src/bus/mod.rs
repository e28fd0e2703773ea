//! Ephemeral pub/sub fan-out over Redis.
//!
//! Channels (tag → payload):
//!   round_update_channel → RoundUpdate
//!   instant_bet_channel  → {type: "instant_bet", data: Bet}
//!   analysis_channel     → {type: "analysis_request", bet: Bet}
//!   live_predictions     → prediction record (predict module)
//!   backtest_results     → strategy summary (collaborator-owned)
//!   trade_log            → trader phase record (trader module)
//!
//! No replay: late subscribers see only future messages. The one exception
//! is the latest prediction, which is additionally cached under a TTL key
//! so a late dashboard subscriber can fetch it.
//!
//! Publish and subscribe paths use independent connections to avoid
//! head-of-line blocking.

use crate::model::{Bet, Direction};
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const ROUND_UPDATE_CHANNEL: &str = "round_update_channel";
pub const INSTANT_BET_CHANNEL: &str = "instant_bet_channel";
pub const ANALYSIS_CHANNEL: &str = "analysis_channel";
pub const LIVE_PREDICTIONS_CHANNEL: &str = "live_predictions";
pub const BACKTEST_RESULTS_CHANNEL: &str = "backtest_results";
pub const TRADE_LOG_CHANNEL: &str = "trade_log";

/// Key caching the latest emitted prediction.
pub const PREDICTION_CACHE_KEY: &str = "live_predictions:latest";

/// Lifecycle of the current round as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoundStatus {
    Live,
    Locked,
    Ended,
}

/// Broadcast on every round poll and epoch transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundUpdate {
    pub epoch: u64,
    pub lock_ts: i64,
    pub close_ts: i64,
    pub up_amount: Decimal,
    pub down_amount: Decimal,
    pub total_amount: Decimal,
    pub status: RoundStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_price: Option<Decimal>,
}

/// Envelope for `instant_bet_channel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantBet {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Bet,
}

impl InstantBet {
    pub fn new(bet: Bet) -> Self {
        Self {
            kind: "instant_bet".to_string(),
            data: bet,
        }
    }
}

/// Envelope for `analysis_channel`, consumed by the wallet-analysis
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub bet: Bet,
}

impl AnalysisRequest {
    pub fn new(bet: Bet) -> Self {
        Self {
            kind: "analysis_request".to_string(),
            bet,
        }
    }
}

/// Publish-side handle.
#[derive(Clone)]
pub struct Bus {
    conn: MultiplexedConnection,
}

impl Bus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, "connected to Redis (publish)");
        Ok(Self { conn })
    }

    /// Serialize and publish. Failures are the caller's to decide on;
    /// most call sites treat bus publishes as best-effort.
    pub async fn publish<T: Serialize>(&mut self, channel: &str, payload: &T) -> anyhow::Result<()> {
        let json = serde_json::to_string(payload)?;
        let receivers: i64 = self.conn.publish(channel, &json).await?;
        debug!(channel = channel, receivers = receivers, "published");
        Ok(())
    }

    /// Cache the latest prediction JSON under a TTL so late subscribers
    /// can fetch it without waiting for the next revision.
    pub async fn cache_prediction(&mut self, json: &str, ttl_secs: u64) -> anyhow::Result<()> {
        self.conn
            .set_ex::<_, _, ()>(PREDICTION_CACHE_KEY, json, ttl_secs)
            .await?;
        Ok(())
    }

    pub async fn latest_prediction(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.conn.get(PREDICTION_CACHE_KEY).await?)
    }
}

/// Subscribe-side handle on its own connection.
pub struct Subscription {
    pubsub: redis::aio::PubSub,
}

impl Subscription {
    pub async fn connect(url: &str, channels: &[&str]) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }
        info!(channels = ?channels, "subscribed");
        Ok(Self { pubsub })
    }

    /// Next (channel, payload) pair; None when the connection drops.
    pub async fn next_message(&mut self) -> Option<(String, String)> {
        let mut stream = self.pubsub.on_message();
        let msg = stream.next().await?;
        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload().ok()?;
        Some((channel, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_update_serialises_status_uppercase() {
        let update = RoundUpdate {
            epoch: 419_131,
            lock_ts: 1_700_000_300,
            close_ts: 1_700_000_600,
            up_amount: dec!(3),
            down_amount: dec!(2),
            total_amount: dec!(5),
            status: RoundStatus::Live,
            result: None,
            close_price: None,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"status\":\"LIVE\""));
        assert!(!json.contains("result"));
    }

    #[test]
    fn instant_bet_envelope_tags_type() {
        let bet = Bet {
            epoch: 1,
            bet_time: 1_700_000_100,
            wallet_address: "ab".repeat(20),
            direction: Direction::Up,
            amount: dec!(0.5),
            block_number: 100,
            tx_hash: "cd".repeat(32),
        };
        let json = serde_json::to_string(&InstantBet::new(bet)).unwrap();
        assert!(json.contains("\"type\":\"instant_bet\""));
        let parsed: InstantBet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data.epoch, 1);
        assert_eq!(parsed.data.direction, Direction::Up);
    }
}
