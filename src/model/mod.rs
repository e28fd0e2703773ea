//! Core entities of the prediction-market view and their invariants.
//!
//! Everything that crosses a component boundary lives here: rounds, bets,
//! claims, the derived multi-claim summaries, sync bookkeeping records,
//! and the shared validation rules applied before a round is committed.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payout share after the protocol fee (3%).
pub const REWARD_RATE: Decimal = dec!(0.97);

/// Tolerance on `|total - (up + down)|`.
pub const TOTAL_TOLERANCE: Decimal = dec!(0.001);

/// Hard validation bounds on oracle prices.
pub const PRICE_MIN: Decimal = dec!(50);
pub const PRICE_MAX: Decimal = dec!(5000);

/// A round rejecting a lock→close move larger than this fraction is
/// treated as corrupt chain data, not a real market move.
pub const MAX_PRICE_CHANGE: Decimal = dec!(0.20);

/// Round direction: which side of the price move a bet is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// A finalized betting round as read from the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub epoch: u64,
    pub start_time: i64,
    pub lock_time: i64,
    pub close_time: i64,
    pub lock_price: Decimal,
    pub close_price: Decimal,
    pub total_amount: Decimal,
    pub up_amount: Decimal,
    pub down_amount: Decimal,
}

#[derive(Debug, Error, PartialEq)]
pub enum RoundError {
    #[error("timestamps not strictly increasing")]
    Timestamps,
    #[error("price outside plausible range: {0}")]
    PriceRange(Decimal),
    #[error("price change > 20%")]
    PriceChange,
    #[error("negative amount")]
    NegativeAmount,
    #[error("total {total} != up {up} + down {down}")]
    TotalMismatch {
        total: Decimal,
        up: Decimal,
        down: Decimal,
    },
    #[error("all amounts zero")]
    AllZero,
}

impl Round {
    /// UP iff close_price > lock_price.
    pub fn result(&self) -> Direction {
        if self.close_price > self.lock_price {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    /// Multiplier paid to the winning UP side; 0 when nobody bet UP.
    pub fn up_payout(&self) -> Decimal {
        if self.up_amount.is_zero() {
            Decimal::ZERO
        } else {
            (REWARD_RATE * self.total_amount / self.up_amount).round_dp(8)
        }
    }

    /// Multiplier paid to the winning DOWN side; 0 when nobody bet DOWN.
    pub fn down_payout(&self) -> Decimal {
        if self.down_amount.is_zero() {
            Decimal::ZERO
        } else {
            (REWARD_RATE * self.total_amount / self.down_amount).round_dp(8)
        }
    }

    /// Both prices set and totals consistent.
    pub fn is_finalized(&self) -> bool {
        self.lock_price > Decimal::ZERO
            && self.close_price > Decimal::ZERO
            && (self.total_amount - (self.up_amount + self.down_amount)).abs() <= TOTAL_TOLERANCE
    }

    /// The round-level validation rules. Event-level rules (non-empty bet
    /// sets, claim sanity) are applied by the sync pipeline which holds the
    /// event data.
    pub fn validate(&self) -> Result<(), RoundError> {
        if !(self.start_time < self.lock_time && self.lock_time < self.close_time) {
            return Err(RoundError::Timestamps);
        }
        for price in [self.lock_price, self.close_price] {
            if price <= PRICE_MIN || price >= PRICE_MAX {
                return Err(RoundError::PriceRange(price));
            }
        }
        if ((self.close_price - self.lock_price) / self.lock_price).abs() > MAX_PRICE_CHANGE {
            return Err(RoundError::PriceChange);
        }
        if self.total_amount < Decimal::ZERO
            || self.up_amount < Decimal::ZERO
            || self.down_amount < Decimal::ZERO
        {
            return Err(RoundError::NegativeAmount);
        }
        if (self.total_amount - (self.up_amount + self.down_amount)).abs() > TOTAL_TOLERANCE {
            return Err(RoundError::TotalMismatch {
                total: self.total_amount,
                up: self.up_amount,
                down: self.down_amount,
            });
        }
        if self.total_amount.is_zero() && self.up_amount.is_zero() && self.down_amount.is_zero() {
            return Err(RoundError::AllZero);
        }
        Ok(())
    }
}

/// A single bet, live or historical. Identity is `(bet_time, tx_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub epoch: u64,
    /// Unix seconds of the block carrying the bet.
    pub bet_time: i64,
    /// 40 lowercase hex chars, no 0x prefix.
    pub wallet_address: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub block_number: u64,
    pub tx_hash: String,
}

/// A claim row. `epoch` is the round during which the claim transaction
/// landed; `bet_epoch` is the round being claimed for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub epoch: u64,
    pub bet_epoch: u64,
    pub block_number: u64,
    pub wallet_address: String,
    pub amount: Decimal,
}

/// Per-epoch whale summary: wallets whose claim activity in the epoch
/// crossed the multi-claim threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiClaim {
    pub epoch: u64,
    pub wallet_address: String,
    pub bet_epochs: i64,
    pub total_amount: Decimal,
}

/// Distinct bet-epochs claimed at or above this marks a whale...
pub const MULTI_CLAIM_MIN_EPOCHS: usize = 5;
/// ...as does a claim sum at or above this.
pub const MULTI_CLAIM_MIN_AMOUNT: Decimal = dec!(1);

/// Recompute the epoch's multi-claim rows from its claim set.
pub fn derive_multi_claims(epoch: u64, claims: &[Claim]) -> Vec<MultiClaim> {
    use std::collections::{BTreeMap, BTreeSet};

    let mut per_wallet: BTreeMap<&str, (BTreeSet<u64>, Decimal)> = BTreeMap::new();
    for claim in claims {
        let entry = per_wallet
            .entry(claim.wallet_address.as_str())
            .or_insert_with(|| (BTreeSet::new(), Decimal::ZERO));
        entry.0.insert(claim.bet_epoch);
        entry.1 += claim.amount;
    }

    per_wallet
        .into_iter()
        .filter(|(_, (epochs, total))| {
            epochs.len() >= MULTI_CLAIM_MIN_EPOCHS || *total >= MULTI_CLAIM_MIN_AMOUNT
        })
        .map(|(wallet, (epochs, total))| MultiClaim {
            epoch,
            wallet_address: wallet.to_string(),
            bet_epochs: epochs.len() as i64,
            total_amount: total,
        })
        .collect()
}

/// Stage of the per-epoch sync at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    LockAcquire,
    FetchRound,
    FetchEvents,
    Validate,
    Parse,
    VerifyTotals,
    WriteTx,
    VerifyWrite,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            SyncStage::LockAcquire => "lock_acquire",
            SyncStage::FetchRound => "fetch_round",
            SyncStage::FetchEvents => "fetch_events",
            SyncStage::Validate => "validate",
            SyncStage::Parse => "parse",
            SyncStage::VerifyTotals => "verify_totals",
            SyncStage::WriteTx => "write_tx",
            SyncStage::VerifyWrite => "verify_write",
        };
        write!(f, "{tag}")
    }
}

/// A sync attempt that aborted, with its retry budget consumption.
#[derive(Debug, Clone)]
pub struct FailedEpoch {
    pub epoch: u64,
    pub error_message: String,
    pub stage: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: i32,
}

/// Error messages are truncated before persisting.
pub const MAX_ERROR_LEN: usize = 500;

pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        let mut end = MAX_ERROR_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}

/// Taipei has no DST; a fixed +08:00 offset is exact year-round.
fn taipei_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("static offset")
}

/// Unix seconds → Taipei-local naive timestamp for partitioned columns.
pub fn taipei_naive(unix_secs: i64) -> NaiveDateTime {
    taipei_offset()
        .timestamp_opt(unix_secs, 0)
        .single()
        .map(|dt| dt.naive_local())
        .unwrap_or_default()
}

/// Unix seconds → `YYYY-MM-DD HH:MM:SS` in Taipei local time.
pub fn taipei_str(unix_secs: i64) -> String {
    taipei_naive(unix_secs).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Inverse of `taipei_naive`, for timestamps read back from the store.
pub fn unix_from_taipei(naive: NaiveDateTime) -> i64 {
    naive.and_utc().timestamp() - 8 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_round() -> Round {
        Round {
            epoch: 419_131,
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
    fn result_follows_close_vs_lock() {
        let mut round = sample_round();
        assert_eq!(round.result(), Direction::Up);
        round.close_price = dec!(249);
        assert_eq!(round.result(), Direction::Down);
        // equal prices settle DOWN
        round.close_price = round.lock_price;
        assert_eq!(round.result(), Direction::Down);
    }

    #[test]
    fn payouts_split_the_fee_adjusted_pool() {
        let round = sample_round();
        assert_eq!(round.up_payout(), dec!(1.61666667));
        assert_eq!(round.down_payout(), dec!(2.425));
    }

    #[test]
    fn zero_side_pays_zero() {
        let mut round = sample_round();
        round.up_amount = Decimal::ZERO;
        round.down_amount = dec!(5);
        assert_eq!(round.up_payout(), Decimal::ZERO);
    }

    #[test]
    fn validate_rejects_out_of_order_timestamps() {
        let mut round = sample_round();
        round.lock_time = round.start_time;
        assert_eq!(round.validate(), Err(RoundError::Timestamps));
    }

    #[test]
    fn validate_rejects_big_price_move() {
        let mut round = sample_round();
        round.close_price = dec!(500);
        assert_eq!(round.validate(), Err(RoundError::PriceChange));
    }

    #[test]
    fn validate_rejects_total_mismatch() {
        let mut round = sample_round();
        round.total_amount = dec!(5.01);
        assert!(matches!(
            round.validate(),
            Err(RoundError::TotalMismatch { .. })
        ));
    }

    #[test]
    fn validate_accepts_tolerance_slack() {
        let mut round = sample_round();
        round.total_amount = dec!(5.0009);
        assert!(round.validate().is_ok());
    }

    #[test]
    fn multi_claim_threshold() {
        let wallet_a = "a".repeat(40);
        let wallet_b = "b".repeat(40);
        let wallet_c = "c".repeat(40);
        let mut claims = Vec::new();
        // wallet a: 5 distinct bet epochs, small amounts
        for bet_epoch in 100..105 {
            claims.push(Claim {
                epoch: 200,
                bet_epoch,
                block_number: 1,
                wallet_address: wallet_a.clone(),
                amount: dec!(0.01),
            });
        }
        // wallet b: one big claim
        claims.push(Claim {
            epoch: 200,
            bet_epoch: 150,
            block_number: 2,
            wallet_address: wallet_b.clone(),
            amount: dec!(1.5),
        });
        // wallet c: under both thresholds
        claims.push(Claim {
            epoch: 200,
            bet_epoch: 151,
            block_number: 3,
            wallet_address: wallet_c.clone(),
            amount: dec!(0.5),
        });

        let rows = derive_multi_claims(200, &claims);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.wallet_address == wallet_a));
        assert!(rows.iter().any(|r| r.wallet_address == wallet_b));
    }

    #[test]
    fn taipei_formatting() {
        // 2023-11-14 22:13:20 UTC == 2023-11-15 06:13:20 +08:00
        assert_eq!(taipei_str(1_700_000_000), "2023-11-15 06:13:20");
    }

    #[test]
    fn taipei_round_trip() {
        let unix = 1_700_000_000;
        assert_eq!(unix_from_taipei(taipei_naive(unix)), unix);
    }

    #[test]
    fn error_truncation() {
        let long = "x".repeat(600);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn direction_parse_round_trip() {
        assert_eq!(Direction::from_str("UP").unwrap(), Direction::Up);
        assert_eq!(Direction::from_str("down").unwrap(), Direction::Down);
        assert!(Direction::from_str("SIDEWAYS").is_err());
    }
}
