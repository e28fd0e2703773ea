//! Postgres gateway for the persistent market view.
//!
//! Tables (schema documented externally, keys in the data model):
//!   round        → finalized rounds, keyed (start_time, epoch)
//!   hisbet       → historical bets, keyed (bet_time, tx_hash)
//!   realbet      → live bets on not-yet-finalized rounds, same key
//!   claim        → claims, keyed (block_number, wallet_address, bet_epoch)
//!   multiclaim   → whale summaries, keyed (epoch, wallet_address)
//!   epoch_done   → finalized-epoch markers
//!   failed_epoch → sync failures with retry accounting
//!   trade_log    → trader phase records (best-effort)
//!
//! All writes for one epoch's sync go through a single transaction; a
//! rollback leaves the store unchanged. Timestamps are stored Taipei-local
//! to match the partitioning scheme.

use crate::config::DatabaseConfig;
use crate::model::{
    taipei_naive, truncate_error, unix_from_taipei, Bet, Claim, FailedEpoch, MultiClaim, Round,
};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Age past `close_time` after which an epoch's live bets are pruned.
pub const REALBET_PRUNE_AGE_SECS: i64 = 600;

/// Failure modes of the epoch write transaction, separated so the sync
/// pipeline can tag the originating stage.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write verification failed: {0}")]
    Verification(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Row counts written by one epoch transaction, for verification and logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochWriteSummary {
    pub bet_rows: u64,
    pub claim_rows: u64,
    pub multi_claim_rows: u64,
    pub pruned_realbets: u64,
}

/// Per-epoch block statistics from stored bets, for range estimation.
#[derive(Debug, Clone, Copy)]
pub struct EpochBlockStats {
    pub bet_count: u64,
    pub min_block: u64,
    pub max_block: u64,
}

/// Features of one finalized round used by the prediction engine.
#[derive(Debug, Clone)]
pub struct RoundFeature {
    pub epoch: u64,
    pub up_ratio: f64,
    pub price_change: f64,
    pub total_amount: Decimal,
    pub result_up: bool,
}

/// Source of per-epoch block statistics. The block-range estimator works
/// against this seam so tests can substitute an in-memory store.
pub trait BlockStatSource {
    fn epoch_block_stats(
        &self,
        epoch: u64,
    ) -> impl std::future::Future<Output = Result<Option<EpochBlockStats>>> + Send;
}

/// Pooled Postgres store.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&database.url)
            .context("invalid database url")?
            .options([(
                "statement_timeout",
                format!("{}s", database.statement_timeout_secs),
            )]);
        let pool = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .acquire_timeout(Duration::from_secs(database.connect_timeout_secs))
            .connect_with(options)
            .await
            .context("connect to Postgres")?;
        info!(
            max_connections = database.max_connections,
            "connected to Postgres"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- Epoch sync write path ---

    /// Commit one finalized epoch atomically: round upsert, bet rows,
    /// claim rows, multi-claim rows, optional realbet prune, finalized
    /// marker, and in-transaction write verification.
    pub async fn write_epoch(
        &self,
        round: &Round,
        bets: &[Bet],
        claims: &[Claim],
        multi_claims: &[MultiClaim],
        prune_realbets: bool,
    ) -> Result<EpochWriteSummary, WriteError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = EpochWriteSummary::default();

        let result = round.result().to_string();
        sqlx::query(
            r#"
            INSERT INTO round (
                epoch, start_time, lock_time, close_time,
                lock_price, close_price, total_amount, up_amount, down_amount,
                result, up_payout, down_payout
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (start_time, epoch) DO UPDATE SET
                lock_price = EXCLUDED.lock_price,
                close_price = EXCLUDED.close_price,
                total_amount = EXCLUDED.total_amount,
                up_amount = EXCLUDED.up_amount,
                down_amount = EXCLUDED.down_amount,
                result = EXCLUDED.result,
                up_payout = EXCLUDED.up_payout,
                down_payout = EXCLUDED.down_payout
            "#,
        )
        .bind(round.epoch as i64)
        .bind(taipei_naive(round.start_time))
        .bind(taipei_naive(round.lock_time))
        .bind(taipei_naive(round.close_time))
        .bind(round.lock_price)
        .bind(round.close_price)
        .bind(round.total_amount)
        .bind(round.up_amount)
        .bind(round.down_amount)
        .bind(&result)
        .bind(round.up_payout())
        .bind(round.down_payout())
        .execute(&mut *tx)
        .await?;

        if !bets.is_empty() {
            let mut builder = QueryBuilder::new(
                "INSERT INTO hisbet (epoch, bet_time, wallet_address, direction, amount, \
                 block_number, tx_hash, result) ",
            );
            builder.push_values(bets, |mut b, bet| {
                b.push_bind(bet.epoch as i64)
                    .push_bind(taipei_naive(bet.bet_time))
                    .push_bind(&bet.wallet_address)
                    .push_bind(bet.direction.to_string())
                    .push_bind(bet.amount)
                    .push_bind(bet.block_number as i64)
                    .push_bind(&bet.tx_hash)
                    .push_bind(&result);
            });
            builder.push(" ON CONFLICT (bet_time, tx_hash) DO NOTHING");
            let done = builder.build().execute(&mut *tx).await?;
            summary.bet_rows = done.rows_affected();
        }

        if !claims.is_empty() {
            let mut builder = QueryBuilder::new(
                "INSERT INTO claim (epoch, bet_epoch, block_number, wallet_address, amount) ",
            );
            builder.push_values(claims, |mut b, claim| {
                b.push_bind(claim.epoch as i64)
                    .push_bind(claim.bet_epoch as i64)
                    .push_bind(claim.block_number as i64)
                    .push_bind(&claim.wallet_address)
                    .push_bind(claim.amount);
            });
            builder.push(" ON CONFLICT (block_number, wallet_address, bet_epoch) DO NOTHING");
            let done = builder
                .build()
                .execute(&mut *tx)
                .await?;
            summary.claim_rows = done.rows_affected();
        }

        if !multi_claims.is_empty() {
            let mut builder = QueryBuilder::new(
                "INSERT INTO multiclaim (epoch, wallet_address, bet_epochs, total_amount) ",
            );
            builder.push_values(multi_claims, |mut b, mc| {
                b.push_bind(mc.epoch as i64)
                    .push_bind(&mc.wallet_address)
                    .push_bind(mc.bet_epochs)
                    .push_bind(mc.total_amount);
            });
            builder.push(" ON CONFLICT (epoch, wallet_address) DO NOTHING");
            let done = builder
                .build()
                .execute(&mut *tx)
                .await?;
            summary.multi_claim_rows = done.rows_affected();
        }

        if prune_realbets {
            let done = sqlx::query("DELETE FROM realbet WHERE epoch = $1")
                .bind(round.epoch as i64)
                .execute(&mut *tx)
                .await?;
            summary.pruned_realbets = done.rows_affected();
        }

        sqlx::query(
            "INSERT INTO epoch_done (epoch, processed_at) VALUES ($1, now()) \
             ON CONFLICT (epoch) DO NOTHING",
        )
        .bind(round.epoch as i64)
        .execute(&mut *tx)
        .await?;

        // Write verification inside the same transaction: the round row,
        // the expected bet count, and the marker must all be visible.
        let round_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM round WHERE epoch = $1)")
                .bind(round.epoch as i64)
                .fetch_one(&mut *tx)
                .await?;
        let bet_count: i64 = sqlx::query_scalar("SELECT count(*) FROM hisbet WHERE epoch = $1")
            .bind(round.epoch as i64)
            .fetch_one(&mut *tx)
            .await?;
        let marker_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM epoch_done WHERE epoch = $1)")
                .bind(round.epoch as i64)
                .fetch_one(&mut *tx)
                .await?;
        if !round_exists || !marker_exists || bet_count < bets.len() as i64 {
            tx.rollback().await.ok();
            return Err(WriteError::Verification(format!(
                "round={round_exists} marker={marker_exists} bets={bet_count}/{}",
                bets.len()
            )));
        }

        tx.commit().await?;
        debug!(
            epoch = round.epoch,
            bets = summary.bet_rows,
            claims = summary.claim_rows,
            "epoch committed"
        );
        Ok(summary)
    }

    // --- Read helpers ---

    /// `(min_epoch, max_epoch, distinct_count)` of stored rounds, or None
    /// on an empty store.
    pub async fn boundaries(&self) -> Result<Option<(u64, u64, u64)>> {
        let row = sqlx::query(
            "SELECT min(epoch) AS min_epoch, max(epoch) AS max_epoch, \
             count(DISTINCT epoch) AS distinct_count FROM round",
        )
        .fetch_one(&self.pool)
        .await?;
        let min: Option<i64> = row.try_get("min_epoch")?;
        let max: Option<i64> = row.try_get("max_epoch")?;
        let count: i64 = row.try_get("distinct_count")?;
        Ok(match (min, max) {
            (Some(min), Some(max)) => Some((min as u64, max as u64, count as u64)),
            _ => None,
        })
    }

    /// Has the per-epoch sync committed this epoch?
    pub async fn is_finalized(&self, epoch: u64) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM epoch_done WHERE epoch = $1)")
                .bind(epoch as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// First `limit` epochs missing from an otherwise contiguous range.
    pub async fn missing_epochs(&self, limit: i64) -> Result<Vec<u64>> {
        let Some((min, max, distinct)) = self.boundaries().await? else {
            return Ok(Vec::new());
        };
        if distinct >= max - min + 1 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT gs.epoch FROM generate_series($1::bigint, $2::bigint) AS gs(epoch) \
             WHERE NOT EXISTS (SELECT 1 FROM round r WHERE r.epoch = gs.epoch) \
             ORDER BY gs.epoch LIMIT $3",
        )
        .bind(min as i64)
        .bind(max as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>("epoch") as u64)
            .collect())
    }

    // --- Failure accounting ---

    pub async fn failure_retry_count(&self, epoch: u64) -> Result<i32> {
        let count: Option<i32> =
            sqlx::query_scalar("SELECT retry_count FROM failed_epoch WHERE epoch = $1")
                .bind(epoch as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0))
    }

    /// Upsert the failed-epoch record, bumping its retry count.
    pub async fn record_failure(&self, epoch: u64, stage: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_epoch (epoch, error_message, stage, failed_at, retry_count)
            VALUES ($1, $2, $3, now(), 1)
            ON CONFLICT (epoch) DO UPDATE SET
                error_message = EXCLUDED.error_message,
                stage = EXCLUDED.stage,
                failed_at = EXCLUDED.failed_at,
                retry_count = failed_epoch.retry_count + 1
            "#,
        )
        .bind(epoch as i64)
        .bind(truncate_error(message))
        .bind(stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operator helper: recent failures, newest first.
    pub async fn failed_epochs(&self, limit: i64) -> Result<Vec<FailedEpoch>> {
        let rows = sqlx::query(
            "SELECT epoch, error_message, stage, failed_at, retry_count \
             FROM failed_epoch ORDER BY failed_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| FailedEpoch {
                epoch: row.get::<i64, _>("epoch") as u64,
                error_message: row.get("error_message"),
                stage: row.get("stage"),
                failed_at: row.get("failed_at"),
                retry_count: row.get("retry_count"),
            })
            .collect())
    }

    // --- Block statistics (range estimation + timestamp reuse) ---

    /// Any stored bet's time for a block, avoiding an RPC round trip.
    pub async fn bet_time_for_block(&self, block_number: u64) -> Result<Option<i64>> {
        let naive: Option<NaiveDateTime> =
            sqlx::query_scalar("SELECT bet_time FROM hisbet WHERE block_number = $1 LIMIT 1")
                .bind(block_number as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(naive.map(unix_from_taipei))
    }

    // --- Live bets ---

    /// Batch-insert live bets; duplicates are absorbed by the key.
    pub async fn insert_realbets(&self, bets: &[Bet]) -> Result<u64> {
        if bets.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut builder = QueryBuilder::new(
            "INSERT INTO realbet (epoch, bet_time, wallet_address, direction, amount, \
             block_number, tx_hash) ",
        );
        builder.push_values(bets, |mut b, bet| {
            b.push_bind(bet.epoch as i64)
                .push_bind(taipei_naive(bet.bet_time))
                .push_bind(&bet.wallet_address)
                .push_bind(bet.direction.to_string())
                .push_bind(bet.amount)
                .push_bind(bet.block_number as i64)
                .push_bind(&bet.tx_hash);
        });
        builder.push(" ON CONFLICT (bet_time, tx_hash) DO NOTHING");
        let done = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    /// Current (up, down, total) sums of an epoch's live bets, used to
    /// re-seed the aggregator after a late subscription.
    pub async fn realbet_sums(&self, epoch: u64) -> Result<(Decimal, Decimal, Decimal)> {
        let row = sqlx::query(
            "SELECT \
             coalesce(sum(amount) FILTER (WHERE direction = 'UP'), 0) AS up_sum, \
             coalesce(sum(amount) FILTER (WHERE direction = 'DOWN'), 0) AS down_sum, \
             coalesce(sum(amount), 0) AS total_sum \
             FROM realbet WHERE epoch = $1",
        )
        .bind(epoch as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get("up_sum"),
            row.get("down_sum"),
            row.get("total_sum"),
        ))
    }

    /// Standalone prune for epochs well past close.
    pub async fn prune_realbets(&self, epoch: u64) -> Result<u64> {
        let done = sqlx::query("DELETE FROM realbet WHERE epoch = $1")
            .bind(epoch as i64)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() > 0 {
            debug!(epoch = epoch, rows = done.rows_affected(), "pruned realbets");
        }
        Ok(done.rows_affected())
    }

    // --- Prediction features ---

    /// Last `n` finalized rounds, newest first, as prediction features.
    pub async fn recent_round_features(&self, n: i64) -> Result<Vec<RoundFeature>> {
        let rows = sqlx::query(
            "SELECT epoch, lock_price, close_price, total_amount, up_amount, result \
             FROM round ORDER BY epoch DESC LIMIT $1",
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            warn!(error = %e, "feature fetch failed");
            e
        })?;
        let mut features = Vec::with_capacity(rows.len());
        for row in rows {
            let lock_price: Decimal = row.get("lock_price");
            let close_price: Decimal = row.get("close_price");
            let total: Decimal = row.get("total_amount");
            let up: Decimal = row.get("up_amount");
            let result: String = row.get("result");
            let up_ratio = if total.is_zero() {
                0.5
            } else {
                decimal_to_f64(up / total)
            };
            let price_change = if lock_price.is_zero() {
                0.0
            } else {
                decimal_to_f64((close_price - lock_price) / lock_price)
            };
            features.push(RoundFeature {
                epoch: row.get::<i64, _>("epoch") as u64,
                up_ratio,
                price_change,
                total_amount: total,
                result_up: result == "UP",
            });
        }
        Ok(features)
    }

    // --- Trade log ---

    /// Best-effort append of a trader phase record.
    pub async fn insert_trade_log(
        &self,
        record: &crate::trader::TradeLogRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_log (
                epoch, phase, strategy, prediction, confidence, amount,
                delta_ms, t_stop, version, nonce, tx_hash,
                send_ms, mined_ms, total_ms, success, error, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, now())
            "#,
        )
        .bind(record.epoch as i64)
        .bind(&record.phase)
        .bind(&record.strategy)
        .bind(record.prediction.to_string())
        .bind(&record.confidence)
        .bind(record.amount)
        .bind(record.delta_ms as i64)
        .bind(record.t_stop)
        .bind(record.version as i64)
        .bind(record.nonce.map(|n| n as i64))
        .bind(&record.tx_hash)
        .bind(record.send_ms.map(|v| v as i64))
        .bind(record.mined_ms.map(|v| v as i64))
        .bind(record.total_ms.map(|v| v as i64))
        .bind(record.success)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl BlockStatSource for Store {
    async fn epoch_block_stats(&self, epoch: u64) -> Result<Option<EpochBlockStats>> {
        let row = sqlx::query(
            "SELECT count(*) AS bet_count, min(block_number) AS min_block, \
             max(block_number) AS max_block FROM hisbet WHERE epoch = $1",
        )
        .bind(epoch as i64)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("bet_count");
        let min: Option<i64> = row.try_get("min_block")?;
        let max: Option<i64> = row.try_get("max_block")?;
        Ok(match (min, max) {
            (Some(min), Some(max)) if count > 0 => Some(EpochBlockStats {
                bet_count: count as u64,
                min_block: min as u64,
                max_block: max as u64,
            }),
            _ => None,
        })
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}
