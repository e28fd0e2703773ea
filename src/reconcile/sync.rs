//! Per-epoch sync: the fetch-validate-parse-write-verify state machine.
//!
//! One invocation finalizes one epoch. Any stage may short-circuit to a
//! stage-tagged failure (recorded in the failed-epoch table) or to a skip
//! (marker already present, lock busy). The distributed lock is released
//! on every path.

use crate::chain::types::{BetEvent, ClaimEvent};
use crate::chain::PredictionClient;
use crate::config::SyncConfig;
use crate::model::{derive_multi_claims, Bet, Claim, Round, SyncStage, TOTAL_TOLERANCE};
use crate::reconcile::lock::EpochLock;
use crate::reconcile::range::RangeEstimator;
use crate::store::{EpochWriteSummary, Store, WriteError, REALBET_PRUNE_AGE_SECS};

use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Pause after the three event queries, bounding RPC pressure.
const POST_QUERY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum SyncOutcome {
    Done(EpochWriteSummary),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyFinalized,
    LockBusy,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyFinalized => write!(f, "finalized"),
            SkipReason::LockBusy => write!(f, "locked"),
        }
    }
}

struct StageError {
    stage: SyncStage,
    source: anyhow::Error,
}

fn fail(stage: SyncStage, source: anyhow::Error) -> StageError {
    StageError { stage, source }
}

/// The sync engine shared by all reconciliation workers.
pub struct EpochSync {
    client: Arc<PredictionClient>,
    store: Store,
    lock: Arc<tokio::sync::Mutex<EpochLock>>,
    estimator: RangeEstimator,
    block_ts_cache: Mutex<LruCache<u64, u64>>,
    round_cache: Mutex<LruCache<u64, Round>>,
}

impl EpochSync {
    pub fn new(
        client: Arc<PredictionClient>,
        store: Store,
        lock: Arc<tokio::sync::Mutex<EpochLock>>,
        estimator: RangeEstimator,
        sync: &SyncConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(sync.cache_max.max(1)).expect("nonzero capacity");
        Self {
            client,
            store,
            lock,
            estimator,
            block_ts_cache: Mutex::new(LruCache::new(capacity)),
            round_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Finalize one epoch. Concurrency conflicts come back as skips, never
    /// errors; a returned Err means the store itself misbehaved.
    pub async fn sync_epoch(&self, epoch: u64) -> Result<SyncOutcome> {
        if self.store.is_finalized(epoch).await? {
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyFinalized));
        }

        let acquired = self.lock.lock().await.try_acquire(epoch).await;
        match acquired {
            Ok(true) => {}
            Ok(false) => return Ok(SyncOutcome::Skipped(SkipReason::LockBusy)),
            Err(e) => {
                self.report_failure(epoch, SyncStage::LockAcquire, &e).await;
                return Err(e);
            }
        }

        let result = self.run_stages(epoch).await;
        if let Err(e) = self.lock.lock().await.release(epoch).await {
            warn!(epoch = epoch, error = %e, "epoch lock release failed");
        }

        match result {
            Ok(summary) => {
                info!(
                    epoch = epoch,
                    bets = summary.bet_rows,
                    claims = summary.claim_rows,
                    multi_claims = summary.multi_claim_rows,
                    "epoch synced"
                );
                Ok(SyncOutcome::Done(summary))
            }
            Err(StageError { stage, source }) => {
                self.report_failure(epoch, stage, &source).await;
                Err(source.context(format!("epoch {epoch} failed at {stage}")))
            }
        }
    }

    async fn report_failure(&self, epoch: u64, stage: SyncStage, error: &anyhow::Error) {
        warn!(epoch = epoch, stage = %stage, error = %error, "epoch sync failed");
        if let Err(e) = self
            .store
            .record_failure(epoch, &stage.to_string(), &format!("{error:#}"))
            .await
        {
            warn!(epoch = epoch, error = %e, "could not record epoch failure");
        }
    }

    async fn run_stages(&self, epoch: u64) -> Result<EpochWriteSummary, StageError> {
        // FETCH_ROUND
        let round = self.fetch_round(epoch).await?;

        // FETCH_EVENTS
        let (bull_events, bear_events, claim_events) = self.fetch_events(epoch).await?;

        // VALIDATE
        validate(epoch, &round, &bull_events, &bear_events, &claim_events)
            .map_err(|e| fail(SyncStage::Validate, e))?;

        // PARSE
        let bets = self.parse_bets(&bull_events, &bear_events).await?;
        let claims = parse_claims(epoch, &claim_events);
        let multi_claims = derive_multi_claims(epoch, &claims);

        // VERIFY_TOTALS
        verify_totals(&round, &bets).map_err(|e| fail(SyncStage::VerifyTotals, e))?;

        // WRITE_TX + VERIFY_WRITE (one transaction, rollback on failure)
        let now = chrono::Utc::now().timestamp();
        let prune = now - round.close_time > REALBET_PRUNE_AGE_SECS;
        self.store
            .write_epoch(&round, &bets, &claims, &multi_claims, prune)
            .await
            .map_err(|e| match e {
                WriteError::Verification(msg) => {
                    fail(SyncStage::VerifyWrite, anyhow!("{msg}"))
                }
                WriteError::Database(e) => fail(SyncStage::WriteTx, e.into()),
            })
    }

    async fn fetch_round(&self, epoch: u64) -> Result<Round, StageError> {
        if let Some(round) = self.round_cache.lock().get(&epoch).cloned() {
            return Ok(round);
        }
        let round = self
            .client
            .round(epoch)
            .await
            .map_err(|e| fail(SyncStage::FetchRound, e))?;
        // Unfinalized values are never cached.
        if round.is_finalized() {
            self.round_cache.lock().put(epoch, round.clone());
        }
        Ok(round)
    }

    async fn fetch_events(
        &self,
        epoch: u64,
    ) -> Result<(Vec<BetEvent>, Vec<BetEvent>, Vec<ClaimEvent>), StageError> {
        let range = self
            .estimator
            .estimate(&self.store, epoch)
            .await
            .map_err(|e| fail(SyncStage::FetchEvents, e.into()))?;

        let (bulls, bears, claims) = tokio::join!(
            self.client.bet_events(
                crate::model::Direction::Up,
                epoch,
                range.from_block,
                range.to_block
            ),
            self.client.bet_events(
                crate::model::Direction::Down,
                epoch,
                range.from_block,
                range.to_block
            ),
            self.client.claim_events(range.from_block, range.to_block),
        );
        tokio::time::sleep(POST_QUERY_PAUSE).await;

        Ok((
            bulls.map_err(|e| fail(SyncStage::FetchEvents, e))?,
            bears.map_err(|e| fail(SyncStage::FetchEvents, e))?,
            claims.map_err(|e| fail(SyncStage::FetchEvents, e))?,
        ))
    }

    /// Resolve each bet's block timestamp: LRU cache, then any stored row
    /// for the block, then a chain read.
    async fn parse_bets(
        &self,
        bulls: &[BetEvent],
        bears: &[BetEvent],
    ) -> Result<Vec<Bet>, StageError> {
        let mut bets = Vec::with_capacity(bulls.len() + bears.len());
        for event in bulls.iter().chain(bears.iter()) {
            let bet_time = self
                .resolve_block_time(event.block_number)
                .await
                .map_err(|e| fail(SyncStage::Parse, e))?;
            bets.push(Bet {
                epoch: event.epoch,
                bet_time,
                wallet_address: event.wallet_address.clone(),
                direction: event.direction,
                amount: event.amount,
                block_number: event.block_number,
                tx_hash: event.tx_hash.clone(),
            });
        }
        Ok(bets)
    }

    async fn resolve_block_time(&self, block_number: u64) -> Result<i64> {
        if let Some(ts) = self.block_ts_cache.lock().get(&block_number).copied() {
            return Ok(ts as i64);
        }
        if let Some(ts) = self.store.bet_time_for_block(block_number).await? {
            self.block_ts_cache.lock().put(block_number, ts as u64);
            return Ok(ts);
        }
        let ts = self.client.block_timestamp(block_number).await?;
        self.block_ts_cache.lock().put(block_number, ts);
        Ok(ts as i64)
    }
}

/// 40 hex chars and not the zero address.
fn valid_wallet(wallet: &str) -> bool {
    wallet.len() == 40
        && wallet.bytes().all(|b| b.is_ascii_hexdigit())
        && wallet.bytes().any(|b| b != b'0')
}

/// All-or-nothing validation of the round and its event sets.
fn validate(
    epoch: u64,
    round: &Round,
    bulls: &[BetEvent],
    bears: &[BetEvent],
    claims: &[ClaimEvent],
) -> Result<()> {
    round.validate().map_err(|e| anyhow!("{e}"))?;

    if bulls.is_empty() {
        return Err(anyhow!("missing UP bets in range"));
    }
    if bears.is_empty() {
        return Err(anyhow!("missing DOWN bets in range"));
    }
    for event in bulls.iter().chain(bears.iter()) {
        if !valid_wallet(&event.wallet_address) {
            return Err(anyhow!(
                "invalid bet wallet {} in block {}",
                event.wallet_address,
                event.block_number
            ));
        }
        if event.amount <= Decimal::ZERO {
            return Err(anyhow!("non-positive bet amount in tx {}", event.tx_hash));
        }
    }

    if claims.is_empty() {
        return Err(anyhow!("no Claim events in range"));
    }
    for claim in claims {
        if claim.bet_epoch == 0 || claim.bet_epoch >= epoch {
            return Err(anyhow!(
                "claim for epoch {} outside (0, {epoch})",
                claim.bet_epoch
            ));
        }
        if claim.amount <= Decimal::ZERO {
            return Err(anyhow!("non-positive claim amount in tx {}", claim.tx_hash));
        }
        if !valid_wallet(&claim.wallet_address) {
            return Err(anyhow!("invalid claim wallet {}", claim.wallet_address));
        }
    }
    Ok(())
}

/// Claims dedup'd on the physical key before insert: one claim tx may
/// cover several bet epochs, and ranges can overlap between syncs.
fn parse_claims(epoch: u64, events: &[ClaimEvent]) -> Vec<Claim> {
    let mut seen: HashSet<(u64, String, u64)> = HashSet::new();
    let mut claims = Vec::with_capacity(events.len());
    for event in events {
        let key = (
            event.block_number,
            event.wallet_address.clone(),
            event.bet_epoch,
        );
        if seen.insert(key) {
            claims.push(Claim {
                epoch,
                bet_epoch: event.bet_epoch,
                block_number: event.block_number,
                wallet_address: event.wallet_address.clone(),
                amount: event.amount,
            });
        }
    }
    claims
}

/// Recompute sums from parsed bets and require agreement with the
/// chain-reported totals, plus tx-hash uniqueness.
fn verify_totals(round: &Round, bets: &[Bet]) -> Result<()> {
    let mut up_sum = Decimal::ZERO;
    let mut down_sum = Decimal::ZERO;
    let mut up_count = 0usize;
    let mut down_count = 0usize;
    let mut hashes: HashSet<&str> = HashSet::with_capacity(bets.len());

    for bet in bets {
        match bet.direction {
            crate::model::Direction::Up => {
                up_sum += bet.amount;
                up_count += 1;
            }
            crate::model::Direction::Down => {
                down_sum += bet.amount;
                down_count += 1;
            }
        }
        if !hashes.insert(&bet.tx_hash) {
            return Err(anyhow!("duplicate tx hash {}", bet.tx_hash));
        }
    }

    if up_count == 0 || down_count == 0 {
        return Err(anyhow!("missing UP/DOWN bets after parse"));
    }
    let total = up_sum + down_sum;
    if (up_sum - round.up_amount).abs() > TOTAL_TOLERANCE {
        return Err(anyhow!(
            "UP sum {up_sum} disagrees with chain total {}",
            round.up_amount
        ));
    }
    if (down_sum - round.down_amount).abs() > TOTAL_TOLERANCE {
        return Err(anyhow!(
            "DOWN sum {down_sum} disagrees with chain total {}",
            round.down_amount
        ));
    }
    if (total - round.total_amount).abs() > TOTAL_TOLERANCE {
        return Err(anyhow!(
            "bet sum {total} disagrees with chain total {}",
            round.total_amount
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;
    use rust_decimal_macros::dec;

    fn round() -> Round {
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

    fn bet_event(direction: Direction, amount: Decimal, tx: &str) -> BetEvent {
        BetEvent {
            epoch: 419_131,
            wallet_address: "ab".repeat(20),
            direction,
            amount,
            block_number: 33_000_000,
            tx_hash: tx.to_string(),
        }
    }

    fn claim_event(bet_epoch: u64, block: u64, wallet: &str) -> ClaimEvent {
        ClaimEvent {
            bet_epoch,
            wallet_address: wallet.to_string(),
            amount: dec!(0.5),
            block_number: block,
            tx_hash: "ff".repeat(32),
        }
    }

    #[test]
    fn validate_happy_path() {
        let bulls = vec![bet_event(Direction::Up, dec!(3), "01")];
        let bears = vec![bet_event(Direction::Down, dec!(2), "02")];
        let claims = vec![claim_event(419_000, 1, &"cd".repeat(20))];
        assert!(validate(419_131, &round(), &bulls, &bears, &claims).is_ok());
    }

    #[test]
    fn validate_requires_both_sides() {
        let bulls = vec![bet_event(Direction::Up, dec!(3), "01")];
        let claims = vec![claim_event(419_000, 1, &"cd".repeat(20))];
        let err = validate(419_131, &round(), &bulls, &[], &claims).unwrap_err();
        assert!(err.to_string().contains("missing DOWN"));
        let err = validate(419_131, &round(), &[], &bulls, &claims).unwrap_err();
        assert!(err.to_string().contains("missing UP"));
    }

    #[test]
    fn validate_rejects_future_claim() {
        let bulls = vec![bet_event(Direction::Up, dec!(3), "01")];
        let bears = vec![bet_event(Direction::Down, dec!(2), "02")];
        let claims = vec![claim_event(419_131, 1, &"cd".repeat(20))];
        assert!(validate(419_131, &round(), &bulls, &bears, &claims).is_err());
    }

    #[test]
    fn validate_rejects_zero_wallet() {
        let mut bad = bet_event(Direction::Up, dec!(3), "01");
        bad.wallet_address = "0".repeat(40);
        let bears = vec![bet_event(Direction::Down, dec!(2), "02")];
        let claims = vec![claim_event(419_000, 1, &"cd".repeat(20))];
        assert!(validate(419_131, &round(), &[bad], &bears, &claims).is_err());
    }

    #[test]
    fn claims_dedup_on_physical_key() {
        let wallet = "cd".repeat(20);
        let events = vec![
            claim_event(419_000, 1, &wallet),
            claim_event(419_000, 1, &wallet),
            claim_event(419_001, 1, &wallet),
        ];
        let claims = parse_claims(419_131, &events);
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn totals_must_match_chain() {
        let r = round();
        let bets = vec![
            Bet {
                epoch: r.epoch,
                bet_time: 1_700_000_100,
                wallet_address: "ab".repeat(20),
                direction: Direction::Up,
                amount: dec!(3),
                block_number: 1,
                tx_hash: "01".to_string(),
            },
            Bet {
                epoch: r.epoch,
                bet_time: 1_700_000_101,
                wallet_address: "ab".repeat(20),
                direction: Direction::Down,
                amount: dec!(1.5),
                block_number: 2,
                tx_hash: "02".to_string(),
            },
        ];
        let err = verify_totals(&r, &bets).unwrap_err();
        assert!(err.to_string().contains("DOWN sum"));
    }

    #[test]
    fn totals_reject_duplicate_tx() {
        let r = round();
        let bet = Bet {
            epoch: r.epoch,
            bet_time: 1_700_000_100,
            wallet_address: "ab".repeat(20),
            direction: Direction::Up,
            amount: dec!(1.5),
            block_number: 1,
            tx_hash: "01".to_string(),
        };
        let mut second = bet.clone();
        second.direction = Direction::Down;
        let err = verify_totals(&r, &[bet, second]).unwrap_err();
        assert!(err.to_string().contains("duplicate tx hash"));
    }
}
