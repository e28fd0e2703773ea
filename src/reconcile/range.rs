//! Data-driven block-range estimation.
//!
//! Re-uses block numbers already persisted with bets to place a target
//! epoch's events, eliminating RPC search. An anchor epoch must have more
//! than five recorded bets so an under-populated round cannot skew the
//! width; the ±50 slack absorbs block-time jitter.

use crate::store::{BlockStatSource, EpochBlockStats};
use anyhow::Result;
use thiserror::Error;
use tracing::debug;

/// Blocks of slack added on both ends of an estimated range.
const RANGE_SLACK: u64 = 50;

/// An anchor epoch needs strictly more than this many stored bets.
const MIN_ANCHOR_BETS: u64 = 5;

/// How far (in epochs) we look for an anchor on either side.
const ANCHOR_WINDOW: u64 = 5;

/// How many epochs back of consecutive pairs feed the width estimate.
const PAIR_LOOKBACK: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from_block: u64,
    pub to_block: u64,
}

#[derive(Debug, Error)]
pub enum RangeError {
    #[error("no anchor epoch within 5 epochs of {0} and no fallback range configured")]
    NoAnchor(u64),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Estimator over any source of per-epoch block statistics.
pub struct RangeEstimator {
    blocks_per_epoch_default: u64,
    fallback: Option<BlockRange>,
}

impl RangeEstimator {
    pub fn new(blocks_per_epoch_default: u64, fallback: Option<BlockRange>) -> Self {
        Self {
            blocks_per_epoch_default,
            fallback,
        }
    }

    /// Estimate an inclusive block range wide enough to contain the
    /// target epoch's events. Deterministic for a given store state.
    pub async fn estimate<S: BlockStatSource + Sync>(
        &self,
        store: &S,
        epoch: u64,
    ) -> Result<BlockRange, RangeError> {
        // Forward anchor: smallest populated epoch above the target.
        for candidate in (epoch + 1)..=(epoch + ANCHOR_WINDOW) {
            let Some(stats) = usable_stats(store, candidate).await? else {
                continue;
            };
            let width = self.blocks_per_epoch(store, candidate).await?;
            let gap = width * (candidate - epoch);
            let range = BlockRange {
                from_block: stats.min_block.saturating_sub(gap + RANGE_SLACK),
                to_block: stats.min_block + RANGE_SLACK,
            };
            debug!(
                epoch = epoch,
                anchor = candidate,
                width = width,
                from = range.from_block,
                to = range.to_block,
                "range from forward anchor"
            );
            return Ok(range);
        }

        // Backward anchor: largest populated epoch below the target.
        let lowest = epoch.saturating_sub(ANCHOR_WINDOW).max(1);
        for candidate in (lowest..epoch).rev() {
            let Some(stats) = usable_stats(store, candidate).await? else {
                continue;
            };
            let width = self.blocks_per_epoch(store, candidate).await?;
            let gap = width * (epoch - candidate);
            let range = BlockRange {
                from_block: stats.max_block.saturating_sub(RANGE_SLACK),
                to_block: stats.max_block + gap + RANGE_SLACK,
            };
            debug!(
                epoch = epoch,
                anchor = candidate,
                width = width,
                from = range.from_block,
                to = range.to_block,
                "range from backward anchor"
            );
            return Ok(range);
        }

        match self.fallback {
            Some(range) => {
                debug!(epoch = epoch, "no anchor, using configured fallback range");
                Ok(range)
            }
            None => Err(RangeError::NoAnchor(epoch)),
        }
    }

    /// Width estimate: the maximum last-block delta over consecutive
    /// populated epoch pairs trailing the anchor. The maximum (not mean)
    /// is taken so a single slow round cannot under-shoot the range.
    async fn blocks_per_epoch<S: BlockStatSource + Sync>(
        &self,
        store: &S,
        anchor: u64,
    ) -> Result<u64, RangeError> {
        let lowest = anchor.saturating_sub(PAIR_LOOKBACK);
        let mut previous: Option<(u64, EpochBlockStats)> = None;
        let mut best: Option<u64> = None;

        for epoch in lowest..=anchor {
            let stats = usable_stats(store, epoch).await?;
            if let Some(stats) = stats {
                if let Some((prev_epoch, prev_stats)) = previous {
                    if epoch == prev_epoch + 1 {
                        let delta = stats.max_block.saturating_sub(prev_stats.max_block);
                        if delta > 0 {
                            best = Some(best.map_or(delta, |b| b.max(delta)));
                        }
                    }
                }
                previous = Some((epoch, stats));
            } else {
                previous = None;
            }
        }

        Ok(best.unwrap_or(self.blocks_per_epoch_default))
    }
}

async fn usable_stats<S: BlockStatSource + Sync>(
    store: &S,
    epoch: u64,
) -> Result<Option<EpochBlockStats>, RangeError> {
    let stats = store.epoch_block_stats(epoch).await?;
    Ok(stats.filter(|s| s.bet_count > MIN_ANCHOR_BETS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixtureStore {
        stats: HashMap<u64, EpochBlockStats>,
    }

    impl FixtureStore {
        fn new() -> Self {
            Self {
                stats: HashMap::new(),
            }
        }

        fn with_epoch(mut self, epoch: u64, bet_count: u64, min_block: u64, max_block: u64) -> Self {
            self.stats.insert(
                epoch,
                EpochBlockStats {
                    bet_count,
                    min_block,
                    max_block,
                },
            );
            self
        }
    }

    impl BlockStatSource for FixtureStore {
        async fn epoch_block_stats(&self, epoch: u64) -> Result<Option<EpochBlockStats>> {
            Ok(self.stats.get(&epoch).copied())
        }
    }

    /// Epochs 92..=102 populated, 400 blocks apart, except one 420 gap.
    fn populated_store() -> FixtureStore {
        let mut store = FixtureStore::new();
        let mut last = 6000u64;
        for epoch in 92..=102u64 {
            let step = if epoch == 97 { 420 } else { 400 };
            last += step;
            store = store.with_epoch(epoch, 10, last - 30, last);
        }
        store
    }

    #[tokio::test]
    async fn forward_anchor_uses_max_pair_delta() {
        let store = populated_store();
        let estimator = RangeEstimator::new(410, None);
        // target 100: forward anchor is 101
        let range = estimator.estimate(&store, 100).await.unwrap();
        let anchor_min = store.stats[&101].min_block;
        assert_eq!(range.to_block, anchor_min + 50);
        assert_eq!(range.from_block, anchor_min - 420 - 50);
    }

    #[tokio::test]
    async fn skips_underpopulated_forward_anchor() {
        // epoch 101 has too few bets; 102 becomes the anchor
        let mut store = populated_store();
        store.stats.get_mut(&101).unwrap().bet_count = 3;
        let estimator = RangeEstimator::new(410, None);
        let range = estimator.estimate(&store, 100).await.unwrap();
        let anchor_min = store.stats[&102].min_block;
        assert_eq!(range.to_block, anchor_min + 50);
        assert_eq!(range.from_block, anchor_min - 2 * 420 - 50);
    }

    #[tokio::test]
    async fn backward_anchor_when_no_forward() {
        let store = populated_store();
        let estimator = RangeEstimator::new(410, None);
        // target 105: no epochs above it, backward anchor is 102
        let range = estimator.estimate(&store, 105).await.unwrap();
        let anchor_max = store.stats[&102].max_block;
        assert_eq!(range.from_block, anchor_max - 50);
        assert_eq!(range.to_block, anchor_max + 3 * 420 + 50);
    }

    #[tokio::test]
    async fn default_width_without_pairs() {
        // a lone anchor epoch: no consecutive pairs to measure
        let store = FixtureStore::new().with_epoch(101, 10, 10_000, 10_030);
        let estimator = RangeEstimator::new(410, None);
        let range = estimator.estimate(&store, 100).await.unwrap();
        assert_eq!(range.from_block, 10_000 - 410 - 50);
        assert_eq!(range.to_block, 10_050);
    }

    #[tokio::test]
    async fn empty_store_fails_without_fallback() {
        let store = FixtureStore::new();
        let estimator = RangeEstimator::new(410, None);
        let err = estimator.estimate(&store, 100).await.unwrap_err();
        assert!(matches!(err, RangeError::NoAnchor(100)));
    }

    #[tokio::test]
    async fn empty_store_uses_configured_fallback() {
        let store = FixtureStore::new();
        let fallback = BlockRange {
            from_block: 500,
            to_block: 900,
        };
        let estimator = RangeEstimator::new(410, Some(fallback));
        assert_eq!(estimator.estimate(&store, 100).await.unwrap(), fallback);
    }

    #[tokio::test]
    async fn deterministic_for_same_state() {
        let store = populated_store();
        let estimator = RangeEstimator::new(410, None);
        let first = estimator.estimate(&store, 100).await.unwrap();
        let second = estimator.estimate(&store, 100).await.unwrap();
        assert_eq!(first, second);
    }
}
