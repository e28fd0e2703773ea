//! The reconciliation worker trio.
//!
//! Forward keeps the store caught up to `current_epoch - 2`; backward
//! back-fills history toward epoch 1; gap re-scans for holes every half
//! hour. All three funnel into the same `EpochSync` and share its
//! distributed lock, so an epoch is never double-processed.

use crate::chain::PredictionClient;
use crate::config::SyncConfig;
use crate::reconcile::sync::{EpochSync, SkipReason, SyncOutcome};
use crate::store::Store;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Forward stops this many epochs short of the live one; those rounds are
/// not yet finalized on chain.
const FINALITY_MARGIN: u64 = 2;

const FORWARD_IDLE_SLEEP: Duration = Duration::from_secs(60);
const FORWARD_ERROR_SLEEP: Duration = Duration::from_secs(10);
const BACKWARD_START_DELAY: Duration = Duration::from_secs(30);
const BACKWARD_STEP_SLEEP: Duration = Duration::from_secs(2);
const BACKWARD_DONE_SLEEP: Duration = Duration::from_secs(300);
const GAP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const GAP_SCAN_LIMIT: i64 = 100;

pub struct ReconcileWorkers {
    sync: Arc<EpochSync>,
    store: Store,
    client: Arc<PredictionClient>,
    retry_max: u32,
    epoch_pace: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ReconcileWorkers {
    pub fn new(
        sync: Arc<EpochSync>,
        store: Store,
        client: Arc<PredictionClient>,
        config: &SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sync,
            store,
            client,
            retry_max: config.retry_max,
            epoch_pace: Duration::from_millis(config.rpc_call_delay_ms),
            shutdown,
        }
    }

    /// Spawn all three workers.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let forward = Worker {
            sync: self.sync.clone(),
            store: self.store.clone(),
            client: self.client.clone(),
            retry_max: self.retry_max,
            epoch_pace: self.epoch_pace,
            shutdown: self.shutdown.clone(),
        };
        let backward = forward.clone_parts();
        let gap = forward.clone_parts();

        vec![
            tokio::spawn(async move { forward.forward_loop().await }),
            tokio::spawn(async move { backward.backward_loop().await }),
            tokio::spawn(async move { gap.gap_loop().await }),
        ]
    }
}

struct Worker {
    sync: Arc<EpochSync>,
    store: Store,
    client: Arc<PredictionClient>,
    retry_max: u32,
    epoch_pace: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    fn clone_parts(&self) -> Self {
        Self {
            sync: self.sync.clone(),
            store: self.store.clone(),
            client: self.client.clone(),
            retry_max: self.retry_max,
            epoch_pace: self.epoch_pace,
            shutdown: self.shutdown.clone(),
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep, returning early (true) if shutdown fires.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.changed() => true,
        }
    }

    /// Skip checks shared by all three loops, then one sync attempt.
    /// Returns false when the epoch failed (so forward can abort its pass).
    async fn try_sync(&self, epoch: u64, tag: &str) -> bool {
        match self.store.is_finalized(epoch).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(worker = tag, epoch = epoch, error = %e, "marker check failed");
                return false;
            }
        }
        match self.store.failure_retry_count(epoch).await {
            Ok(count) if count >= self.retry_max as i32 => {
                debug!(
                    worker = tag,
                    epoch = epoch,
                    retries = count,
                    "epoch exhausted its retry budget, skipping"
                );
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(worker = tag, epoch = epoch, error = %e, "retry lookup failed");
                return false;
            }
        }

        match self.sync.sync_epoch(epoch).await {
            Ok(SyncOutcome::Done(_)) => true,
            Ok(SyncOutcome::Skipped(reason)) => {
                // A competing worker owns or finished the epoch.
                debug!(worker = tag, epoch = epoch, reason = %reason, "sync skipped");
                !matches!(reason, SkipReason::LockBusy)
            }
            Err(e) => {
                warn!(worker = tag, epoch = epoch, error = %e, "sync attempt failed");
                false
            }
        }
    }

    /// Forward catch-up: cover `(max_epoch, current_epoch - 2]`.
    async fn forward_loop(mut self) {
        info!("forward worker started");
        while !self.stopping() {
            match self.forward_pass().await {
                Ok(true) => {
                    if self.pause(FORWARD_IDLE_SLEEP).await {
                        break;
                    }
                }
                Ok(false) => {
                    if self.pause(self.epoch_pace).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "forward pass error");
                    if self.pause(FORWARD_ERROR_SLEEP).await {
                        break;
                    }
                }
            }
        }
        info!("forward worker stopped");
    }

    /// One forward pass. Ok(true) = caught up.
    async fn forward_pass(&mut self) -> anyhow::Result<bool> {
        let current = self.client.current_epoch().await?;
        let target = current.saturating_sub(FINALITY_MARGIN);
        if target == 0 {
            return Ok(true);
        }

        let boundaries = self.store.boundaries().await?;
        let first = match boundaries {
            Some((min_epoch, max_epoch, distinct)) if max_epoch >= target => {
                let failed = self.store.failed_epochs(GAP_SCAN_LIMIT).await?.len();
                info!(
                    min_epoch = min_epoch,
                    max_epoch = max_epoch,
                    distinct = distinct,
                    failed = failed,
                    "forward caught up"
                );
                return Ok(true);
            }
            Some((_, max_epoch, _)) => max_epoch + 1,
            // Empty store: seed from the target epoch alone. The range
            // estimator needs either a configured fallback range or a
            // manually seeded epoch to make progress from here.
            None => {
                warn!(
                    target = target,
                    "store is empty, attempting to seed from the newest finalized epoch"
                );
                target
            }
        };

        for epoch in first..=target {
            if self.stopping() {
                return Ok(true);
            }
            // A failed epoch keeps its retry budget; the sweep still
            // attempts every later epoch in the window.
            if !self.try_sync(epoch, "forward").await {
                debug!(epoch = epoch, "forward sweep continuing past failed epoch");
            }
            tokio::time::sleep(self.epoch_pace).await;
        }
        Ok(false)
    }

    /// Backward back-fill: extend coverage from `min_epoch - 1` down to 1.
    async fn backward_loop(mut self) {
        if self.pause(BACKWARD_START_DELAY).await {
            return;
        }
        info!("backward worker started");
        while !self.stopping() {
            let target = match self.store.boundaries().await {
                Ok(Some((min_epoch, _, _))) => min_epoch.saturating_sub(1),
                Ok(None) => {
                    // Nothing to extend from yet; forward seeds first.
                    if self.pause(FORWARD_IDLE_SLEEP).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "backward boundary read failed");
                    if self.pause(FORWARD_ERROR_SLEEP).await {
                        break;
                    }
                    continue;
                }
            };

            if target < 1 {
                debug!("backward reached epoch 1");
                if self.pause(BACKWARD_DONE_SLEEP).await {
                    break;
                }
                continue;
            }

            self.try_sync(target, "backward").await;
            if self.pause(BACKWARD_STEP_SLEEP).await {
                break;
            }
        }
        info!("backward worker stopped");
    }

    /// Gap scan: every half hour, sync the first missing epochs inside
    /// the covered range.
    async fn gap_loop(mut self) {
        if self.pause(GAP_INTERVAL).await {
            return;
        }
        info!("gap worker started");
        while !self.stopping() {
            match self.store.missing_epochs(GAP_SCAN_LIMIT).await {
                Ok(missing) if missing.is_empty() => {
                    debug!("no gaps found");
                }
                Ok(missing) => {
                    info!(count = missing.len(), "gap scan found missing epochs");
                    for epoch in missing {
                        if self.stopping() {
                            return;
                        }
                        self.try_sync(epoch, "gap").await;
                        tokio::time::sleep(self.epoch_pace).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "gap scan failed");
                }
            }
            if self.pause(GAP_INTERVAL).await {
                break;
            }
        }
        info!("gap worker stopped");
    }
}
