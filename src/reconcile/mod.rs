//! Historical reconciliation: rebuilding finalized rounds from chain reads.
//!
//! - `lock`: the per-epoch distributed lock shared by all workers
//! - `range`: data-driven block-range estimation from stored bets
//! - `sync`: the fetch-validate-parse-write-verify state machine
//! - `workers`: the forward / backward / gap worker trio

pub mod lock;
pub mod range;
pub mod sync;
pub mod workers;

pub use lock::EpochLock;
pub use range::{BlockRange, RangeEstimator};
pub use sync::{EpochSync, SkipReason, SyncOutcome};
pub use workers::ReconcileWorkers;
