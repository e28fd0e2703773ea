//! Typed access to the on-chain prediction market.
//!
//! - `abi`: the contract interface (calls + events) and topic verification
//! - `types`: decoded event/round shapes and fixed-point conversion
//! - `client`: provider construction, retrying calls, bet submission
//!
//! All addresses leave this module as 40-char lowercase hex; prices are
//! decoded at 8-decimal scale and amounts at 18-decimal scale.

pub mod abi;
pub mod client;
pub mod types;

pub use client::{BetReceipt, PredictionClient};
pub use types::{BetEvent, ClaimEvent, LedgerEntry};
