//! Decoded chain data and fixed-point conversion.
//!
//! Contract prices are int256 at 1e8 scale; amounts are uint256 at 1e18
//! scale. Everything is normalised here into `Decimal` with 8-digit scale
//! so downstream arithmetic matches the stored precision.

use crate::model::Direction;
use alloy::primitives::{Address, B256, I256, U256};
use anyhow::{anyhow, Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// A decoded BetBull/BetBear event.
#[derive(Debug, Clone)]
pub struct BetEvent {
    pub epoch: u64,
    pub wallet_address: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub block_number: u64,
    pub tx_hash: String,
}

/// A decoded Claim event. The event's epoch field names the round being
/// claimed for, not the round the transaction landed in.
#[derive(Debug, Clone)]
pub struct ClaimEvent {
    pub bet_epoch: u64,
    pub wallet_address: String,
    pub amount: Decimal,
    pub block_number: u64,
    pub tx_hash: String,
}

/// A wallet's position in one round, from `ledger(epoch, addr)`.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub position: u8,
    pub amount: Decimal,
    pub claimed: bool,
}

impl LedgerEntry {
    /// A non-zero amount means the wallet already bet this round.
    pub fn has_bet(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

/// int256 oracle price (1e8 scale) → Decimal.
pub fn price_from_chain(value: I256) -> Result<Decimal> {
    let raw = i128::try_from(value).map_err(|_| anyhow!("price out of i128 range: {value}"))?;
    Decimal::try_from_i128_with_scale(raw, 8).context("price out of decimal range")
}

/// uint256 wei amount (1e18 scale) → Decimal rounded to 8 digits.
pub fn amount_from_wei(value: U256) -> Result<Decimal> {
    let raw = u128::try_from(value).map_err(|_| anyhow!("amount out of u128 range: {value}"))?;
    let full = Decimal::try_from_i128_with_scale(raw as i128, 18)
        .context("amount out of decimal range")?;
    Ok(full.round_dp(8))
}

/// Decimal market units → wei, truncating below 1e-18.
pub fn wei_from_amount(amount: Decimal) -> Result<U256> {
    let scaled = amount
        .checked_mul(Decimal::from_i128_with_scale(1_000_000_000_000_000_000, 0))
        .context("amount too large for wei conversion")?;
    let raw = scaled
        .trunc()
        .to_u128()
        .context("negative or oversized amount")?;
    Ok(U256::from(raw))
}

/// Lowercase 40-hex wallet form, no 0x prefix. Enforced at the boundary so
/// every persistent table sees one canonical spelling.
pub fn wallet_hex(address: &Address) -> String {
    format!("{address:x}")
}

/// Lowercase hex transaction hash, no 0x prefix.
pub fn tx_hex(hash: &B256) -> String {
    format!("{hash:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn price_decodes_at_8_decimals() {
        let raw = I256::from_str("25000000000").unwrap(); // 250.0
        assert_eq!(price_from_chain(raw).unwrap(), dec!(250));
        let raw = I256::from_str("25250000000").unwrap();
        assert_eq!(price_from_chain(raw).unwrap(), dec!(252.5));
    }

    #[test]
    fn amount_decodes_and_rounds_to_8() {
        let one_eth = U256::from(1_000_000_000_000_000_000u128);
        assert_eq!(amount_from_wei(one_eth).unwrap(), dec!(1));
        // 0.123456789123 rounds to 8 digits
        let dusty = U256::from(123_456_789_123_000_000u128);
        assert_eq!(amount_from_wei(dusty).unwrap(), dec!(0.12345679));
    }

    #[test]
    fn wei_round_trip() {
        let amount = dec!(0.001);
        let wei = wei_from_amount(amount).unwrap();
        assert_eq!(wei, U256::from(1_000_000_000_000_000u128));
        assert_eq!(amount_from_wei(wei).unwrap(), amount);
    }

    #[test]
    fn wallet_hex_is_lowercase_unprefixed() {
        let addr = Address::from_str("0xAbCdEf0123456789aBcDeF0123456789AbCdEf01").unwrap();
        let hex = wallet_hex(&addr);
        assert_eq!(hex.len(), 40);
        assert_eq!(hex, hex.to_lowercase());
        assert!(!hex.starts_with("0x"));
    }
}
