//! Contract interface for the UP/DOWN prediction market.
//!
//! We define the minimal surface we touch: the round/epoch read calls, the
//! two payable bet entrypoints, the per-wallet ledger, and the three event
//! filters used by both the live listener and the reconciliation sweep.

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    #[sol(rpc)]
    contract PredictionMarket {
        function currentEpoch() external view returns (uint256);
        function bufferSeconds() external view returns (uint256);
        function rounds(uint256 epoch) external view returns (
            uint256 roundEpoch,
            uint256 startTimestamp,
            uint256 lockTimestamp,
            uint256 closeTimestamp,
            int256 lockPrice,
            int256 closePrice,
            uint256 totalAmount,
            uint256 bullAmount,
            uint256 bearAmount
        );
        function ledger(uint256 epoch, address user) external view returns (
            uint8 position,
            uint256 amount,
            bool claimed
        );
        function betBull(uint256 epoch) external payable;
        function betBear(uint256 epoch) external payable;

        event BetBull(address indexed sender, uint256 indexed epoch, uint256 amount);
        event BetBear(address indexed sender, uint256 indexed epoch, uint256 amount);
        event Claim(address indexed sender, uint256 epoch, uint256 amount);
    }
}

/// Log filter for `BetBull(_, epoch)` over an inclusive block range.
pub fn bull_filter(contract: Address, epoch: u64, from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .address(contract)
        .event_signature(PredictionMarket::BetBull::SIGNATURE_HASH)
        .topic2(U256::from(epoch))
        .from_block(from_block)
        .to_block(to_block)
}

/// Log filter for `BetBear(_, epoch)` over an inclusive block range.
pub fn bear_filter(contract: Address, epoch: u64, from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .address(contract)
        .event_signature(PredictionMarket::BetBear::SIGNATURE_HASH)
        .topic2(U256::from(epoch))
        .from_block(from_block)
        .to_block(to_block)
}

/// Log filter for all `Claim` events over an inclusive block range.
pub fn claim_filter(contract: Address, from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .address(contract)
        .event_signature(PredictionMarket::Claim::SIGNATURE_HASH)
        .from_block(from_block)
        .to_block(to_block)
}

/// Subscription filter for live bet events (both sides, no range).
pub fn live_bet_filter(contract: Address) -> Filter {
    Filter::new().address(contract).event_signature(vec![
        PredictionMarket::BetBull::SIGNATURE_HASH,
        PredictionMarket::BetBear::SIGNATURE_HASH,
    ])
}

/// Verify the generated topic hashes against the event signatures.
/// Call this at startup to catch any interface drift.
pub fn verify_topic_hashes() -> Vec<(String, bool)> {
    let checks: Vec<(&str, B256)> = vec![
        (
            "BetBull(address,uint256,uint256)",
            PredictionMarket::BetBull::SIGNATURE_HASH,
        ),
        (
            "BetBear(address,uint256,uint256)",
            PredictionMarket::BetBear::SIGNATURE_HASH,
        ),
        (
            "Claim(address,uint256,uint256)",
            PredictionMarket::Claim::SIGNATURE_HASH,
        ),
    ];

    checks
        .into_iter()
        .map(|(sig, expected)| {
            let computed = keccak256(sig.as_bytes());
            (sig.to_string(), computed == expected)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_hashes_match_signatures() {
        for (sig, ok) in verify_topic_hashes() {
            assert!(ok, "topic hash mismatch for {sig}");
        }
    }
}
