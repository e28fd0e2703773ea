//! Chain client: typed calls, event queries, and bet submission.
//!
//! Read paths retry transient RPC failures with exponential backoff (base
//! 1 s, capped at the configured retry budget). The send path never
//! retries - missing a round is preferable to double-betting.

use crate::chain::abi::{self, PredictionMarket};
use crate::chain::types::{
    amount_from_wei, price_from_chain, tx_hex, wallet_hex, wei_from_amount, BetEvent, ClaimEvent,
    LedgerEntry,
};
use crate::config::ChainConfig;
use crate::model::{Direction, Round};

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Timing breakdown of a mined bet.
#[derive(Debug, Clone, Copy)]
pub struct BetReceipt {
    pub tx_hash: B256,
    /// Submission accepted by the node.
    pub send_ms: u64,
    /// Submission to inclusion.
    pub mined_ms: u64,
    pub total_ms: u64,
}

/// Typed handle on the prediction market contract.
pub struct PredictionClient {
    provider: DynProvider,
    contract: PredictionMarket::PredictionMarketInstance<DynProvider>,
    contract_addr: Address,
    signer_address: Option<Address>,
    retry_max: u32,
}

impl PredictionClient {
    /// Read-only client over the HTTP endpoint.
    pub fn connect(chain: &ChainConfig, retry_max: u32) -> Result<Self> {
        let contract_addr =
            Address::from_str(&chain.contract_addr).context("invalid contract address")?;
        let url = chain.rpc_url.parse().context("invalid RPC url")?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        let contract = PredictionMarket::new(contract_addr, provider.clone());
        Ok(Self {
            provider,
            contract,
            contract_addr,
            signer_address: None,
            retry_max,
        })
    }

    /// Signing client for the trader. The key comes from config (env-only)
    /// and is consumed here; it is never logged.
    pub fn connect_with_signer(chain: &ChainConfig, retry_max: u32) -> Result<Self> {
        let signer: alloy::signers::local::PrivateKeySigner =
            chain.private_key.parse().context("invalid private key")?;
        let signer_address = signer.address();
        let contract_addr =
            Address::from_str(&chain.contract_addr).context("invalid contract address")?;
        let url = chain.rpc_url.parse().context("invalid RPC url")?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        let contract = PredictionMarket::new(contract_addr, provider.clone());
        Ok(Self {
            provider,
            contract,
            contract_addr,
            signer_address: Some(signer_address),
            retry_max,
        })
    }

    /// Push-socket provider for event subscriptions.
    pub async fn connect_ws(wss_url: &str) -> Result<DynProvider> {
        let ws = WsConnect::new(wss_url);
        let provider = ProviderBuilder::new().connect_ws(ws).await?;
        Ok(provider.erased())
    }

    pub fn contract_address(&self) -> Address {
        self.contract_addr
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.signer_address
    }

    /// Retry a read with exponential backoff. Errors after the final
    /// attempt propagate to the caller.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry_max.max(1) {
                        return Err(e.context(format!("{label} failed after {attempt} attempts")));
                    }
                    warn!(
                        call = label,
                        attempt = attempt,
                        backoff_secs = delay.as_secs(),
                        error = %e,
                        "chain call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    pub async fn current_epoch(&self) -> Result<u64> {
        self.with_retry("currentEpoch", || async {
            let value = self.contract.currentEpoch().call().await?;
            to_u64(value, "currentEpoch")
        })
        .await
    }

    pub async fn buffer_seconds(&self) -> Result<u64> {
        self.with_retry("bufferSeconds", || async {
            let value = self.contract.bufferSeconds().call().await?;
            to_u64(value, "bufferSeconds")
        })
        .await
    }

    /// Round metadata by epoch. Unfinalized rounds come back with zero
    /// prices; callers decide whether to cache.
    pub async fn round(&self, epoch: u64) -> Result<Round> {
        self.with_retry("rounds", || async {
            let r = self.contract.rounds(U256::from(epoch)).call().await?;
            Ok(Round {
                epoch,
                start_time: to_u64(r.startTimestamp, "startTimestamp")? as i64,
                lock_time: to_u64(r.lockTimestamp, "lockTimestamp")? as i64,
                close_time: to_u64(r.closeTimestamp, "closeTimestamp")? as i64,
                lock_price: price_from_chain(r.lockPrice)?,
                close_price: price_from_chain(r.closePrice)?,
                total_amount: amount_from_wei(r.totalAmount)?,
                up_amount: amount_from_wei(r.bullAmount)?,
                down_amount: amount_from_wei(r.bearAmount)?,
            })
        })
        .await
    }

    /// A wallet's ledger entry for an epoch - detects a prior bet.
    pub async fn ledger(&self, epoch: u64, wallet: Address) -> Result<LedgerEntry> {
        self.with_retry("ledger", || async {
            let entry = self
                .contract
                .ledger(U256::from(epoch), wallet)
                .call()
                .await?;
            Ok(LedgerEntry {
                position: entry.position,
                amount: amount_from_wei(entry.amount)?,
                claimed: entry.claimed,
            })
        })
        .await
    }

    /// Next pending nonce for the signing wallet.
    pub async fn pending_nonce(&self) -> Result<u64> {
        let address = self
            .signer_address
            .ok_or_else(|| anyhow!("no signing key configured"))?;
        self.with_retry("pendingNonce", || async {
            let nonce = self
                .provider
                .get_transaction_count(address)
                .pending()
                .await?;
            Ok(nonce)
        })
        .await
    }

    pub async fn gas_price(&self) -> Result<u128> {
        self.with_retry("gasPrice", || async {
            Ok(self.provider.get_gas_price().await?)
        })
        .await
    }

    /// Submit a bet and wait for one confirmation. No retry on any path.
    pub async fn send_bet(
        &self,
        direction: Direction,
        epoch: u64,
        amount: rust_decimal::Decimal,
        nonce: Option<u64>,
        gas_price: Option<u128>,
    ) -> Result<BetReceipt> {
        if self.signer_address.is_none() {
            return Err(anyhow!("no signing key configured"));
        }
        let value = wei_from_amount(amount)?;
        let epoch_arg = U256::from(epoch);
        let started = std::time::Instant::now();

        let pending = match direction {
            Direction::Up => {
                let mut call = self.contract.betBull(epoch_arg).value(value);
                if let Some(n) = nonce {
                    call = call.nonce(n);
                }
                if let Some(gp) = gas_price {
                    call = call.gas_price(gp);
                }
                call.send().await.context("betBull send")?
            }
            Direction::Down => {
                let mut call = self.contract.betBear(epoch_arg).value(value);
                if let Some(n) = nonce {
                    call = call.nonce(n);
                }
                if let Some(gp) = gas_price {
                    call = call.gas_price(gp);
                }
                call.send().await.context("betBear send")?
            }
        };

        let send_ms = started.elapsed().as_millis() as u64;
        let tx_hash = pending.watch().await.context("bet confirmation")?;
        let total_ms = started.elapsed().as_millis() as u64;
        debug!(epoch = epoch, direction = %direction, tx = %tx_hash, total_ms = total_ms, "bet mined");
        Ok(BetReceipt {
            tx_hash,
            send_ms,
            mined_ms: total_ms.saturating_sub(send_ms),
            total_ms,
        })
    }

    /// Bet events for one side of one epoch over an inclusive block range.
    pub async fn bet_events(
        &self,
        direction: Direction,
        epoch: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<BetEvent>> {
        let filter = match direction {
            Direction::Up => abi::bull_filter(self.contract_addr, epoch, from_block, to_block),
            Direction::Down => abi::bear_filter(self.contract_addr, epoch, from_block, to_block),
        };
        let logs = self
            .with_retry("queryFilter(bets)", || async {
                Ok(self.provider.get_logs(&filter).await?)
            })
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let block_number = log.block_number.context("bet log without block number")?;
            let tx_hash = log
                .transaction_hash
                .context("bet log without tx hash")
                .map(|h| tx_hex(&h))?;
            let (sender, event_epoch, amount) = match direction {
                Direction::Up => {
                    let decoded = log
                        .log_decode::<PredictionMarket::BetBull>()
                        .context("decode BetBull")?;
                    let data = decoded.inner.data;
                    (data.sender, data.epoch, data.amount)
                }
                Direction::Down => {
                    let decoded = log
                        .log_decode::<PredictionMarket::BetBear>()
                        .context("decode BetBear")?;
                    let data = decoded.inner.data;
                    (data.sender, data.epoch, data.amount)
                }
            };
            events.push(BetEvent {
                epoch: to_u64(event_epoch, "bet epoch")?,
                wallet_address: wallet_hex(&sender),
                direction,
                amount: amount_from_wei(amount)?,
                block_number,
                tx_hash,
            });
        }
        Ok(events)
    }

    /// All Claim events over an inclusive block range.
    pub async fn claim_events(&self, from_block: u64, to_block: u64) -> Result<Vec<ClaimEvent>> {
        let filter = abi::claim_filter(self.contract_addr, from_block, to_block);
        let logs = self
            .with_retry("queryFilter(claims)", || async {
                Ok(self.provider.get_logs(&filter).await?)
            })
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let block_number = log.block_number.context("claim log without block number")?;
            let tx_hash = log
                .transaction_hash
                .context("claim log without tx hash")
                .map(|h| tx_hex(&h))?;
            let decoded = log
                .log_decode::<PredictionMarket::Claim>()
                .context("decode Claim")?;
            let data = decoded.inner.data;
            events.push(ClaimEvent {
                bet_epoch: to_u64(data.epoch, "claim epoch")?,
                wallet_address: wallet_hex(&data.sender),
                amount: amount_from_wei(data.amount)?,
                block_number,
                tx_hash,
            });
        }
        Ok(events)
    }

    /// Timestamp of a block, for bets whose time the store does not know.
    pub async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        self.with_retry("getBlock", || async {
            let block = self
                .provider
                .get_block_by_number(block_number.into())
                .await?
                .ok_or_else(|| anyhow!("block {block_number} not found"))?;
            Ok(block.header.timestamp)
        })
        .await
    }
}

fn to_u64(value: U256, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{what} out of u64 range: {value}"))
}
