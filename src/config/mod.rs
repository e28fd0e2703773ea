use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub predict: PredictConfig,
    #[serde(default)]
    pub trader: TraderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// HTTP JSON-RPC endpoint (request/response calls).
    pub rpc_url: String,
    /// WebSocket endpoint (event push socket).
    pub wss_url: String,
    /// Prediction market contract address.
    pub contract_addr: String,
    /// Trader signing key - loaded from env PRIVATE_KEY, never from file.
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection string.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Durable bet stream name.
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    /// Consumer group for the bet stream.
    #[serde(default = "default_group_name")]
    pub group_name: String,
    /// Consumer name within the group.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Max sync attempts per epoch before it is skipped permanently,
    /// and the cap on RPC retry attempts.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    /// Pause after each epoch's event queries to bound RPC pressure.
    #[serde(default = "default_rpc_call_delay_ms")]
    pub rpc_call_delay_ms: u64,
    /// Capacity of the block-timestamp and round-data LRU caches.
    #[serde(default = "default_cache_max")]
    pub cache_max: usize,
    /// Fallback blocks-per-epoch when the store has no usable pairs.
    #[serde(default = "default_blocks_per_epoch")]
    pub blocks_per_epoch_default: u64,
    /// TTL of the per-epoch processing lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Optional bootstrap block range for a store with no anchors yet.
    #[serde(default)]
    pub fallback_from_block: Option<u64>,
    #[serde(default)]
    pub fallback_to_block: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// Max messages per buffer read and per insert batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max time between batch flushes.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Blocking read timeout against the buffer.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Interval of the lightweight liveness read on the push socket.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Reconnect when no confirmed activity for this long.
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    /// Backoff before re-dialing the push socket.
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    /// Capacity of the listener's block-timestamp cache.
    #[serde(default = "default_listener_cache_max")]
    pub block_ts_cache: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictConfig {
    /// The final revision fires this long before betting lock.
    #[serde(default = "default_final_advance_ms")]
    pub final_advance_ms: u64,
    /// Minimum spacing between non-forced revisions.
    #[serde(default = "default_min_emit_interval_ms")]
    pub min_emit_interval_ms: u64,
    /// Cap on the per-epoch (t, up_ratio, total) series.
    #[serde(default = "default_series_cap")]
    pub series_cap: usize,
    /// Number of finalized rounds used for historical features.
    #[serde(default = "default_history_rounds")]
    pub history_rounds: usize,
    /// TTL of the latest-prediction cache key.
    #[serde(default = "default_prediction_cache_ttl")]
    pub prediction_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraderConfig {
    /// Master switch - when false every send path is a no-op.
    #[serde(default)]
    pub enabled: bool,
    /// Log intent without transacting.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Bet value in market units.
    #[serde(default = "default_trade_amount")]
    pub amount: Decimal,
    /// Drop non-final predictions below this confidence: low | medium | high.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: String,
    /// Only act on one side: UP | DOWN | any.
    #[serde(default = "default_side_filter")]
    pub side_filter: String,
    /// Offset before t_stop at which the transaction must be submitted.
    /// Defaults to predict.final_advance_ms when unset.
    #[serde(default)]
    pub delta_ms: Option<u64>,
    /// Multiplier on the current chain gas price.
    #[serde(default = "default_gas_bump")]
    pub gas_bump: f64,
    #[serde(default = "default_true")]
    pub arm_enabled: bool,
    #[serde(default = "default_arm_slope_min")]
    pub arm_slope_min: f64,
    #[serde(default = "default_arm_volume_min")]
    pub arm_volume_min: f64,
    #[serde(default = "default_arm_updiff_min")]
    pub arm_updiff_min: f64,
    #[serde(default = "default_arm_max_age_ms")]
    pub arm_max_age_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_max_connections() -> u32 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_statement_timeout() -> u64 {
    60
}
fn default_stream_name() -> String {
    "bet_stream".to_string()
}
fn default_group_name() -> String {
    "bet_processors".to_string()
}
fn default_consumer_name() -> String {
    "bet-consumer-1".to_string()
}
fn default_retry_max() -> u32 {
    3
}
fn default_rpc_call_delay_ms() -> u64 {
    200
}
fn default_cache_max() -> usize {
    5000
}
fn default_blocks_per_epoch() -> u64 {
    410
}
fn default_lock_ttl() -> u64 {
    300
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_block_ms() -> u64 {
    1000
}
fn default_heartbeat_secs() -> u64 {
    60
}
fn default_silence_timeout_secs() -> u64 {
    120
}
fn default_reconnect_backoff_secs() -> u64 {
    5
}
fn default_listener_cache_max() -> usize {
    1000
}
fn default_final_advance_ms() -> u64 {
    5000
}
fn default_min_emit_interval_ms() -> u64 {
    3000
}
fn default_series_cap() -> usize {
    50
}
fn default_history_rounds() -> usize {
    5
}
fn default_prediction_cache_ttl() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}
fn default_trade_amount() -> Decimal {
    Decimal::from_str("0.001").unwrap()
}
fn default_min_confidence() -> String {
    "high".to_string()
}
fn default_side_filter() -> String {
    "any".to_string()
}
fn default_gas_bump() -> f64 {
    1.2
}
fn default_arm_slope_min() -> f64 {
    0.05
}
fn default_arm_volume_min() -> f64 {
    1.5
}
fn default_arm_updiff_min() -> f64 {
    0.10
}
fn default_arm_max_age_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_max: default_retry_max(),
            rpc_call_delay_ms: default_rpc_call_delay_ms(),
            cache_max: default_cache_max(),
            blocks_per_epoch_default: default_blocks_per_epoch(),
            lock_ttl_secs: default_lock_ttl(),
            fallback_from_block: None,
            fallback_to_block: None,
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            block_ms: default_block_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            silence_timeout_secs: default_silence_timeout_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            block_ts_cache: default_listener_cache_max(),
        }
    }
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            final_advance_ms: default_final_advance_ms(),
            min_emit_interval_ms: default_min_emit_interval_ms(),
            series_cap: default_series_cap(),
            history_rounds: default_history_rounds(),
            prediction_cache_ttl_secs: default_prediction_cache_ttl(),
        }
    }
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
            amount: default_trade_amount(),
            min_confidence: default_min_confidence(),
            side_filter: default_side_filter(),
            delta_ms: None,
            gas_bump: default_gas_bump(),
            arm_enabled: true,
            arm_slope_min: default_arm_slope_min(),
            arm_volume_min: default_arm_volume_min(),
            arm_updiff_min: default_arm_updiff_min(),
            arm_max_age_ms: default_arm_max_age_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for
    /// secrets and deploy-specific endpoints (never stored in the file).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        Ok(config)
    }

    /// Load from `betflow.toml` if present, otherwise from env alone.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Path::new("betflow.toml");
        if path.exists() {
            Self::load(path)
        } else {
            Self::from_env()
        }
    }

    /// Build a config entirely from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let require =
            |key: &str| std::env::var(key).map_err(|_| ConfigError::MissingEnv(key.to_string()));

        let mut config = Config {
            chain: ChainConfig {
                rpc_url: require("RPC_URL")?,
                wss_url: require("WSS_URL")?,
                contract_addr: require("CONTRACT_ADDR")?,
                private_key: String::new(),
            },
            database: DatabaseConfig {
                url: require("DATABASE_URL")?,
                max_connections: default_max_connections(),
                connect_timeout_secs: default_connect_timeout(),
                statement_timeout_secs: default_statement_timeout(),
            },
            redis: RedisConfig {
                url: require("REDIS_URL")?,
                stream_name: default_stream_name(),
                group_name: default_group_name(),
                consumer_name: default_consumer_name(),
            },
            sync: SyncConfig::default(),
            live: LiveConfig::default(),
            predict: PredictConfig::default(),
            trader: TraderConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.overlay_env();
        Ok(config)
    }

    /// Environment variables always win over file values.
    fn overlay_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(url) = std::env::var("RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Ok(url) = std::env::var("WSS_URL") {
            self.chain.wss_url = url;
        }
        if let Ok(addr) = std::env::var("CONTRACT_ADDR") {
            self.chain.contract_addr = addr;
        }
        if let Ok(key) = std::env::var("PRIVATE_KEY") {
            self.chain.private_key = key;
        }
        if let Ok(v) = std::env::var("RETRY_MAX") {
            if let Ok(n) = v.parse() {
                self.sync.retry_max = n;
            }
        }
        if let Ok(v) = std::env::var("RPC_CALL_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.sync.rpc_call_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CACHE_MAX") {
            if let Ok(n) = v.parse() {
                self.sync.cache_max = n;
            }
        }
        if let Ok(v) = std::env::var("BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.live.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("FINAL_ADVANCE_MS") {
            if let Ok(n) = v.parse() {
                self.predict.final_advance_ms = n;
            }
        }
    }

    /// The trader's send offset, falling back to the predictor's final
    /// advance so both fire at the same point in the round by default.
    pub fn trader_delta_ms(&self) -> u64 {
        self.trader.delta_ms.unwrap_or(self.predict.final_advance_ms)
    }

    pub fn has_signing_key(&self) -> bool {
        !self.chain.private_key.is_empty()
    }
}

/// Initialise tracing for a worker binary. Level from config unless
/// RUST_LOG is set; optional JSON output for log shippers.
pub fn init_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let sync = SyncConfig::default();
        assert_eq!(sync.retry_max, 3);
        assert_eq!(sync.rpc_call_delay_ms, 200);
        assert_eq!(sync.cache_max, 5000);
        assert_eq!(sync.blocks_per_epoch_default, 410);
        assert_eq!(sync.lock_ttl_secs, 300);

        let trader = TraderConfig::default();
        assert!(!trader.enabled);
        assert!(trader.dry_run);
        assert_eq!(trader.min_confidence, "high");
        assert_eq!(trader.arm_max_age_ms, 30_000);
    }

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
            [chain]
            rpc_url = "http://localhost:8545"
            wss_url = "ws://localhost:8546"
            contract_addr = "0x0000000000000000000000000000000000000001"

            [database]
            url = "postgres://localhost/betflow"

            [redis]
            url = "redis://localhost"

            [trader]
            enabled = true
            dry_run = false
            amount = "0.002"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.trader.enabled);
        assert!(!config.trader.dry_run);
        assert_eq!(config.trader.amount, Decimal::from_str("0.002").unwrap());
        assert_eq!(config.live.batch_size, 100);
        assert_eq!(config.predict.final_advance_ms, 5000);
    }

    #[test]
    fn trader_delta_falls_back_to_final_advance() {
        let raw = r#"
            [chain]
            rpc_url = "http://localhost:8545"
            wss_url = "ws://localhost:8546"
            contract_addr = "0x0000000000000000000000000000000000000001"

            [database]
            url = "postgres://localhost/betflow"

            [redis]
            url = "redis://localhost"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.trader_delta_ms(), 5000);
    }
}
