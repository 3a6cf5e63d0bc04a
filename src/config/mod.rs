use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no factories configured — nothing to watch")]
    NoFactories,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    /// Factory contracts to watch for market creation events.
    #[serde(default)]
    pub factories: Vec<FactoryConfig>,
    pub oracle: OracleConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Primary WebSocket RPC URL for the market chain.
    pub ws_url: String,
    /// Fallback WebSocket URLs, rotated through on connection failures.
    #[serde(default)]
    pub fallback_ws_urls: Vec<String>,
    /// Signer private key (hex) - loaded from env KEEPER_PRIVATE_KEY
    #[serde(default)]
    pub private_key: String,
    /// Blocks to replay on connect to recover creation events missed
    /// while the process was down or disconnected.
    #[serde(default = "default_replay_blocks")]
    pub replay_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    /// Factory contract address.
    pub address: String,
    /// Which creation event signature this factory emits.
    #[serde(default)]
    pub version: FactoryVersion,
    /// Whether markets from this factory need the fee-token allowance
    /// guard before requesting a price.
    #[serde(default)]
    pub fee_guard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactoryVersion {
    #[default]
    V1,
    V2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Remote price feed contract address on the oracle-source chain.
    pub feed: String,
    /// Fee token (ERC-20) used to pay for bridge requests.
    #[serde(default)]
    pub fee_token: String,
    /// Bridge request timeout passed to requestPriceGet, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Bridge request fee in fee-token base units (decimal string).
    #[serde(default = "default_request_fee")]
    pub request_fee: String,
    /// Bridge indexer API base URL. Empty disables bridge status polling.
    #[serde(default)]
    pub indexer_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Max attempts per chain call before the task errors out.
    #[serde(default = "default_call_attempts")]
    pub call_attempts: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Pause after a successful close before requesting the price,
    /// giving the close time to settle.
    #[serde(default = "default_post_close_secs")]
    pub post_close_delay_secs: u64,
    /// Interval between resolution polls.
    #[serde(default = "default_poll_secs")]
    pub resolution_poll_secs: u64,
    /// Max wall-clock budget to wait for resolution before the task
    /// fails with a timeout classification.
    #[serde(default = "default_resolution_budget")]
    pub resolution_budget_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_replay_blocks() -> u64 {
    1_000
}
fn default_request_timeout() -> u64 {
    3_600
}
fn default_request_fee() -> String {
    "0".to_string()
}
fn default_call_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    2_000
}
fn default_post_close_secs() -> u64 {
    5
}
fn default_poll_secs() -> u64 {
    10
}
fn default_resolution_budget() -> u64 {
    1_800
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            call_attempts: default_call_attempts(),
            retry_base_ms: default_retry_base_ms(),
            post_close_delay_secs: default_post_close_secs(),
            resolution_poll_secs: default_poll_secs(),
            resolution_budget_secs: default_resolution_budget(),
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
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // The signer key never lives in the config file.
        if let Ok(key) = std::env::var("KEEPER_PRIVATE_KEY") {
            config.chain.private_key = key;
        }

        if config.factories.is_empty() {
            return Err(ConfigError::NoFactories);
        }

        Ok(config)
    }

    pub fn has_signer(&self) -> bool {
        !self.chain.private_key.is_empty()
    }
}
