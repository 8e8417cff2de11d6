use std::collections::HashMap;
use std::env;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fatal: the event provider (RPC or store) failed. Aborts the run.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// One malformed record. The record is dropped, the batch continues.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Protocol-wide fixed-point scale (1e18).
pub const SCALE: f64 = 1e18;

/// Seconds in a (non-leap) year, the annualization base.
pub const YEAR_SECONDS: f64 = 365.0 * 86400.0;

/// One raw event as emitted by the chain's log: key fields followed by data
/// fields. Position is meaning; there is no inherent schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub fields: Vec<String>,
}

/// One decoded `UpdateContext` observation for a market's collateral side.
/// All integer fields are fixed-point scaled (protocol 1e18 unless the field
/// carries its own `scale`).
#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub collateral_asset: String,
    pub total_collateral_shares: u128,
    pub total_nominal_debt: u128,
    pub reserve: u128,
    pub max_utilization: u128,
    pub floor: u128,
    pub scale: u128,
    pub is_legacy: bool,
    pub last_updated: u64,
    pub last_rate_accumulator: u128,
    pub last_full_utilization_rate: u128,
    pub fee_rate: u128,
    pub collateral_asset_price: Option<u128>,
}

/// Derived row, one per decoded event. Undefined metrics (missing predecessor,
/// zero supply, zero time delta) are `None`, never zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub market: String,
    pub timestamp: u64,
    pub debt: f64,
    pub supplied: f64,
    pub debt_usd: Option<f64>,
    pub supplied_usd: Option<f64>,
    pub utilization: Option<f64>,
    pub borrow_rate: Option<f64>,
    pub full_rate: f64,
}

/// Fixed asset-id -> market-symbol mapping. Lookups are case-exact; unmatched
/// assets are dropped by the decoder, never an error.
#[derive(Debug, Clone)]
pub struct MarketCatalog {
    assets: HashMap<String, String>,
}

impl MarketCatalog {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            assets: pairs
                .iter()
                .map(|(asset, market)| (asset.to_string(), market.to_string()))
                .collect(),
        }
    }

    /// The Vesu mainnet collateral assets.
    pub fn vesu_mainnet() -> Self {
        Self::new(&[
            (
                "0x53c91253bc9682c04929ca02ed00b3e423f6710d2ee7e0d5ebb06f3ecf368a8",
                "USDC",
            ),
            (
                "0x49d36570d4e46f48e99674bd3fcc84644ddd6b96f7c741b1562b82f9e004dc7",
                "ETH",
            ),
            (
                "0x68f5c6a61780768455de69077e07e89787839bf8166decfbf92b645209c0fb8",
                "USDT",
            ),
            (
                "0x4718f5a0fc34cc1af16a1cdee98ffb20c31f5cd61d6ab07201858f4287c938d",
                "STRK",
            ),
            (
                "0x3fe2b97c1fd336e750087d68b9b867997fd64a2661ff3ca5a7c771641e8e7ac",
                "WBTC",
            ),
            (
                "0x42b8f0484674ca266ac5d08e4ac6a3fe65bd3129795def2dca5c34ecc5f96d2",
                "wstETH",
            ),
        ])
    }

    pub fn market(&self, asset: &str) -> Option<&str> {
        self.assets.get(asset).map(String::as_str)
    }
}

/// Immutable protocol constants threaded through the pipeline instead of
/// module-level globals, so alternate catalogs/networks can be tested.
#[derive(Debug, Clone)]
pub struct ProtocolParams {
    pub scale: f64,
    pub seconds_per_year: f64,
    pub catalog: MarketCatalog,
}

impl ProtocolParams {
    pub fn vesu_mainnet() -> Self {
        Self {
            scale: SCALE,
            seconds_per_year: YEAR_SECONDS,
            catalog: MarketCatalog::vesu_mainnet(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rpc,
    Store,
}

#[derive(Clone)]
pub struct Config {
    pub rpc_endpoint: String,
    pub contract_address: String,
    pub event_key: String,
    pub from_block: u64,
    pub chunk_size: u64,
    pub start_token: Option<String>,
    pub store_path: String,
    pub window_start: u64,
    pub window_end: u64,
    pub trim_start_hours: u64,
    pub trim_end_hours: u64,
    pub out_dir: String,
    pub source: SourceKind,
    pub legacy_layout: bool,
}

impl Config {
    /// Build from environment variables (a `.env` file is honored by `main`).
    /// Only `VESU_ALCHEMY_KEY` is required when the RPC source is selected.
    pub fn from_env() -> Result<Self> {
        let source = match env_or("VESU_SOURCE", "rpc").as_str() {
            "rpc" => SourceKind::Rpc,
            "store" => SourceKind::Store,
            other => {
                return Err(PipelineError::Config(format!(
                    "VESU_SOURCE must be 'rpc' or 'store', got '{other}'"
                )))
            }
        };

        let rpc_endpoint = match env::var("VESU_RPC_ENDPOINT") {
            Ok(url) => url,
            Err(_) => {
                let key = env::var("VESU_ALCHEMY_KEY").unwrap_or_default();
                if key.is_empty() && source == SourceKind::Rpc {
                    return Err(PipelineError::Config(
                        "VESU_ALCHEMY_KEY (or VESU_RPC_ENDPOINT) is required for the rpc source"
                            .into(),
                    ));
                }
                format!("https://starknet-mainnet.g.alchemy.com/starknet/version/rpc/v0_7/{key}")
            }
        };

        Ok(Self {
            rpc_endpoint,
            contract_address: env_or(
                "VESU_SINGLETON_ADDRESS",
                "0x02545b2e5d519fc230e9cd781046d3a64e092114f07e44771e0d719d148725ef",
            ),
            event_key: env_or(
                "VESU_EVENT_KEY",
                "0xe623beb06d0cfbe7f7877cf06290a77c803ca8fde4b54a68b241607c7cc8cc",
            ),
            from_block: env_parse("VESU_FROM_BLOCK", 656_900)?,
            chunk_size: env_parse("VESU_CHUNK_SIZE", 1000)?,
            start_token: env::var("VESU_START_TOKEN").ok(),
            store_path: env_or("VESU_STORE_PATH", "./vesu_events.db"),
            window_start: env_parse("VESU_WINDOW_START", 0)?,
            window_end: env_parse("VESU_WINDOW_END", i64::MAX as u64)?,
            trim_start_hours: env_parse("VESU_TRIM_START_HOURS", 5)?,
            trim_end_hours: env_parse("VESU_TRIM_END_HOURS", 1)?,
            out_dir: env_or("VESU_OUT_DIR", "."),
            source,
            legacy_layout: env_or("VESU_LAYOUT", "current") == "legacy",
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| PipelineError::Config(format!("{name} must be an unsigned integer"))),
        Err(_) => Ok(default),
    }
}
