//! Exchange configuration — pairs, deposits, fees, liquidity, margin.
//!
//! Loadable from TOML or assembled programmatically with the `with_*`
//! builders. Pair keys use the `BASE/QUOTE` form.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

use barflow_core::{Pair, PairInfo};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pair key `{0}`: expected BASE/QUOTE")]
    InvalidPair(String),
}

/// Top-level exchange configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Tradeable pairs keyed as `BASE/QUOTE`.
    #[serde(default)]
    pub pairs: BTreeMap<String, PairSettings>,

    /// Initial deposits per symbol.
    #[serde(default)]
    pub deposits: BTreeMap<String, Decimal>,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub liquidity: LiquidityConfig,

    /// Present only for margin exchange variants.
    #[serde(default)]
    pub margin: Option<MarginConfig>,
}

/// Per-pair precision settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PairSettings {
    pub base_precision: u32,
    pub quote_precision: u32,
}

impl From<PairSettings> for PairInfo {
    fn from(settings: PairSettings) -> Self {
        PairInfo::new(settings.base_precision, settings.quote_precision)
    }
}

/// Maker/taker fees in basis points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeConfig {
    #[serde(default)]
    pub maker_bps: Decimal,
    #[serde(default)]
    pub taker_bps: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self { maker_bps: Decimal::ZERO, taker_bps: Decimal::ZERO }
    }
}

/// Volume-share liquidity parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LiquidityConfig {
    /// Fraction of bar volume fillable per bar.
    #[serde(default = "default_volume_limit")]
    pub volume_limit: Decimal,
    /// Price impact at full bucket consumption.
    #[serde(default = "default_price_impact")]
    pub price_impact: Decimal,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self { volume_limit: default_volume_limit(), price_impact: default_price_impact() }
    }
}

fn default_volume_limit() -> Decimal {
    Decimal::new(25, 2)
}

fn default_price_impact() -> Decimal {
    Decimal::new(10, 2)
}

/// Margin lending settings. Cross margin leaves `borrow_limits` empty; the
/// isolated variant caps each symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginConfig {
    /// Hourly interest rate (fraction) for symbols without an override.
    #[serde(default = "default_hourly_rate")]
    pub default_hourly_rate: Decimal,

    #[serde(default)]
    pub hourly_rates: BTreeMap<String, Decimal>,

    #[serde(default)]
    pub borrow_limits: BTreeMap<String, Decimal>,

    /// Accrual callback cadence, in seconds of simulated time.
    #[serde(default = "default_accrual_period_secs")]
    pub accrual_period_secs: u64,

    /// Borrow automatically when an order's required funds fall short.
    #[serde(default = "default_auto_borrow")]
    pub auto_borrow: bool,
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            default_hourly_rate: default_hourly_rate(),
            hourly_rates: BTreeMap::new(),
            borrow_limits: BTreeMap::new(),
            accrual_period_secs: default_accrual_period_secs(),
            auto_borrow: default_auto_borrow(),
        }
    }
}

fn default_hourly_rate() -> Decimal {
    // 0.01% per hour.
    Decimal::new(1, 4)
}

fn default_accrual_period_secs() -> u64 {
    3_600
}

fn default_auto_borrow() -> bool {
    true
}

impl ExchangeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn with_pair(mut self, pair: &Pair, base_precision: u32, quote_precision: u32) -> Self {
        self.pairs.insert(pair.to_string(), PairSettings { base_precision, quote_precision });
        self
    }

    pub fn with_deposit(mut self, symbol: impl Into<String>, amount: Decimal) -> Self {
        self.deposits.insert(symbol.into(), amount);
        self
    }

    pub fn with_fees(mut self, maker_bps: Decimal, taker_bps: Decimal) -> Self {
        self.fees = FeeConfig { maker_bps, taker_bps };
        self
    }

    pub fn with_liquidity(mut self, volume_limit: Decimal, price_impact: Decimal) -> Self {
        self.liquidity = LiquidityConfig { volume_limit, price_impact };
        self
    }

    pub fn with_margin(mut self, margin: MarginConfig) -> Self {
        self.margin = Some(margin);
        self
    }

    /// Resolve the string-keyed pair table into typed pairs.
    pub fn pair_table(&self) -> Result<HashMap<Pair, PairInfo>, ConfigError> {
        let mut table = HashMap::new();
        for (key, settings) in &self.pairs {
            let (base, quote) = key
                .split_once('/')
                .filter(|(base, quote)| !base.is_empty() && !quote.is_empty())
                .ok_or_else(|| ConfigError::InvalidPair(key.clone()))?;
            table.insert(Pair::new(base, quote), PairInfo::from(*settings));
        }
        Ok(table)
    }
}
