//! Configuration section types

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Version tag included in the startup log
    pub tag: String,
    /// Quote currency for the symbol universe (e.g. USDT)
    pub quote_currency: String,
    /// Paper trading mode (simulated fills, no real orders)
    pub paper_trading: bool,
    /// Ranking cycle interval in seconds
    pub interval_secs: u64,
    /// Number of symbols to evaluate each cycle
    pub universe_size: usize,
    /// Maximum opportunities kept in the ranked list
    pub opportunity_limit: usize,
    /// Base assets used to pad the universe when exchanges return too few
    pub default_symbols: Vec<String>,
}

#[derive(Clone, Default, Deserialize)]
pub struct ExchangeCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Required by Coinbase and KuCoin
    #[serde(default)]
    pub passphrase: String,
}

impl ExchangeCredentials {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

impl fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("api_secret", &if self.api_secret.is_empty() { "" } else { "***" })
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangesConfig {
    /// Exchanges to build adapters for (binance, coinbase, kraken, kucoin, gemini, simulated)
    pub enabled: Vec<String>,
    /// Credentials keyed by exchange name
    #[serde(default)]
    pub credentials: HashMap<String, ExchangeCredentials>,
    /// Per-exchange query timeout in milliseconds
    pub query_timeout_ms: u64,
    /// Maximum attempts for idempotent requests
    pub max_retries: u32,
    /// First retry delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds
    pub retry_max_delay_ms: u64,
    /// How long an exchange stays unavailable after repeated failures
    pub cooldown_secs: u64,
}

impl ExchangesConfig {
    /// Credentials from config, falling back to `<NAME>_API_KEY` style variables
    pub fn credentials_for(&self, exchange: &str) -> ExchangeCredentials {
        if let Some(creds) = self.credentials.get(exchange) {
            if creds.is_configured() {
                return creds.clone();
            }
        }
        let prefix = exchange.to_uppercase();
        ExchangeCredentials {
            api_key: std::env::var(format!("{}_API_KEY", prefix)).unwrap_or_default(),
            api_secret: std::env::var(format!("{}_API_SECRET", prefix)).unwrap_or_default(),
            passphrase: std::env::var(format!("{}_PASSPHRASE", prefix)).unwrap_or_default(),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for ExchangesConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["simulated".to_string()],
            credentials: HashMap::new(),
            query_timeout_ms: 5000,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 8000,
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Max deviation from the median, in percent, before a snapshot is an outlier
    pub divergence_threshold_pct: f64,
    /// Consensus cache time-to-live in seconds
    pub cache_ttl_secs: u64,
    /// Candle interval for the strategy's history window
    pub history_timeframe: String,
    /// Candles requested per symbol
    pub history_limit: usize,
    /// Confidence multiplier applied to signals built on low-confidence consensus
    pub low_confidence_discount: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            divergence_threshold_pct: 5.0,
            cache_ttl_secs: 60,
            history_timeframe: "1h".to_string(),
            history_limit: 100,
            low_confidence_discount: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Strategy identifier (rsi, ma_crossover)
    pub name: String,
    /// Minimum confidence to appear in the ranked list (0.0 - 1.0)
    pub min_confidence: f64,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub ma_fast: usize,
    pub ma_slow: usize,
    /// sma | ema
    pub ma_type: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "rsi".to_string(),
            min_confidence: 0.4,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            ma_fast: 20,
            ma_slow: 50,
            ma_type: "sma".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskSettings {
    /// Maximum concurrent open positions
    pub max_positions: usize,
    /// Fraction of available capital allocated per position
    pub capital_fraction: f64,
    /// Starting capital in quote currency
    pub initial_capital: f64,
    /// low | medium | high (stop-loss / take-profit distance)
    pub risk_level: String,
    /// Taker fee as a fraction of notional
    pub taker_fee: f64,
    /// Smallest allocation worth placing, in quote currency
    pub min_order_value: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_positions: 3,
            capital_fraction: 0.2,
            initial_capital: 10_000.0,
            risk_level: "medium".to_string(),
            taker_fee: 0.001,
            min_order_value: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Enable CSV journal
    pub csv_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// pretty | json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
