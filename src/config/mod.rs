//! Configuration management for RankBot
//!
//! Loads from optional config files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub exchanges: ExchangesConfig,
    pub market: MarketConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskSettings,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (RANKBOT__*)
            .add_source(Environment::with_prefix("RANKBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Defaults only, no files or environment
    pub fn defaults() -> Result<Self> {
        Self::builder()?
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            // Bot defaults
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.quote_currency", "USDT")?
            .set_default("bot.paper_trading", true)?
            .set_default("bot.interval_secs", 3600)?
            .set_default("bot.universe_size", 10)?
            .set_default("bot.opportunity_limit", 5)?
            .set_default(
                "bot.default_symbols",
                vec![
                    "BTC", "ETH", "SOL", "XRP", "ADA", "DOT", "BNB", "AVAX", "MATIC", "LINK",
                    "DOGE", "UNI",
                ],
            )?
            // Exchange defaults
            .set_default("exchanges.enabled", vec!["binance", "coinbase", "kraken"])?
            .set_default("exchanges.query_timeout_ms", 5000)?
            .set_default("exchanges.max_retries", 3)?
            .set_default("exchanges.retry_base_delay_ms", 1000)?
            .set_default("exchanges.retry_max_delay_ms", 8000)?
            .set_default("exchanges.cooldown_secs", 300)?
            // Market data defaults
            .set_default("market.divergence_threshold_pct", 5.0)?
            .set_default("market.cache_ttl_secs", 60)?
            .set_default("market.history_timeframe", "1h")?
            .set_default("market.history_limit", 100)?
            .set_default("market.low_confidence_discount", 0.5)?
            // Strategy defaults
            .set_default("strategy.name", "rsi")?
            .set_default("strategy.min_confidence", 0.4)?
            .set_default("strategy.rsi_period", 14)?
            .set_default("strategy.rsi_oversold", 30.0)?
            .set_default("strategy.rsi_overbought", 70.0)?
            .set_default("strategy.ma_fast", 20)?
            .set_default("strategy.ma_slow", 50)?
            .set_default("strategy.ma_type", "sma")?
            // Risk defaults
            .set_default("risk.max_positions", 3)?
            .set_default("risk.capital_fraction", 0.2)?
            .set_default("risk.initial_capital", 10_000.0)?
            .set_default("risk.risk_level", "medium")?
            .set_default("risk.taker_fee", 0.001)?
            .set_default("risk.min_order_value", 10.0)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?;
        Ok(builder)
    }

    /// Reject configurations that make aggregation or trading meaningless
    pub fn validate(&self) -> Result<()> {
        if self.exchanges.enabled.is_empty() {
            bail!("No exchanges configured (exchanges.enabled is empty)");
        }
        if self.risk.max_positions == 0 {
            bail!("risk.max_positions must be at least 1");
        }
        if !(self.risk.capital_fraction > 0.0 && self.risk.capital_fraction <= 1.0) {
            bail!(
                "risk.capital_fraction must be in (0, 1], got {}",
                self.risk.capital_fraction
            );
        }
        if !(0.0..=1.0).contains(&self.strategy.min_confidence) {
            bail!(
                "strategy.min_confidence must be in [0, 1], got {}",
                self.strategy.min_confidence
            );
        }
        if !(0.0..=1.0).contains(&self.market.low_confidence_discount) {
            bail!("market.low_confidence_discount must be in [0, 1]");
        }
        if self.market.divergence_threshold_pct <= 0.0 {
            bail!("market.divergence_threshold_pct must be positive");
        }
        if self.bot.interval_secs == 0 {
            bail!("bot.interval_secs must be positive");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} quote={} paper={} exchanges={:?} strategy={} min_conf={:.2} max_pos={} interval={}s",
            self.bot.tag,
            self.bot.quote_currency,
            self.bot.paper_trading,
            self.exchanges.enabled,
            self.strategy.name,
            self.strategy.min_confidence,
            self.risk.max_positions,
            self.bot.interval_secs
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::defaults().unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.bot.quote_currency, "USDT");
        assert_eq!(cfg.risk.max_positions, 3);
        assert_eq!(cfg.strategy.min_confidence, 0.4);
        assert_eq!(cfg.bot.default_symbols.len(), 12);
    }

    #[test]
    fn test_empty_exchange_list_is_fatal() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.exchanges.enabled.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_capital_fraction_bounds() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.risk.capital_fraction = 1.5;
        assert!(cfg.validate().is_err());
        cfg.risk.capital_fraction = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_digest_has_no_secrets() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.exchanges.credentials.insert(
            "binance".to_string(),
            ExchangeCredentials {
                api_key: "key123".to_string(),
                api_secret: "secret456".to_string(),
                passphrase: String::new(),
            },
        );
        let digest = cfg.to_string();
        assert!(!digest.contains("secret456"));
        assert!(!format!("{:?}", cfg.exchanges.credentials).contains("secret456"));
    }
}
