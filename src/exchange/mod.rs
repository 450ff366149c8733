//! Exchange adapters - uniform capability interface over heterogeneous exchange APIs
//!
//! Every concrete exchange translates canonical `BASE/QUOTE` symbols into its
//! own wire format and maps its failures onto [`ExchangeError`]. Callers only
//! ever see `Arc<dyn ExchangeAdapter>`.

mod binance;
mod coinbase;
mod disabled;
mod gemini;
mod http;
mod kraken;
mod kucoin;
mod paper;
mod registry;
mod retry;
mod signing;
mod simulated;

pub use binance::BinanceAdapter;
pub use coinbase::CoinbaseAdapter;
pub use disabled::DisabledExchange;
pub use gemini::GeminiAdapter;
pub use http::RestClient;
pub use kraken::KrakenAdapter;
pub use kucoin::KucoinAdapter;
pub use paper::PaperExchange;
pub use registry::{ExchangeRegistry, ExchangeStatus};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use simulated::SimulatedExchange;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ExchangeError;
use crate::types::{Candle, OrderAck, OrderRequest, Symbol, TickerSnapshot, Timeframe};

/// What an adapter can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub spot_trading: bool,
    /// Orders are simulated against in-memory balances
    pub paper_mode: bool,
}

/// Common interface over every exchange
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Lowercase exchange name (e.g. "binance")
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Probe connectivity. Never errors; unreachable is `false`.
    async fn connect(&self) -> bool;

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError>;

    /// Symbols quoted in `quote`, highest recent volume first
    async fn get_top_symbols(&self, quote: &str, limit: usize)
        -> Result<Vec<Symbol>, ExchangeError>;

    /// Candles oldest first
    async fn get_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<(), ExchangeError>;

    /// Free balance of `currency`
    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError>;
}

/// Retry policy bounded by the aggregator's per-query timeout
pub fn retry_policy(config: &crate::config::ExchangesConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_retries,
        std::time::Duration::from_millis(config.retry_base_delay_ms),
        std::time::Duration::from_millis(config.retry_max_delay_ms),
    )
    .with_budget(config.query_timeout())
}

/// Build an adapter by name. Unknown names produce a [`DisabledExchange`].
pub fn build_adapter(
    name: &str,
    config: &crate::config::ExchangesConfig,
) -> std::sync::Arc<dyn ExchangeAdapter> {
    use std::sync::Arc;

    let key = name.trim().to_lowercase();
    let policy = retry_policy(config);
    let timeout = policy.attempt_timeout().unwrap_or_else(|| config.query_timeout());

    let build_client = |key: &str| RestClient::new(key, timeout, policy.clone());

    let adapter: Result<Arc<dyn ExchangeAdapter>, ExchangeError> = match key.as_str() {
        "binance" => build_client("binance").map(|c| {
            Arc::new(BinanceAdapter::new(c, config.credentials_for("binance")))
                as Arc<dyn ExchangeAdapter>
        }),
        "coinbase" => build_client("coinbase").map(|c| {
            Arc::new(CoinbaseAdapter::new(c, config.credentials_for("coinbase")))
                as Arc<dyn ExchangeAdapter>
        }),
        "kraken" => build_client("kraken").map(|c| {
            Arc::new(KrakenAdapter::new(c, config.credentials_for("kraken")))
                as Arc<dyn ExchangeAdapter>
        }),
        "kucoin" => build_client("kucoin").map(|c| {
            Arc::new(KucoinAdapter::new(c, config.credentials_for("kucoin")))
                as Arc<dyn ExchangeAdapter>
        }),
        "gemini" => build_client("gemini").map(|c| {
            Arc::new(GeminiAdapter::new(c, config.credentials_for("gemini")))
                as Arc<dyn ExchangeAdapter>
        }),
        "simulated" | "mock" => {
            Ok(Arc::new(SimulatedExchange::new("simulated")) as Arc<dyn ExchangeAdapter>)
        }
        _ => Err(ExchangeError::Disabled(format!(
            "unknown exchange '{}'",
            name
        ))),
    };

    match adapter {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(exchange = %name, error = %e, "Using disabled adapter");
            Arc::new(DisabledExchange::new(&key))
        }
    }
}

/// Split a concatenated pair ("BTCUSDT") using known quote currencies
pub(crate) fn split_concatenated(pair: &str, quotes: &[&str]) -> Option<Symbol> {
    let upper = pair.to_uppercase();
    quotes
        .iter()
        .filter(|q| upper.len() > q.len() && upper.ends_with(*q))
        .max_by_key(|q| q.len())
        .map(|q| Symbol::new(&upper[..upper.len() - q.len()], q))
}

pub(crate) const KNOWN_QUOTES: &[&str] = &[
    "USDT", "USDC", "BUSD", "USD", "EUR", "BTC", "ETH", "BNB",
];
