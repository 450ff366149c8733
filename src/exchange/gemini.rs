//! Gemini REST adapter
//!
//! Gemini symbols are lowercase and concatenated (`btcusd`). Several assets
//! are not listed against USDT; those pairs fail fast without a request.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::ExchangeCredentials;
use crate::error::ExchangeError;
use crate::exchange::http::{classify_symbol_error, num, parse_field};
use crate::exchange::{
    signing, split_concatenated, Capabilities, ExchangeAdapter, RestClient, KNOWN_QUOTES,
};
use crate::types::{
    Candle, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType, Symbol, TickerSnapshot,
    Timeframe,
};

const GEMINI_REST_URL: &str = "https://api.gemini.com";
/// Tickers fetched when ranking symbols (Gemini has no bulk volume endpoint)
const MAX_TICKER_LOOKUPS: usize = 20;
/// Marketable-limit offset used to emulate market orders
const MARKET_SLIPPAGE: f64 = 0.01;

/// Base assets Gemini does not list against USDT
const UNSUPPORTED_USDT_BASES: &[&str] = &[
    "ADA", "SOL", "DOT", "AVAX", "MATIC", "LINK", "XRP", "DOGE",
];

#[derive(Debug, Deserialize)]
struct PubTicker {
    bid: String,
    ask: String,
    last: String,
    /// Keyed by currency, plus a timestamp entry
    volume: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    order_id: String,
    #[serde(default)]
    executed_amount: Option<String>,
    #[serde(default)]
    avg_execution_price: Option<String>,
    #[serde(default)]
    is_live: bool,
    #[serde(default)]
    is_cancelled: bool,
}

#[derive(Debug, Deserialize)]
struct Balance {
    currency: String,
    available: String,
}

pub struct GeminiAdapter {
    http: RestClient,
    creds: ExchangeCredentials,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(http: RestClient, creds: ExchangeCredentials) -> Self {
        Self {
            http,
            creds,
            base_url: GEMINI_REST_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn format_symbol(symbol: &Symbol) -> String {
        format!("{}{}", symbol.base(), symbol.quote()).to_lowercase()
    }

    pub fn supports(symbol: &Symbol) -> bool {
        !(symbol.quote() == "USDT" && UNSUPPORTED_USDT_BASES.contains(&symbol.base()))
    }

    fn ensure_supported(symbol: &Symbol) -> Result<(), ExchangeError> {
        if Self::supports(symbol) {
            Ok(())
        } else {
            Err(ExchangeError::SymbolNotSupported {
                exchange: "gemini".to_string(),
                symbol: symbol.clone(),
            })
        }
    }

    fn candle_timeframe(timeframe: Timeframe) -> Option<&'static str> {
        match timeframe {
            Timeframe::Min1 => Some("1m"),
            Timeframe::Min5 => Some("5m"),
            Timeframe::Min15 => Some("15m"),
            Timeframe::Hour1 => Some("1hr"),
            Timeframe::Hour4 => None,
            Timeframe::Day1 => Some("1day"),
        }
    }

    async fn private<T: DeserializeOwned>(
        &self,
        request: &str,
        mut payload: serde_json::Value,
    ) -> Result<T, ExchangeError> {
        signing::require_credentials("gemini", &self.creds)?;
        payload["request"] = serde_json::Value::String(request.to_string());
        payload["nonce"] = serde_json::Value::String(Utc::now().timestamp_millis().to_string());

        let encoded = signing::base64_encode(payload.to_string().as_bytes());
        let signature =
            signing::hmac_sha384_hex(self.creds.api_secret.as_bytes(), encoded.as_bytes())?;
        let headers = signing::headers(&[
            ("x-gemini-apikey", self.creds.api_key.as_str()),
            ("x-gemini-payload", encoded.as_str()),
            ("x-gemini-signature", signature.as_str()),
            ("content-type", "text/plain"),
            ("cache-control", "no-cache"),
        ])?;

        let url = format!("{}{}", self.base_url, request);
        self.http.send_once(Method::POST, &url, headers, None).await
    }

    fn snapshot(symbol: &Symbol, ticker: &PubTicker) -> Result<TickerSnapshot, ExchangeError> {
        let volume = ticker
            .volume
            .get(symbol.base())
            .and_then(num)
            .unwrap_or(0.0);
        Ok(TickerSnapshot {
            symbol: symbol.clone(),
            last: parse_field(&ticker.last, "last")?,
            bid: parse_field(&ticker.bid, "bid")?,
            ask: parse_field(&ticker.ask, "ask")?,
            volume,
            exchange: "gemini".to_string(),
            timestamp: Utc::now(),
        })
    }

    fn map_order(order: &OrderRequest, response: OrderStatusResponse) -> OrderAck {
        let filled_qty = response
            .executed_amount
            .as_deref()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        let status = if response.is_cancelled && filled_qty == 0.0 {
            OrderStatus::Cancelled
        } else if filled_qty >= order.quantity {
            OrderStatus::Filled
        } else if filled_qty > 0.0 {
            OrderStatus::PartiallyFilled
        } else if response.is_live {
            OrderStatus::New
        } else {
            OrderStatus::Rejected
        };

        OrderAck {
            order_id: response.order_id,
            exchange: "gemini".to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            status,
            filled_qty,
            avg_price: response
                .avg_execution_price
                .as_deref()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
            fee: 0.0,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: true,
            paper_mode: false,
        }
    }

    async fn connect(&self) -> bool {
        let url = format!("{}/v1/symbols", self.base_url);
        match self.http.get_json::<Vec<String>>(&url, &[]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(exchange = %"gemini", error = %e, "Connectivity probe failed");
                false
            }
        }
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        Self::ensure_supported(symbol)?;
        let url = format!(
            "{}/v1/pubticker/{}",
            self.base_url,
            Self::format_symbol(symbol)
        );
        let ticker: PubTicker = self
            .http
            .get_json(&url, &[])
            .await
            .map_err(|e| classify_symbol_error(e, "gemini", symbol))?;
        Self::snapshot(symbol, &ticker)
    }

    async fn get_top_symbols(
        &self,
        quote: &str,
        limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        let url = format!("{}/v1/symbols", self.base_url);
        let listed: Vec<String> = self.http.get_json(&url, &[]).await?;
        let quote = quote.to_uppercase();

        let candidates: Vec<Symbol> = listed
            .iter()
            .filter_map(|s| split_concatenated(s, KNOWN_QUOTES))
            .filter(|s| s.quote() == quote && Self::supports(s))
            .take(MAX_TICKER_LOOKUPS)
            .collect();

        let lookups = candidates.iter().map(|symbol| async move {
            let ticker = self.get_ticker(symbol).await.ok()?;
            Some((symbol.clone(), ticker.volume * ticker.last))
        });

        let mut ranked: Vec<(Symbol, f64)> =
            join_all(lookups).await.into_iter().flatten().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked.into_iter().take(limit).map(|(s, _)| s).collect())
    }

    async fn get_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        Self::ensure_supported(symbol)?;
        let tf = Self::candle_timeframe(timeframe).ok_or_else(|| {
            ExchangeError::RejectedByExchange(format!("gemini has no {} candles", timeframe))
        })?;
        let url = format!(
            "{}/v2/candles/{}/{}",
            self.base_url,
            Self::format_symbol(symbol),
            tf
        );

        // [[time_ms, open, high, low, close, volume], ...] newest first
        let rows: Vec<Vec<serde_json::Value>> = self
            .http
            .get_json(&url, &[])
            .await
            .map_err(|e| classify_symbol_error(e, "gemini", symbol))?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                if row.len() < 6 {
                    return None;
                }
                Some(Candle {
                    open_time: row[0].as_i64()?,
                    open: num(&row[1])?,
                    high: num(&row[2])?,
                    low: num(&row[3])?,
                    close: num(&row[4])?,
                    volume: num(&row[5])?,
                })
            })
            .collect();

        candles.sort_by_key(|c| c.open_time);
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        Self::ensure_supported(&order.symbol)?;

        // Gemini has no market orders; emulate with an immediate-or-cancel limit
        let (price, options) = match order.order_type {
            OrderType::Limit => {
                let price = order.price.ok_or_else(|| {
                    ExchangeError::RejectedByExchange("limit order without price".into())
                })?;
                (price, serde_json::json!([]))
            }
            OrderType::Market => {
                let ticker = self.get_ticker(&order.symbol).await?;
                let price = match order.side {
                    OrderSide::Buy => ticker.ask * (1.0 + MARKET_SLIPPAGE),
                    OrderSide::Sell => ticker.bid * (1.0 - MARKET_SLIPPAGE),
                };
                (price, serde_json::json!(["immediate-or-cancel"]))
            }
        };

        let payload = serde_json::json!({
            "client_order_id": order.client_order_id,
            "symbol": Self::format_symbol(&order.symbol),
            "amount": signing::format_quantity(order.quantity, 8)?,
            "price": signing::format_quantity(price, 2)?,
            "side": order.side.to_string().to_lowercase(),
            "type": "exchange limit",
            "options": options,
        });

        let response: OrderStatusResponse = self.private("/v1/order/new", payload).await?;
        Ok(Self::map_order(order, response))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<(), ExchangeError> {
        let id: i64 = order_id.parse().map_err(|_| {
            ExchangeError::RejectedByExchange(format!("invalid gemini order id {}", order_id))
        })?;
        let _: serde_json::Value = self
            .private("/v1/order/cancel", serde_json::json!({ "order_id": id }))
            .await?;
        Ok(())
    }

    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        let balances: Vec<Balance> = self.private("/v1/balances", serde_json::json!({})).await?;
        Ok(balances
            .iter()
            .find(|b| b.currency.eq_ignore_ascii_case(currency))
            .and_then(|b| b.available.parse::<f64>().ok())
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_format_is_lowercase() {
        assert_eq!(
            GeminiAdapter::format_symbol(&Symbol::new("BTC", "USD")),
            "btcusd"
        );
    }

    #[test]
    fn test_unsupported_usdt_pairs() {
        assert!(!GeminiAdapter::supports(&Symbol::new("SOL", "USDT")));
        assert!(!GeminiAdapter::supports(&Symbol::new("DOGE", "USDT")));
        assert!(GeminiAdapter::supports(&Symbol::new("SOL", "USD")));
        assert!(GeminiAdapter::supports(&Symbol::new("BTC", "USDT")));
    }

    #[tokio::test]
    async fn test_unsupported_pair_fails_without_network() {
        let http = RestClient::new(
            "gemini",
            std::time::Duration::from_millis(10),
            crate::exchange::RetryPolicy::none(),
        )
        .unwrap();
        let adapter = GeminiAdapter::new(http, ExchangeCredentials::default())
            .with_base_url("http://127.0.0.1:9");
        let err = adapter
            .get_ticker(&Symbol::new("XRP", "USDT"))
            .await
            .unwrap_err();
        assert!(err.is_permanent_for_symbol());
    }

    #[test]
    fn test_pubticker_volume_by_base() {
        let raw = r#"{"bid":"50000.0","ask":"50001.0","last":"50000.5",
            "volume":{"BTC":"120.5","USD":"6025000","timestamp":1700000000000}}"#;
        let ticker: PubTicker = serde_json::from_str(raw).unwrap();
        let snap = GeminiAdapter::snapshot(&Symbol::new("BTC", "USD"), &ticker).unwrap();
        assert_eq!(snap.volume, 120.5);
        assert_eq!(snap.ask, 50001.0);
    }

    #[test]
    fn test_ioc_without_fill_is_cancelled() {
        let order = OrderRequest::market(Symbol::new("BTC", "USD"), OrderSide::Buy, 0.1);
        let response = OrderStatusResponse {
            order_id: "42".into(),
            executed_amount: Some("0".into()),
            avg_execution_price: None,
            is_live: false,
            is_cancelled: true,
        };
        let ack = GeminiAdapter::map_order(&order, response);
        assert_eq!(ack.status, OrderStatus::Cancelled);
    }
}
