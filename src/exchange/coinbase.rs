//! Coinbase Exchange REST adapter
//!
//! Products are dash-separated on the wire (`BTC/USD` -> `BTC-USD`).

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use reqwest::Method;
use serde::Deserialize;

use crate::config::ExchangeCredentials;
use crate::error::ExchangeError;
use crate::exchange::http::{classify_symbol_error, num, parse_field};
use crate::exchange::{signing, Capabilities, ExchangeAdapter, RestClient};
use crate::types::{
    Candle, OrderAck, OrderRequest, OrderStatus, OrderType, Symbol, TickerSnapshot, Timeframe,
};

const COINBASE_REST_URL: &str = "https://api.exchange.coinbase.com";
/// Stats requests issued when ranking products by volume
const MAX_STATS_LOOKUPS: usize = 25;

#[derive(Debug, Deserialize)]
struct ProductTicker {
    price: String,
    bid: String,
    ask: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct Product {
    id: String,
    base_currency: String,
    quote_currency: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ProductStats {
    #[serde(default)]
    last: Option<String>,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    filled_size: Option<String>,
    #[serde(default)]
    executed_value: Option<String>,
    #[serde(default)]
    fill_fees: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Account {
    currency: String,
    available: String,
}

pub struct CoinbaseAdapter {
    http: RestClient,
    creds: ExchangeCredentials,
    base_url: String,
}

impl CoinbaseAdapter {
    pub fn new(http: RestClient, creds: ExchangeCredentials) -> Self {
        Self {
            http,
            creds,
            base_url: COINBASE_REST_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn format_symbol(symbol: &Symbol) -> String {
        format!("{}-{}", symbol.base(), symbol.quote())
    }

    fn granularity(timeframe: Timeframe) -> Option<u64> {
        match timeframe {
            Timeframe::Min1 => Some(60),
            Timeframe::Min5 => Some(300),
            Timeframe::Min15 => Some(900),
            Timeframe::Hour1 => Some(3600),
            Timeframe::Hour4 => None,
            Timeframe::Day1 => Some(86400),
        }
    }

    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<reqwest::header::HeaderMap, ExchangeError> {
        signing::require_credentials("coinbase", &self.creds)?;
        let timestamp = Utc::now().timestamp().to_string();
        let message = format!("{}{}{}{}", timestamp, method, path, body);
        let secret = signing::decode_secret(&self.creds.api_secret)?;
        let signature = signing::hmac_sha256_base64(&secret, message.as_bytes())?;

        signing::headers(&[
            ("cb-access-key", self.creds.api_key.as_str()),
            ("cb-access-sign", signature.as_str()),
            ("cb-access-timestamp", timestamp.as_str()),
            ("cb-access-passphrase", self.creds.passphrase.as_str()),
            ("content-type", "application/json"),
        ])
    }

    async fn private<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<T, ExchangeError> {
        let headers = self.auth_headers(method.as_str(), path, body.as_deref().unwrap_or(""))?;
        let url = format!("{}{}", self.base_url, path);
        self.http.send_once(method, &url, headers, body).await
    }

    fn map_status(status: &str) -> OrderStatus {
        match status {
            "done" => OrderStatus::Filled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        }
    }

    /// Coinbase wants a hyphenated UUID for client_oid
    fn client_oid(raw: &str) -> String {
        uuid::Uuid::parse_str(raw)
            .map(|u| u.hyphenated().to_string())
            .unwrap_or_else(|_| uuid::Uuid::new_v4().hyphenated().to_string())
    }
}

#[async_trait]
impl ExchangeAdapter for CoinbaseAdapter {
    fn name(&self) -> &str {
        "coinbase"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: true,
            paper_mode: false,
        }
    }

    async fn connect(&self) -> bool {
        let url = format!("{}/time", self.base_url);
        match self.http.get_json::<serde_json::Value>(&url, &[]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(exchange = %"coinbase", error = %e, "Connectivity probe failed");
                false
            }
        }
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        let url = format!(
            "{}/products/{}/ticker",
            self.base_url,
            Self::format_symbol(symbol)
        );
        let ticker: ProductTicker = self
            .http
            .get_json(&url, &[])
            .await
            .map_err(|e| classify_symbol_error(e, "coinbase", symbol))?;

        Ok(TickerSnapshot {
            symbol: symbol.clone(),
            last: parse_field(&ticker.price, "price")?,
            bid: parse_field(&ticker.bid, "bid")?,
            ask: parse_field(&ticker.ask, "ask")?,
            volume: parse_field(&ticker.volume, "volume")?,
            exchange: "coinbase".to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn get_top_symbols(
        &self,
        quote: &str,
        limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        let url = format!("{}/products", self.base_url);
        let products: Vec<Product> = self.http.get_json(&url, &[]).await?;

        let online = |q: &str| -> Vec<&Product> {
            products
                .iter()
                .filter(|p| p.quote_currency.eq_ignore_ascii_case(q) && p.status == "online")
                .collect()
        };

        // Coinbase lists few USDT books; USD books stand in for ranking purposes
        let mut candidates = online(quote);
        if candidates.is_empty() && quote.eq_ignore_ascii_case("USDT") {
            candidates = online("USD");
        }

        let lookups = candidates.iter().take(MAX_STATS_LOOKUPS).map(|p| async move {
            let stats_url = format!("{}/products/{}/stats", self.base_url, p.id);
            let stats: Result<ProductStats, _> = self.http.get_json(&stats_url, &[]).await;
            stats.ok().and_then(|s| {
                let volume = s.volume.parse::<f64>().ok()?;
                let last = s.last.as_deref().and_then(|l| l.parse::<f64>().ok()).unwrap_or(1.0);
                Some((Symbol::new(&p.base_currency, quote), volume * last))
            })
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
        let granularity = Self::granularity(timeframe).ok_or_else(|| {
            ExchangeError::RejectedByExchange(format!("coinbase has no {} candles", timeframe))
        })?;
        let url = format!(
            "{}/products/{}/candles",
            self.base_url,
            Self::format_symbol(symbol)
        );

        // [[time, low, high, open, close, volume], ...] newest first
        let rows: Vec<Vec<serde_json::Value>> = self
            .http
            .get_json(&url, &[("granularity", granularity.to_string())])
            .await
            .map_err(|e| classify_symbol_error(e, "coinbase", symbol))?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                if row.len() < 6 {
                    return None;
                }
                Some(Candle {
                    open_time: row[0].as_i64()? * 1000,
                    low: num(&row[1])?,
                    high: num(&row[2])?,
                    open: num(&row[3])?,
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
        let mut body = serde_json::json!({
            "type": match order.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            "side": order.side.to_string().to_lowercase(),
            "product_id": Self::format_symbol(&order.symbol),
            "size": signing::format_quantity(order.quantity, 8)?,
            "client_oid": Self::client_oid(&order.client_order_id),
        });
        if order.order_type == OrderType::Limit {
            let price = order.price.ok_or_else(|| {
                ExchangeError::RejectedByExchange("limit order without price".into())
            })?;
            body["price"] = serde_json::Value::String(signing::format_quantity(price, 8)?);
        }

        let response: OrderResponse = self
            .private(Method::POST, "/orders", Some(body.to_string()))
            .await?;

        let filled_qty = response
            .filled_size
            .as_deref()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        let executed_value = response
            .executed_value
            .as_deref()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(OrderAck {
            order_id: response.id,
            exchange: "coinbase".to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: Self::map_status(&response.status),
            filled_qty,
            avg_price: if filled_qty > 0.0 { executed_value / filled_qty } else { 0.0 },
            fee: response
                .fill_fees
                .as_deref()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<(), ExchangeError> {
        let path = format!("/orders/{}", order_id);
        let _: serde_json::Value = self.private(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        let accounts: Vec<Account> = self.private(Method::GET, "/accounts", None).await?;
        Ok(accounts
            .iter()
            .find(|a| a.currency.eq_ignore_ascii_case(currency))
            .and_then(|a| a.available.parse::<f64>().ok())
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_format() {
        assert_eq!(
            CoinbaseAdapter::format_symbol(&Symbol::new("BTC", "USD")),
            "BTC-USD"
        );
    }

    #[test]
    fn test_client_oid_is_hyphenated() {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let oid = CoinbaseAdapter::client_oid(&simple);
        assert_eq!(oid.len(), 36);
        assert_eq!(oid.matches('-').count(), 4);
    }

    #[test]
    fn test_four_hour_candles_unsupported() {
        assert!(CoinbaseAdapter::granularity(Timeframe::Hour4).is_none());
        assert_eq!(CoinbaseAdapter::granularity(Timeframe::Hour1), Some(3600));
    }
}
