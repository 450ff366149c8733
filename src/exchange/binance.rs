//! Binance spot REST adapter
//!
//! Symbols are concatenated on the wire (`BTC/USDT` -> `BTCUSDT`).

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Method;
use serde::Deserialize;

use crate::config::ExchangeCredentials;
use crate::error::ExchangeError;
use crate::exchange::http::{classify_symbol_error, num, parse_field};
use crate::exchange::{signing, split_concatenated, Capabilities, ExchangeAdapter, RestClient};
use crate::exchange::KNOWN_QUOTES;
use crate::types::{
    Candle, OrderAck, OrderRequest, OrderStatus, OrderType, Symbol, TickerSnapshot, Timeframe,
};

const BINANCE_REST_URL: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    last_price: String,
    bid_price: String,
    ask_price: String,
    volume: String,
    quote_volume: String,
    close_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    executed_qty: String,
    cummulative_quote_qty: String,
    #[serde(default)]
    fills: Vec<Fill>,
}

#[derive(Debug, Deserialize)]
struct Fill {
    commission: String,
    #[serde(rename = "commissionAsset")]
    commission_asset: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
struct Balance {
    asset: String,
    free: String,
}

pub struct BinanceAdapter {
    http: RestClient,
    creds: ExchangeCredentials,
    base_url: String,
}

impl BinanceAdapter {
    pub fn new(http: RestClient, creds: ExchangeCredentials) -> Self {
        Self {
            http,
            creds,
            base_url: BINANCE_REST_URL.to_string(),
        }
    }

    /// Point at a different host (testnet)
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn format_symbol(symbol: &Symbol) -> String {
        format!("{}{}", symbol.base(), symbol.quote())
    }

    fn interval(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }

    fn map_status(status: &str) -> OrderStatus {
        match status {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELED" | "EXPIRED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        }
    }

    /// Query string with timestamp, recvWindow and signature appended
    fn signed_query(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        signing::require_credentials("binance", &self.creds)?;
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", RECV_WINDOW_MS));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");
        let signature =
            signing::hmac_sha256_hex(self.creds.api_secret.as_bytes(), query.as_bytes())?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = self.signed_query(params)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let headers = signing::headers(&[("x-mbx-apikey", self.creds.api_key.as_str())])?;
        self.http.send_once(method, &url, headers, None).await
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: true,
            paper_mode: false,
        }
    }

    async fn connect(&self) -> bool {
        let url = format!("{}/api/v3/ping", self.base_url);
        match self.http.get_json::<serde_json::Value>(&url, &[]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(exchange = %"binance", error = %e, "Connectivity probe failed");
                false
            }
        }
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let ticker: Ticker24h = self
            .http
            .get_json(&url, &[("symbol", Self::format_symbol(symbol))])
            .await
            .map_err(|e| classify_symbol_error(e, "binance", symbol))?;

        Ok(TickerSnapshot {
            symbol: symbol.clone(),
            last: parse_field(&ticker.last_price, "lastPrice")?,
            bid: parse_field(&ticker.bid_price, "bidPrice")?,
            ask: parse_field(&ticker.ask_price, "askPrice")?,
            volume: parse_field(&ticker.volume, "volume")?,
            exchange: "binance".to_string(),
            timestamp: Utc
                .timestamp_millis_opt(ticker.close_time)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    async fn get_top_symbols(
        &self,
        quote: &str,
        limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let tickers: Vec<Ticker24h> = self.http.get_json(&url, &[]).await?;

        let quote = quote.to_uppercase();
        let mut pairs: Vec<(Symbol, f64)> = tickers
            .iter()
            .filter_map(|t| {
                let symbol = split_concatenated(&t.symbol, KNOWN_QUOTES)?;
                if symbol.quote() != quote {
                    return None;
                }
                let quote_volume = t.quote_volume.parse::<f64>().ok()?;
                Some((symbol, quote_volume))
            })
            .collect();

        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(pairs.into_iter().take(limit).map(|(s, _)| s).collect())
    }

    async fn get_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!("{}/api/v3/klines", self.base_url);

        // [[open_time, open, high, low, close, volume, close_time, ...], ...]
        let klines: Vec<Vec<serde_json::Value>> = self
            .http
            .get_json(
                &url,
                &[
                    ("symbol", Self::format_symbol(symbol)),
                    ("interval", Self::interval(timeframe).to_string()),
                    ("limit", limit.min(1000).to_string()),
                ],
            )
            .await
            .map_err(|e| classify_symbol_error(e, "binance", symbol))?;

        let candles: Vec<Candle> = klines
            .into_iter()
            .filter_map(|kline| {
                if kline.len() < 6 {
                    return None;
                }
                Some(Candle {
                    open_time: kline[0].as_i64()?,
                    open: num(&kline[1])?,
                    high: num(&kline[2])?,
                    low: num(&kline[3])?,
                    close: num(&kline[4])?,
                    volume: num(&kline[5])?,
                })
            })
            .collect();

        tracing::debug!(
            exchange = %"binance",
            symbol = %symbol,
            count = candles.len(),
            "Historical candles fetched"
        );
        Ok(candles)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", Self::format_symbol(&order.symbol)),
            ("side", order.side.to_string()),
            ("type", order.order_type.to_string()),
            ("quantity", signing::format_quantity(order.quantity, 8)?),
            ("newClientOrderId", order.client_order_id.clone()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        if order.order_type == OrderType::Limit {
            let price = order.price.ok_or_else(|| {
                ExchangeError::RejectedByExchange("limit order without price".into())
            })?;
            params.push(("price", signing::format_quantity(price, 8)?));
            params.push(("timeInForce", "GTC".to_string()));
        }

        let response: OrderResponse = self.signed(Method::POST, "/api/v3/order", &params).await?;

        let filled_qty = parse_field(&response.executed_qty, "executedQty")?;
        let quote_qty = parse_field(&response.cummulative_quote_qty, "cummulativeQuoteQty")?;
        let fee = response
            .fills
            .iter()
            .filter(|f| f.commission_asset == order.symbol.quote())
            .filter_map(|f| f.commission.parse::<f64>().ok())
            .sum();

        Ok(OrderAck {
            order_id: response.order_id.to_string(),
            exchange: "binance".to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: Self::map_status(&response.status),
            filled_qty,
            avg_price: if filled_qty > 0.0 { quote_qty / filled_qty } else { 0.0 },
            fee,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/api/v3/order",
                &[
                    ("symbol", Self::format_symbol(symbol)),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        let account: AccountResponse = self.signed(Method::GET, "/api/v3/account", &[]).await?;
        Ok(account
            .balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(currency))
            .and_then(|b| b.free.parse::<f64>().ok())
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_format() {
        assert_eq!(
            BinanceAdapter::format_symbol(&Symbol::new("BTC", "USDT")),
            "BTCUSDT"
        );
    }

    #[test]
    fn test_ticker_payload_decodes() {
        let raw = r#"{"symbol":"BTCUSDT","lastPrice":"50000.10","bidPrice":"50000.00",
            "askPrice":"50000.20","volume":"1234.5","quoteVolume":"61725000.0","closeTime":1700000000000}"#;
        let t: Ticker24h = serde_json::from_str(raw).unwrap();
        assert_eq!(parse_field(&t.bid_price, "bid").unwrap(), 50000.0);
        assert_eq!(t.close_time, 1_700_000_000_000);
    }

    #[test]
    fn test_order_status_mapping() {
        assert_eq!(BinanceAdapter::map_status("FILLED"), OrderStatus::Filled);
        assert_eq!(BinanceAdapter::map_status("EXPIRED"), OrderStatus::Cancelled);
        assert_eq!(BinanceAdapter::map_status("NEW"), OrderStatus::New);
    }

    #[test]
    fn test_signed_query_requires_credentials() {
        let http = RestClient::new(
            "binance",
            std::time::Duration::from_secs(1),
            crate::exchange::RetryPolicy::none(),
        )
        .unwrap();
        let adapter = BinanceAdapter::new(http, ExchangeCredentials::default());
        assert!(matches!(
            adapter.signed_query(&[("symbol", "BTCUSDT".into())]),
            Err(ExchangeError::Auth(_))
        ));
    }
}
