//! KuCoin spot REST adapter

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::ExchangeCredentials;
use crate::error::ExchangeError;
use crate::exchange::http::{classify_symbol_error, num, parse_field};
use crate::exchange::{signing, Capabilities, ExchangeAdapter, RestClient};
use crate::types::{
    Candle, OrderAck, OrderRequest, OrderStatus, OrderType, Symbol, TickerSnapshot, Timeframe,
};

const KUCOIN_REST_URL: &str = "https://api.kucoin.com";
const SUCCESS_CODE: &str = "200000";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    #[serde(default)]
    buy: Option<String>,
    #[serde(default)]
    sell: Option<String>,
    #[serde(default)]
    last: Option<String>,
    #[serde(default)]
    vol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AllTickers {
    ticker: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    symbol: String,
    #[serde(default)]
    vol_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    available: String,
}

pub struct KucoinAdapter {
    http: RestClient,
    creds: ExchangeCredentials,
    base_url: String,
}

impl KucoinAdapter {
    pub fn new(http: RestClient, creds: ExchangeCredentials) -> Self {
        Self {
            http,
            creds,
            base_url: KUCOIN_REST_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn format_symbol(symbol: &Symbol) -> String {
        format!("{}-{}", symbol.base(), symbol.quote())
    }

    fn candle_type(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::Min1 => "1min",
            Timeframe::Min5 => "5min",
            Timeframe::Min15 => "15min",
            Timeframe::Hour1 => "1hour",
            Timeframe::Hour4 => "4hour",
            Timeframe::Day1 => "1day",
        }
    }

    fn unwrap_envelope<T>(
        envelope: Envelope<T>,
        symbol: Option<&Symbol>,
    ) -> Result<T, ExchangeError> {
        if envelope.code != SUCCESS_CODE {
            let msg = envelope.msg.unwrap_or_default();
            let err = match envelope.code.as_str() {
                "429000" => ExchangeError::RateLimited { retry_after: None },
                "400001" | "400002" | "400003" | "400004" | "400005" => {
                    ExchangeError::Auth(format!("{}: {}", envelope.code, msg))
                }
                "200004" => ExchangeError::InsufficientFunds {
                    needed: 0.0,
                    available: 0.0,
                },
                _ => ExchangeError::RejectedByExchange(format!("{}: {}", envelope.code, msg)),
            };
            return Err(match symbol {
                Some(s) => classify_symbol_error(err, "kucoin", s),
                None => err,
            });
        }
        envelope
            .data
            .ok_or_else(|| match symbol {
                // KuCoin answers unknown symbols with success and null data
                Some(s) => ExchangeError::SymbolNotSupported {
                    exchange: "kucoin".to_string(),
                    symbol: s.clone(),
                },
                None => ExchangeError::Decode("kucoin: missing data".into()),
            })
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: Option<&Symbol>,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let envelope: Envelope<T> = self.http.get_json(&url, query).await.map_err(|e| match symbol {
            Some(s) => classify_symbol_error(e, "kucoin", s),
            None => e,
        })?;
        Self::unwrap_envelope(envelope, symbol)
    }

    async fn private<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<String>,
    ) -> Result<T, ExchangeError> {
        signing::require_credentials("kucoin", &self.creds)?;
        let timestamp = Utc::now().timestamp_millis().to_string();
        let secret = self.creds.api_secret.as_bytes();
        let prehash = format!(
            "{}{}{}{}",
            timestamp,
            method.as_str(),
            endpoint,
            body.as_deref().unwrap_or("")
        );
        let signature = signing::hmac_sha256_base64(secret, prehash.as_bytes())?;
        let passphrase = signing::hmac_sha256_base64(secret, self.creds.passphrase.as_bytes())?;

        let headers = signing::headers(&[
            ("kc-api-key", self.creds.api_key.as_str()),
            ("kc-api-sign", signature.as_str()),
            ("kc-api-timestamp", timestamp.as_str()),
            ("kc-api-passphrase", passphrase.as_str()),
            ("kc-api-key-version", "2"),
            ("content-type", "application/json"),
        ])?;

        let url = format!("{}{}", self.base_url, endpoint);
        let envelope: Envelope<T> = self.http.send_once(method, &url, headers, body).await?;
        Self::unwrap_envelope(envelope, None)
    }
}

#[async_trait]
impl ExchangeAdapter for KucoinAdapter {
    fn name(&self) -> &str {
        "kucoin"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: true,
            paper_mode: false,
        }
    }

    async fn connect(&self) -> bool {
        match self.public::<serde_json::Value>("/api/v1/timestamp", &[], None).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(exchange = %"kucoin", error = %e, "Connectivity probe failed");
                false
            }
        }
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        let stats: Stats = self
            .public(
                "/api/v1/market/stats",
                &[("symbol", Self::format_symbol(symbol))],
                Some(symbol),
            )
            .await?;

        let not_listed = || ExchangeError::SymbolNotSupported {
            exchange: "kucoin".to_string(),
            symbol: symbol.clone(),
        };
        let last = stats.last.as_deref().ok_or_else(not_listed)?;

        Ok(TickerSnapshot {
            symbol: symbol.clone(),
            last: parse_field(last, "last")?,
            bid: parse_field(stats.buy.as_deref().unwrap_or(last), "buy")?,
            ask: parse_field(stats.sell.as_deref().unwrap_or(last), "sell")?,
            volume: parse_field(stats.vol.as_deref().unwrap_or("0"), "vol")?,
            exchange: "kucoin".to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn get_top_symbols(
        &self,
        quote: &str,
        limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        let all: AllTickers = self.public("/api/v1/market/allTickers", &[], None).await?;
        let quote = quote.to_uppercase();

        let mut pairs: Vec<(Symbol, f64)> = all
            .ticker
            .iter()
            .filter_map(|t| {
                let symbol = Symbol::parse(&t.symbol)?;
                if symbol.quote() != quote {
                    return None;
                }
                let volume = t.vol_value.as_deref()?.parse::<f64>().ok()?;
                Some((symbol, volume))
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
        let end = Utc::now().timestamp();
        let start = end - (timeframe.duration_secs() * limit as u64) as i64;

        // [[time, open, close, high, low, volume, turnover], ...] newest first
        let rows: Vec<Vec<serde_json::Value>> = self
            .public(
                "/api/v1/market/candles",
                &[
                    ("symbol", Self::format_symbol(symbol)),
                    ("type", Self::candle_type(timeframe).to_string()),
                    ("startAt", start.to_string()),
                    ("endAt", end.to_string()),
                ],
                Some(symbol),
            )
            .await?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                if row.len() < 6 {
                    return None;
                }
                Some(Candle {
                    open_time: (num(&row[0])? as i64) * 1000,
                    open: num(&row[1])?,
                    close: num(&row[2])?,
                    high: num(&row[3])?,
                    low: num(&row[4])?,
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
            "clientOid": order.client_order_id,
            "side": order.side.to_string().to_lowercase(),
            "symbol": Self::format_symbol(&order.symbol),
            "type": match order.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            "size": signing::format_quantity(order.quantity, 8)?,
        });
        if order.order_type == OrderType::Limit {
            let price = order.price.ok_or_else(|| {
                ExchangeError::RejectedByExchange("limit order without price".into())
            })?;
            body["price"] = serde_json::Value::String(signing::format_quantity(price, 8)?);
        }

        let data: OrderData = self
            .private(Method::POST, "/api/v1/orders", Some(body.to_string()))
            .await?;

        Ok(OrderAck {
            order_id: data.order_id,
            exchange: "kucoin".to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: OrderStatus::New,
            filled_qty: 0.0,
            avg_price: 0.0,
            fee: 0.0,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<(), ExchangeError> {
        let endpoint = format!("/api/v1/orders/{}", order_id);
        let _: serde_json::Value = self.private(Method::DELETE, &endpoint, None).await?;
        Ok(())
    }

    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        let endpoint = format!(
            "/api/v1/accounts?currency={}&type=trade",
            currency.to_uppercase()
        );
        let accounts: Vec<Account> = self.private(Method::GET, &endpoint, None).await?;
        Ok(accounts
            .iter()
            .filter_map(|a| a.available.parse::<f64>().ok())
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_format() {
        assert_eq!(
            KucoinAdapter::format_symbol(&Symbol::new("ETH", "USDT")),
            "ETH-USDT"
        );
    }

    #[test]
    fn test_null_data_is_symbol_not_supported() {
        let raw = r#"{"code":"200000","data":null}"#;
        let envelope: Envelope<Stats> = serde_json::from_str(raw).unwrap();
        let symbol = Symbol::new("FOO", "USDT");
        let err = KucoinAdapter::unwrap_envelope(envelope, Some(&symbol)).unwrap_err();
        assert!(err.is_permanent_for_symbol());
    }

    #[test]
    fn test_error_codes() {
        let raw = r#"{"code":"429000","msg":"Too Many Requests"}"#;
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(raw).unwrap();
        assert!(KucoinAdapter::unwrap_envelope(envelope, None)
            .unwrap_err()
            .is_transient());

        let raw = r#"{"code":"400005","msg":"Invalid KC-API-SIGN"}"#;
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            KucoinAdapter::unwrap_envelope(envelope, None),
            Err(ExchangeError::Auth(_))
        ));
    }

    #[test]
    fn test_stats_payload_decodes() {
        let raw = r#"{"code":"200000","data":{"symbol":"BTC-USDT","buy":"50000.1",
            "sell":"50000.2","last":"50000.15","vol":"812.3","volValue":"40615000"}}"#;
        let envelope: Envelope<Stats> = serde_json::from_str(raw).unwrap();
        let stats = KucoinAdapter::unwrap_envelope(envelope, None).unwrap();
        assert_eq!(stats.buy.as_deref(), Some("50000.1"));
        assert_eq!(stats.vol.as_deref(), Some("812.3"));
    }
}
