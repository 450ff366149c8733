//! Kraken spot REST adapter
//!
//! Kraken names bitcoin `XBT` and dogecoin `XDG`, and reports most failures
//! inside a `200 OK` envelope (`{"error": [...], "result": {...}}`).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::ExchangeCredentials;
use crate::error::ExchangeError;
use crate::exchange::http::{classify_symbol_error, num, parse_field};
use crate::exchange::{signing, Capabilities, ExchangeAdapter, RestClient};
use crate::types::{
    Candle, OrderAck, OrderRequest, OrderStatus, OrderType, Symbol, TickerSnapshot, Timeframe,
};

const KRAKEN_REST_URL: &str = "https://api.kraken.com";

/// Canonical asset -> Kraken asset
const ASSET_ALIASES: &[(&str, &str)] = &[("BTC", "XBT"), ("DOGE", "XDG")];

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

/// Ticker entry: a = ask, b = bid, c = last trade, v = volume [today, 24h]
#[derive(Debug, Deserialize)]
struct PairTicker {
    a: Vec<String>,
    b: Vec<String>,
    c: Vec<String>,
    v: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AddOrderResult {
    txid: Vec<String>,
}

pub struct KrakenAdapter {
    http: RestClient,
    creds: ExchangeCredentials,
    base_url: String,
}

impl KrakenAdapter {
    pub fn new(http: RestClient, creds: ExchangeCredentials) -> Self {
        Self {
            http,
            creds,
            base_url: KRAKEN_REST_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn to_kraken_asset(asset: &str) -> &str {
        ASSET_ALIASES
            .iter()
            .find(|(canonical, _)| *canonical == asset)
            .map(|(_, kraken)| *kraken)
            .unwrap_or(asset)
    }

    /// Kraken asset (including legacy X/Z-prefixed names) -> canonical asset
    fn from_kraken_asset(asset: &str) -> String {
        let stripped = if asset.len() == 4 && (asset.starts_with('X') || asset.starts_with('Z')) {
            &asset[1..]
        } else {
            asset
        };
        ASSET_ALIASES
            .iter()
            .find(|(_, kraken)| *kraken == stripped)
            .map(|(canonical, _)| canonical.to_string())
            .unwrap_or_else(|| stripped.to_string())
    }

    pub fn format_symbol(symbol: &Symbol) -> String {
        format!(
            "{}{}",
            Self::to_kraken_asset(symbol.base()),
            Self::to_kraken_asset(symbol.quote())
        )
    }

    fn interval_minutes(timeframe: Timeframe) -> u32 {
        match timeframe {
            Timeframe::Min1 => 1,
            Timeframe::Min5 => 5,
            Timeframe::Min15 => 15,
            Timeframe::Hour1 => 60,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
        }
    }

    /// Kraken error strings -> error taxonomy
    fn map_api_error(errors: &[String], symbol: Option<&Symbol>) -> ExchangeError {
        let joined = errors.join("; ");
        if joined.contains("Unknown asset pair") {
            if let Some(symbol) = symbol {
                return ExchangeError::SymbolNotSupported {
                    exchange: "kraken".to_string(),
                    symbol: symbol.clone(),
                };
            }
        }
        if joined.contains("Rate limit") || joined.contains("Too many requests") {
            return ExchangeError::RateLimited { retry_after: None };
        }
        if joined.contains("EService") {
            return ExchangeError::Connectivity(joined);
        }
        if joined.contains("EAPI:Invalid key")
            || joined.contains("EAPI:Invalid signature")
            || joined.contains("EAPI:Invalid nonce")
        {
            return ExchangeError::Auth(joined);
        }
        if joined.contains("Insufficient funds") {
            // Kraken does not report the shortfall
            return ExchangeError::InsufficientFunds {
                needed: 0.0,
                available: 0.0,
            };
        }
        ExchangeError::RejectedByExchange(joined)
    }

    fn unwrap_envelope<T>(
        envelope: Envelope<T>,
        symbol: Option<&Symbol>,
    ) -> Result<T, ExchangeError> {
        if !envelope.error.is_empty() {
            return Err(Self::map_api_error(&envelope.error, symbol));
        }
        envelope
            .result
            .ok_or_else(|| ExchangeError::Decode("kraken: missing result".into()))
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: Option<&Symbol>,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let envelope: Envelope<T> = self.http.get_json(&url, query).await.map_err(|e| match symbol {
            Some(s) => classify_symbol_error(e, "kraken", s),
            None => e,
        })?;
        Self::unwrap_envelope(envelope, symbol)
    }

    async fn private<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        signing::require_credentials("kraken", &self.creds)?;
        let nonce = Utc::now().timestamp_millis().to_string();
        let mut form: Vec<String> = vec![format!("nonce={}", nonce)];
        form.extend(params.iter().map(|(k, v)| format!("{}={}", k, v)));
        let body = form.join("&");

        let signature = signing::kraken_signature(&self.creds.api_secret, path, &nonce, &body)?;
        let headers = signing::headers(&[
            ("api-key", self.creds.api_key.as_str()),
            ("api-sign", signature.as_str()),
            ("content-type", "application/x-www-form-urlencoded"),
        ])?;

        let url = format!("{}{}", self.base_url, path);
        let envelope: Envelope<T> = self
            .http
            .send_once(Method::POST, &url, headers, Some(body))
            .await?;
        Self::unwrap_envelope(envelope, None)
    }
}

#[async_trait]
impl ExchangeAdapter for KrakenAdapter {
    fn name(&self) -> &str {
        "kraken"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: true,
            paper_mode: false,
        }
    }

    async fn connect(&self) -> bool {
        match self.public::<serde_json::Value>("/0/public/Time", &[], None).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(exchange = %"kraken", error = %e, "Connectivity probe failed");
                false
            }
        }
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        let result: HashMap<String, PairTicker> = self
            .public(
                "/0/public/Ticker",
                &[("pair", Self::format_symbol(symbol))],
                Some(symbol),
            )
            .await?;

        // Result key may be the legacy pair name (XXBTZUSD), so take the only entry
        let ticker = result.into_values().next().ok_or_else(|| {
            ExchangeError::SymbolNotSupported {
                exchange: "kraken".to_string(),
                symbol: symbol.clone(),
            }
        })?;

        let first = |v: &[String], field: &str| -> Result<f64, ExchangeError> {
            v.first()
                .ok_or_else(|| ExchangeError::Decode(format!("kraken: empty field {}", field)))
                .and_then(|s| parse_field(s, field))
        };

        Ok(TickerSnapshot {
            symbol: symbol.clone(),
            last: first(&ticker.c, "c")?,
            bid: first(&ticker.b, "b")?,
            ask: first(&ticker.a, "a")?,
            volume: ticker
                .v
                .get(1)
                .map(|v| parse_field(v, "v"))
                .transpose()?
                .unwrap_or(0.0),
            exchange: "kraken".to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn get_top_symbols(
        &self,
        quote: &str,
        limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        let result: HashMap<String, PairTicker> =
            self.public("/0/public/Ticker", &[], None).await?;

        let quote = quote.to_uppercase();
        let wire_quote = Self::to_kraken_asset(&quote).to_string();
        let legacy_quote = format!("Z{}", wire_quote);

        let mut pairs: Vec<(Symbol, f64)> = result
            .iter()
            .filter_map(|(pair, t)| {
                let base = pair
                    .strip_suffix(&legacy_quote)
                    .or_else(|| pair.strip_suffix(&wire_quote))?;
                if base.is_empty() {
                    return None;
                }
                let volume = t.v.get(1)?.parse::<f64>().ok()?;
                let last = t.c.first()?.parse::<f64>().ok()?;
                Some((Symbol::new(&Self::from_kraken_asset(base), &quote), volume * last))
            })
            .collect();

        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        pairs.dedup_by(|a, b| a.0 == b.0);
        Ok(pairs.into_iter().take(limit).map(|(s, _)| s).collect())
    }

    async fn get_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let result: HashMap<String, serde_json::Value> = self
            .public(
                "/0/public/OHLC",
                &[
                    ("pair", Self::format_symbol(symbol)),
                    ("interval", Self::interval_minutes(timeframe).to_string()),
                ],
                Some(symbol),
            )
            .await?;

        // {"<pair>": [[time, open, high, low, close, vwap, volume, count], ...], "last": n}
        let rows = result
            .iter()
            .find(|(k, _)| k.as_str() != "last")
            .and_then(|(_, v)| v.as_array())
            .ok_or_else(|| ExchangeError::Decode("kraken: OHLC payload missing rows".into()))?;

        let candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.len() < 7 {
                    return None;
                }
                Some(Candle {
                    open_time: row[0].as_i64()? * 1000,
                    open: num(&row[1])?,
                    high: num(&row[2])?,
                    low: num(&row[3])?,
                    close: num(&row[4])?,
                    volume: num(&row[6])?,
                })
            })
            .collect();

        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("pair", Self::format_symbol(&order.symbol)),
            ("type", order.side.to_string().to_lowercase()),
            ("volume", signing::format_quantity(order.quantity, 8)?),
        ];
        match order.order_type {
            OrderType::Market => params.push(("ordertype", "market".to_string())),
            OrderType::Limit => {
                let price = order.price.ok_or_else(|| {
                    ExchangeError::RejectedByExchange("limit order without price".into())
                })?;
                params.push(("ordertype", "limit".to_string()));
                params.push(("price", signing::format_quantity(price, 8)?));
            }
        }

        let result: AddOrderResult = self.private("/0/private/AddOrder", &params).await?;
        let order_id = result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Decode("kraken: AddOrder returned no txid".into()))?;

        // Fill details arrive asynchronously; the ack only confirms acceptance
        Ok(OrderAck {
            order_id,
            exchange: "kraken".to_string(),
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
        let _: serde_json::Value = self
            .private("/0/private/CancelOrder", &[("txid", order_id.to_string())])
            .await?;
        Ok(())
    }

    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        let balances: HashMap<String, String> = self.private("/0/private/Balance", &[]).await?;
        let wanted = currency.to_uppercase();
        Ok(balances
            .iter()
            .find(|(asset, _)| Self::from_kraken_asset(asset) == wanted)
            .and_then(|(_, amount)| amount.parse::<f64>().ok())
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_aliases() {
        assert_eq!(
            KrakenAdapter::format_symbol(&Symbol::new("BTC", "USDT")),
            "XBTUSDT"
        );
        assert_eq!(
            KrakenAdapter::format_symbol(&Symbol::new("ETH", "USD")),
            "ETHUSD"
        );
        assert_eq!(KrakenAdapter::from_kraken_asset("XXBT"), "BTC");
        assert_eq!(KrakenAdapter::from_kraken_asset("ZUSD"), "USD");
        assert_eq!(KrakenAdapter::from_kraken_asset("XDG"), "DOGE");
        assert_eq!(KrakenAdapter::from_kraken_asset("SOL"), "SOL");
    }

    #[test]
    fn test_unknown_pair_maps_to_symbol_not_supported() {
        let symbol = Symbol::new("FOO", "USDT");
        let err = KrakenAdapter::map_api_error(
            &["EQuery:Unknown asset pair".to_string()],
            Some(&symbol),
        );
        assert!(err.is_permanent_for_symbol());
    }

    #[test]
    fn test_envelope_errors_are_classified() {
        let raw = r#"{"error":["EAPI:Rate limit exceeded"]}"#;
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(raw).unwrap();
        let err = KrakenAdapter::unwrap_envelope(envelope, None).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_ticker_payload_decodes() {
        let raw = r#"{"error":[],"result":{"XXBTZUSD":{
            "a":["50010.0","1","1.000"],"b":["50000.0","2","2.000"],
            "c":["50005.0","0.1"],"v":["100.0","2500.5"]}}}"#;
        let envelope: Envelope<HashMap<String, PairTicker>> = serde_json::from_str(raw).unwrap();
        let result = KrakenAdapter::unwrap_envelope(envelope, None).unwrap();
        let t = result.values().next().unwrap();
        assert_eq!(t.a[0], "50010.0");
        assert_eq!(t.v[1], "2500.5");
    }
}
