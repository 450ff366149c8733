//! Shared REST client for the live adapters
//!
//! Maps transport failures and HTTP status codes onto [`ExchangeError`] and
//! applies the retry policy to idempotent GET requests.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::ExchangeError;
use crate::exchange::RetryPolicy;
use crate::types::Symbol;

/// Thin reqwest wrapper owned by one adapter
#[derive(Debug, Clone)]
pub struct RestClient {
    exchange: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl RestClient {
    pub fn new(
        exchange: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rankbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ExchangeError::Connectivity(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            exchange: exchange.to_string(),
            client,
            retry,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// GET with retries on transient failures
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let label = format!("{} GET {}", self.exchange, url);
        self.retry
            .run(&label, || async {
                let request = self.client.get(url).query(query);
                self.execute(request).await
            })
            .await
    }

    /// Single attempt, for non-idempotent calls such as order placement
    pub async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<String>,
    ) -> Result<T, ExchangeError> {
        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        self.execute(request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ExchangeError> {
        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.text().await.map_err(map_transport)?;

        if !status.is_success() {
            tracing::debug!(
                exchange = %self.exchange,
                status = status.as_u16(),
                body = %truncate(&body, 200),
                "Exchange returned error status"
            );
            return Err(map_status(status, &body, retry_after));
        }

        serde_json::from_str(&body).map_err(|e| {
            ExchangeError::Decode(format!("{}: {} ({})", self.exchange, e, truncate(&body, 120)))
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub(crate) fn map_transport(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Connectivity(format!("timeout: {}", err))
    } else if err.is_decode() {
        ExchangeError::Decode(err.to_string())
    } else {
        ExchangeError::Connectivity(err.to_string())
    }
}

/// Map an HTTP status code onto the error taxonomy
pub(crate) fn map_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> ExchangeError {
    match status.as_u16() {
        429 | 418 => ExchangeError::RateLimited { retry_after },
        401 | 403 => ExchangeError::Auth(format!("{}: {}", status, truncate(body, 200))),
        s if s >= 500 => ExchangeError::Connectivity(format!("server error {}", status)),
        _ => ExchangeError::RejectedByExchange(format!("{}: {}", status, truncate(body, 200))),
    }
}

const UNKNOWN_SYMBOL_MARKERS: &[&str] = &[
    "invalid symbol",
    "unknown asset pair",
    "unknown symbol",
    "invalidsymbol",
    "notfound",
    "not found",
    "symbol not exists",
];

/// Reclassify a rejection that really means "this exchange does not list the pair"
pub(crate) fn classify_symbol_error(
    err: ExchangeError,
    exchange: &str,
    symbol: &Symbol,
) -> ExchangeError {
    let unknown = match &err {
        ExchangeError::RejectedByExchange(msg) | ExchangeError::Decode(msg) => {
            let lower = msg.to_lowercase().replace(['_', ' '], "");
            UNKNOWN_SYMBOL_MARKERS
                .iter()
                .any(|m| lower.contains(&m.replace(' ', "")))
        }
        _ => false,
    };

    if unknown {
        ExchangeError::SymbolNotSupported {
            exchange: exchange.to_string(),
            symbol: symbol.clone(),
        }
    } else {
        err
    }
}

/// Parse a numeric string field from an exchange payload
pub(crate) fn parse_field(value: &str, field: &str) -> Result<f64, ExchangeError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| {
            ExchangeError::Decode(format!("field '{}' is not numeric: {:?}", field, value))
        })
}

/// Parse a JSON number or numeric string
pub(crate) fn num(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "", Some(Duration::from_secs(3))),
            ExchangeError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(map_status(StatusCode::BAD_GATEWAY, "", None).is_transient());
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "{\"msg\":\"bad qty\"}", None),
            ExchangeError::RejectedByExchange(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "", None),
            ExchangeError::Auth(_)
        ));
    }

    #[test]
    fn test_unknown_symbol_reclassified() {
        let symbol = Symbol::new("FOO", "USDT");
        let err = map_status(
            StatusCode::BAD_REQUEST,
            "{\"code\":-1121,\"msg\":\"Invalid symbol.\"}",
            None,
        );
        let err = classify_symbol_error(err, "binance", &symbol);
        assert!(err.is_permanent_for_symbol());

        let other = classify_symbol_error(
            ExchangeError::RejectedByExchange("insufficient margin".into()),
            "binance",
            &symbol,
        );
        assert!(!other.is_permanent_for_symbol());
    }

    #[test]
    fn test_num_accepts_strings_and_numbers() {
        assert_eq!(num(&serde_json::json!("1.5")), Some(1.5));
        assert_eq!(num(&serde_json::json!(2)), Some(2.0));
        assert_eq!(num(&serde_json::json!(null)), None);
    }
}
