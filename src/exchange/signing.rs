//! Request signing and order-quantity formatting shared by the live adapters

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::config::ExchangeCredentials;
use crate::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;
type HmacSha512 = Hmac<Sha512>;

fn auth_err(what: &str) -> ExchangeError {
    ExchangeError::Auth(what.to_string())
}

/// Fail early when an authenticated endpoint is called without keys
pub fn require_credentials(
    exchange: &str,
    creds: &ExchangeCredentials,
) -> Result<(), ExchangeError> {
    if creds.is_configured() {
        Ok(())
    } else {
        Err(ExchangeError::Auth(format!(
            "{} API key/secret not configured",
            exchange
        )))
    }
}

/// Binance: hex(HMAC-SHA256(secret, query))
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> Result<String, ExchangeError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| auth_err("invalid HMAC key"))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Coinbase / KuCoin: base64(HMAC-SHA256(secret, message))
pub fn hmac_sha256_base64(secret: &[u8], message: &[u8]) -> Result<String, ExchangeError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| auth_err("invalid HMAC key"))?;
    mac.update(message);
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Gemini: hex(HMAC-SHA384(secret, base64 payload))
pub fn hmac_sha384_hex(secret: &[u8], message: &[u8]) -> Result<String, ExchangeError> {
    let mut mac =
        HmacSha384::new_from_slice(secret).map_err(|_| auth_err("invalid HMAC key"))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Kraken: base64(HMAC-SHA512(b64decode(secret), path + SHA256(nonce + body)))
pub fn kraken_signature(
    secret_b64: &str,
    path: &str,
    nonce: &str,
    body: &str,
) -> Result<String, ExchangeError> {
    let secret = decode_secret(secret_b64)?;
    let mut sha = Sha256::new();
    sha.update(nonce.as_bytes());
    sha.update(body.as_bytes());
    let digest = sha.finalize();

    let mut mac =
        HmacSha512::new_from_slice(&secret).map_err(|_| auth_err("invalid HMAC key"))?;
    mac.update(path.as_bytes());
    mac.update(&digest);
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Base64 secrets (Coinbase, Kraken)
pub fn decode_secret(secret_b64: &str) -> Result<Vec<u8>, ExchangeError> {
    general_purpose::STANDARD
        .decode(secret_b64.trim())
        .map_err(|_| auth_err("API secret is not valid base64"))
}

pub fn base64_encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

/// Header map from static lowercase names and dynamic values
pub fn headers(pairs: &[(&'static str, &str)]) -> Result<HeaderMap, ExchangeError> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let value = HeaderValue::from_str(value)
            .map_err(|_| ExchangeError::Auth(format!("invalid value for header {}", name)))?;
        map.insert(HeaderName::from_static(name), value);
    }
    Ok(map)
}

/// Truncate to `dp` decimals without scientific notation. Zero or negative is rejected.
pub fn format_quantity(value: f64, dp: u32) -> Result<String, ExchangeError> {
    let decimal = Decimal::from_f64(value)
        .ok_or_else(|| ExchangeError::RejectedByExchange(format!("invalid quantity {}", value)))?
        .round_dp_with_strategy(dp, RoundingStrategy::ToZero)
        .normalize();
    if decimal <= dec!(0) {
        return Err(ExchangeError::RejectedByExchange(format!(
            "quantity {} rounds to zero at {} decimals",
            value, dp
        )));
    }
    Ok(decimal.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_signature_matches_reference() {
        // Reference vector from the Binance API documentation
        let secret = b"NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let sig = hmac_sha256_hex(secret, query.as_bytes()).unwrap();
        assert_eq!(
            sig,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_kraken_signature_shape() {
        let secret = base64_encode(b"kraken-secret");
        let sig = kraken_signature(
            &secret,
            "/0/private/AddOrder",
            "1616492376594",
            "nonce=1616492376594",
        )
        .unwrap();
        assert_eq!(decode_secret(&sig).unwrap().len(), 64);
    }

    #[test]
    fn test_bad_base64_secret_is_auth_error() {
        assert!(matches!(
            decode_secret("not base64 !!"),
            Err(ExchangeError::Auth(_))
        ));
    }

    #[test]
    fn test_format_quantity_truncates() {
        assert_eq!(format_quantity(0.123456789, 6).unwrap(), "0.123456");
        assert_eq!(format_quantity(2.0, 8).unwrap(), "2");
        assert!(format_quantity(0.0000001, 4).is_err());
        assert!(format_quantity(f64::NAN, 4).is_err());
    }

    #[test]
    fn test_require_credentials() {
        let empty = ExchangeCredentials::default();
        assert!(require_credentials("binance", &empty).is_err());
    }
}
