//! Core types used throughout RankBot
//!
//! Defines common data structures for symbols, tickers, candles, signals and orders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Trading pair in canonical `BASE/QUOTE` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.trim().to_uppercase(),
            quote: quote.trim().to_uppercase(),
        }
    }

    /// Parse "BTC/USDT" or "BTC-USDT" (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        let (base, quote) = s.split_once('/').or_else(|| s.split_once('-'))?;
        if base.trim().is_empty() || quote.trim().is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Same base, different quote currency
    pub fn with_quote(&self, quote: &str) -> Self {
        Self::new(&self.base, quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl TryFrom<String> for Symbol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::parse(&value).ok_or_else(|| format!("invalid symbol '{}'", value))
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.to_string()
    }
}

/// Ticker reported by a single exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: Symbol,
    /// Last traded price
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    /// 24h volume in base currency
    pub volume: f64,
    /// Exchange that produced the snapshot
    pub exchange: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated ticker across exchanges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusTicker {
    pub symbol: Symbol,
    /// Consensus price (volume-weighted mean of non-outlier snapshots)
    pub price: f64,
    /// Best bid among contributing snapshots
    pub bid: f64,
    /// Best ask among contributing snapshots
    pub ask: f64,
    /// Summed volume of contributing snapshots
    pub volume: f64,
    /// Exchanges whose snapshot contributed to the price, highest volume first
    pub sources: Vec<String>,
    /// Exchanges that responded but were discarded as outliers
    pub excluded: Vec<String>,
    /// Largest pairwise divergence among all responding snapshots, percent of the minimum
    pub max_divergence_pct: f64,
    /// Sources disagreed and no majority could be formed
    pub low_confidence: bool,
    pub timestamp: DateTime<Utc>,
    /// How long this consensus may be served from cache
    pub ttl: Duration,
}

impl ConsensusTicker {
    pub fn exchange_count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        age.to_std().map(|a| a < self.ttl).unwrap_or(true)
    }
}

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Min1,
    Min5,
    Min15,
    Hour1,
    Hour4,
    Day1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Hour1
    }
}

impl Timeframe {
    pub fn duration_secs(&self) -> u64 {
        match self {
            Timeframe::Min1 => 60,
            Timeframe::Min5 => 5 * 60,
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
            Timeframe::Hour4 => 4 * 60 * 60,
            Timeframe::Day1 => 24 * 60 * 60,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1m" => Some(Timeframe::Min1),
            "5m" => Some(Timeframe::Min5),
            "15m" => Some(Timeframe::Min15),
            "1h" => Some(Timeframe::Hour1),
            "4h" => Some(Timeframe::Hour4),
            "1d" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Min1 => write!(f, "1m"),
            Timeframe::Min5 => write!(f, "5m"),
            Timeframe::Min15 => write!(f, "15m"),
            Timeframe::Hour1 => write!(f, "1h"),
            Timeframe::Hour4 => write!(f, "4h"),
            Timeframe::Day1 => write!(f, "1d"),
        }
    }
}

/// Direction of a trading signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalDirection {
    Buy,
    Sell,
    Hold,
}

impl SignalDirection {
    /// Order side used to enter a position in this direction
    pub fn entry_side(&self) -> Option<OrderSide> {
        match self {
            SignalDirection::Buy => Some(OrderSide::Buy),
            SignalDirection::Sell => Some(OrderSide::Sell),
            SignalDirection::Hold => None,
        }
    }
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalDirection::Buy => write!(f, "BUY"),
            SignalDirection::Sell => write!(f, "SELL"),
            SignalDirection::Hold => write!(f, "HOLD"),
        }
    }
}

/// Trading signal generated by a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Symbol,
    pub direction: SignalDirection,
    /// Confidence level (0.0 - 1.0)
    pub confidence: f64,
    /// Indicator values that produced the signal
    pub indicators: BTreeMap<String, f64>,
    /// Strategy that generated this signal
    pub strategy_id: String,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    /// Build a signal, failing closed to HOLD/0 on NaN or out-of-range confidence
    pub fn new(
        symbol: Symbol,
        strategy_id: &str,
        direction: SignalDirection,
        confidence: f64,
        indicators: BTreeMap<String, f64>,
    ) -> Self {
        let indicators_ok = indicators.values().all(|v| v.is_finite());
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) || !indicators_ok {
            tracing::warn!(
                symbol = %symbol,
                strategy = %strategy_id,
                confidence = confidence,
                "Invalid signal, failing closed to HOLD"
            );
            return Self::hold(symbol, strategy_id);
        }

        Self {
            symbol,
            direction,
            confidence,
            indicators,
            strategy_id: strategy_id.to_string(),
            generated_at: Utc::now(),
        }
    }

    /// Neutral signal with zero confidence
    pub fn hold(symbol: Symbol, strategy_id: &str) -> Self {
        Self {
            symbol,
            direction: SignalDirection::Hold,
            confidence: 0.0,
            indicators: BTreeMap::new(),
            strategy_id: strategy_id.to_string(),
            generated_at: Utc::now(),
        }
    }

    /// Buy or sell with non-zero confidence
    pub fn is_actionable(&self) -> bool {
        self.direction != SignalDirection::Hold && self.confidence > 0.0
    }

    /// Scale confidence down, keeping it in range
    pub fn discounted(mut self, factor: f64) -> Self {
        self.confidence = (self.confidence * factor.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order to submit through an exchange adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    /// Quantity in base currency
    pub quantity: f64,
    pub order_type: OrderType,
    /// Limit price (required for LIMIT orders)
    pub price: Option<f64>,
    /// Client-generated id for idempotency on the exchange side
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol,
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            client_order_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::New => write!(f, "NEW"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub exchange: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Filled quantity in base currency
    pub filled_qty: f64,
    /// Average fill price (0 if unknown)
    pub avg_price: f64,
    /// Fee paid in quote currency
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parse_formats() {
        let a = Symbol::parse("btc/usdt").unwrap();
        let b = Symbol::parse("BTC-USDT").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "BTC/USDT");
        assert!(Symbol::parse("BTCUSDT").is_none());
        assert!(Symbol::parse("/USDT").is_none());
    }

    #[test]
    fn test_symbol_serde_as_string() {
        let s = Symbol::new("ETH", "USDT");
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"ETH/USDT\"");
        let back: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_signal_fails_closed_on_nan() {
        let sig = Signal::new(
            Symbol::new("BTC", "USDT"),
            "rsi",
            SignalDirection::Buy,
            f64::NAN,
            BTreeMap::new(),
        );
        assert_eq!(sig.direction, SignalDirection::Hold);
        assert_eq!(sig.confidence, 0.0);
    }

    #[test]
    fn test_signal_fails_closed_out_of_range() {
        let sig = Signal::new(
            Symbol::new("BTC", "USDT"),
            "rsi",
            SignalDirection::Sell,
            1.5,
            BTreeMap::new(),
        );
        assert_eq!(sig.direction, SignalDirection::Hold);
        assert!(!sig.is_actionable());
    }

    #[test]
    fn test_signal_discount_stays_in_range() {
        let sig = Signal::new(
            Symbol::new("BTC", "USDT"),
            "rsi",
            SignalDirection::Buy,
            0.8,
            BTreeMap::new(),
        )
        .discounted(0.5);
        assert!((sig.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_consensus_freshness() {
        let ticker = ConsensusTicker {
            symbol: Symbol::new("BTC", "USDT"),
            price: 50000.0,
            bid: 49990.0,
            ask: 50010.0,
            volume: 10.0,
            sources: vec!["binance".to_string()],
            excluded: Vec::new(),
            max_divergence_pct: 0.0,
            low_confidence: false,
            timestamp: Utc::now() - chrono::Duration::seconds(120),
            ttl: Duration::from_secs(60),
        };
        assert!(!ticker.is_fresh(Utc::now()));
        assert_eq!(ticker.exchange_count(), 1);
    }
}
