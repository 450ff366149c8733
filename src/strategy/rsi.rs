//! RSI mean-reversion strategy
//!
//! Below 50 the symbol is oversold-leaning (BUY), above 50 overbought-leaning
//! (SELL). Confidence grows linearly with distance from neutral and reaches
//! 1.0 at the oversold/overbought threshold on that side.

use std::collections::BTreeMap;

use crate::features;
use crate::strategy::Strategy;
use crate::types::{Candle, ConsensusTicker, Signal, SignalDirection, Symbol};

const NEUTRAL: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct RsiStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiStrategy {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Self {
        Self {
            period,
            oversold,
            overbought,
        }
    }

    /// Direction and confidence for an RSI reading
    pub fn score(&self, rsi: f64) -> (SignalDirection, f64) {
        let (direction, span) = if rsi < NEUTRAL {
            (SignalDirection::Buy, NEUTRAL - self.oversold)
        } else if rsi > NEUTRAL {
            (SignalDirection::Sell, self.overbought - NEUTRAL)
        } else {
            (SignalDirection::Hold, NEUTRAL)
        };
        // Thresholds on the wrong side of neutral fall back to the full scale
        let span = if span > 0.0 { span } else { NEUTRAL };
        let confidence = ((rsi - NEUTRAL).abs() / span).clamp(0.0, 1.0);
        (direction, confidence)
    }
}

impl Strategy for RsiStrategy {
    fn id(&self) -> &str {
        "rsi"
    }

    fn generate_signal(
        &self,
        symbol: &Symbol,
        ticker: &ConsensusTicker,
        history: &[Candle],
    ) -> Signal {
        let closes = features::closes(history);
        let rsi = match features::rsi(&closes, self.period) {
            Some(v) => v,
            None => {
                tracing::debug!(
                    symbol = %symbol,
                    candles = history.len(),
                    period = self.period,
                    "RSI unavailable, holding"
                );
                return Signal::hold(symbol.clone(), self.id());
            }
        };

        let (direction, confidence) = self.score(rsi);
        let mut indicators = BTreeMap::new();
        indicators.insert("rsi".to_string(), rsi);
        indicators.insert("oversold".to_string(), self.oversold);
        indicators.insert("overbought".to_string(), self.overbought);
        indicators.insert("price".to_string(), ticker.price);

        Signal::new(symbol.clone(), self.id(), direction, confidence, indicators)
    }
}
