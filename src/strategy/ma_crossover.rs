//! Moving-average crossover trend strategy

use std::collections::BTreeMap;

use crate::features;
use crate::strategy::Strategy;
use crate::types::{Candle, ConsensusTicker, Signal, SignalDirection, Symbol};

/// Gap between the averages, relative to price, that maps to full confidence
const FULL_CONFIDENCE_GAP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaKind {
    Sma,
    Ema,
}

impl MaKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sma" => Some(MaKind::Sma),
            "ema" => Some(MaKind::Ema),
            _ => None,
        }
    }

    fn compute(&self, values: &[f64], period: usize) -> Option<f64> {
        match self {
            MaKind::Sma => features::sma(values, period),
            MaKind::Ema => features::ema(values, period),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaCrossoverStrategy {
    fast: usize,
    slow: usize,
    kind: MaKind,
}

impl MaCrossoverStrategy {
    pub fn new(fast: usize, slow: usize, kind: MaKind) -> Self {
        Self { fast, slow, kind }
    }
}

impl Strategy for MaCrossoverStrategy {
    fn id(&self) -> &str {
        "ma_crossover"
    }

    fn generate_signal(
        &self,
        symbol: &Symbol,
        ticker: &ConsensusTicker,
        history: &[Candle],
    ) -> Signal {
        let closes = features::closes(history);
        let (fast, slow) = match (
            self.kind.compute(&closes, self.fast),
            self.kind.compute(&closes, self.slow),
        ) {
            (Some(f), Some(s)) => (f, s),
            _ => {
                tracing::debug!(
                    symbol = %symbol,
                    candles = history.len(),
                    slow = self.slow,
                    "Moving averages unavailable, holding"
                );
                return Signal::hold(symbol.clone(), self.id());
            }
        };

        let price = ticker.price;
        if !price.is_finite() || price <= 0.0 {
            return Signal::hold(symbol.clone(), self.id());
        }

        let direction = if fast > slow {
            SignalDirection::Buy
        } else if fast < slow {
            SignalDirection::Sell
        } else {
            SignalDirection::Hold
        };
        let confidence = ((fast - slow).abs() / price / FULL_CONFIDENCE_GAP).min(1.0);

        let mut indicators = BTreeMap::new();
        indicators.insert("ma_fast".to_string(), fast);
        indicators.insert("ma_slow".to_string(), slow);
        indicators.insert("price".to_string(), price);

        Signal::new(symbol.clone(), self.id(), direction, confidence, indicators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{make_history, make_ticker};

    fn eth() -> Symbol {
        Symbol::new("ETH", "USDT")
    }

    #[test]
    fn test_golden_cross_buys() {
        let strategy = MaCrossoverStrategy::new(3, 6, MaKind::Sma);
        // fast = 101, slow = 100.5, price 100 -> 0.5 / 100 / 0.1
        let closes = [100.0, 100.0, 100.0, 101.0, 101.0, 101.0];
        let signal = strategy.generate_signal(
            &eth(),
            &make_ticker(&eth(), 100.0, false),
            &make_history(&closes),
        );
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert!((signal.confidence - 0.05).abs() < 1e-9);
        assert_eq!(signal.indicators["ma_fast"], 101.0);
    }

    #[test]
    fn test_death_cross_sells_with_capped_confidence() {
        let strategy = MaCrossoverStrategy::new(2, 4, MaKind::Sma);
        let closes = [100.0, 100.0, 50.0, 40.0];
        let signal = strategy.generate_signal(
            &eth(),
            &make_ticker(&eth(), 40.0, false),
            &make_history(&closes),
        );
        assert_eq!(signal.direction, SignalDirection::Sell);
        assert_eq!(signal.confidence, 1.0);
    }

    #[test]
    fn test_insufficient_history_holds() {
        let strategy = MaCrossoverStrategy::new(20, 50, MaKind::Ema);
        let signal = strategy.generate_signal(
            &eth(),
            &make_ticker(&eth(), 100.0, false),
            &make_history(&[100.0; 30]),
        );
        assert_eq!(signal.direction, SignalDirection::Hold);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_ma_kind_names() {
        assert_eq!(MaKind::from_name("EMA"), Some(MaKind::Ema));
        assert_eq!(MaKind::from_name("wma"), None);
    }
}
