//! Strategies - turn a consensus ticker and a history window into a signal
//!
//! Strategies are resolved once at startup from the configured name via
//! [`StrategyKind`]. Every strategy fails closed: too little history or a
//! non-finite indicator yields HOLD with zero confidence.

mod ma_crossover;
mod rsi;

pub use ma_crossover::{MaCrossoverStrategy, MaKind};
pub use rsi::RsiStrategy;

use anyhow::{bail, Result};

use crate::config::StrategyConfig;
use crate::types::{Candle, ConsensusTicker, Signal, Symbol};

/// Signal generator over one symbol
pub trait Strategy: Send + Sync {
    /// Identifier recorded on every signal
    fn id(&self) -> &str;

    fn generate_signal(
        &self,
        symbol: &Symbol,
        ticker: &ConsensusTicker,
        history: &[Candle],
    ) -> Signal;
}

/// Known strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Rsi,
    MaCrossover,
}

impl StrategyKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "rsi" | "rsi_strategy" => Some(StrategyKind::Rsi),
            "ma_crossover" | "moving_average_crossover" => Some(StrategyKind::MaCrossover),
            _ => None,
        }
    }

    pub fn build(&self, config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
        Ok(match self {
            StrategyKind::Rsi => Box::new(RsiStrategy::new(
                config.rsi_period,
                config.rsi_oversold,
                config.rsi_overbought,
            )),
            StrategyKind::MaCrossover => {
                let kind = MaKind::from_name(&config.ma_type).ok_or_else(|| {
                    anyhow::anyhow!("unknown moving average type '{}'", config.ma_type)
                })?;
                if config.ma_fast == 0 || config.ma_fast >= config.ma_slow {
                    bail!(
                        "ma_fast ({}) must be positive and below ma_slow ({})",
                        config.ma_fast,
                        config.ma_slow
                    );
                }
                Box::new(MaCrossoverStrategy::new(config.ma_fast, config.ma_slow, kind))
            }
        })
    }
}

/// Resolve the configured strategy. Unknown names are a startup error.
pub fn from_config(config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    match StrategyKind::from_name(&config.name) {
        Some(kind) => kind.build(config),
        None => bail!("unknown strategy '{}'", config.name),
    }
}

/// Run `strategy` and discount signals built on a low-confidence consensus
pub fn evaluate(
    strategy: &dyn Strategy,
    symbol: &Symbol,
    ticker: &ConsensusTicker,
    history: &[Candle],
    low_confidence_discount: f64,
) -> Signal {
    let signal = strategy.generate_signal(symbol, ticker, history);
    if ticker.low_confidence {
        signal.discounted(low_confidence_discount)
    } else {
        signal
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::types::SignalDirection;

    #[test]
    fn test_strategy_names() {
        assert_eq!(StrategyKind::from_name("RSI"), Some(StrategyKind::Rsi));
        assert_eq!(StrategyKind::from_name("rsi_strategy"), Some(StrategyKind::Rsi));
        assert_eq!(
            StrategyKind::from_name("moving_average_crossover"),
            Some(StrategyKind::MaCrossover)
        );
        assert_eq!(StrategyKind::from_name("macd"), None);
    }

    #[test]
    fn test_from_config_rejects_unknown() {
        let config = StrategyConfig {
            name: "astrology".into(),
            ..Default::default()
        };
        assert!(from_config(&config).is_err());

        let config = StrategyConfig {
            name: "ma_crossover".into(),
            ma_fast: 50,
            ma_slow: 20,
            ..Default::default()
        };
        assert!(from_config(&config).is_err());
    }

    #[test]
    fn test_low_confidence_consensus_is_discounted() {
        let strategy = from_config(&StrategyConfig::default()).unwrap();
        let symbol = Symbol::new("BTC", "USDT");
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let history = make_history(&closes);

        let trusted = evaluate(
            strategy.as_ref(),
            &symbol,
            &make_ticker(&symbol, 71.0, false),
            &history,
            0.5,
        );
        let doubtful = evaluate(
            strategy.as_ref(),
            &symbol,
            &make_ticker(&symbol, 71.0, true),
            &history,
            0.5,
        );
        assert_eq!(trusted.direction, SignalDirection::Buy);
        assert_eq!(trusted.confidence, 1.0);
        assert_eq!(doubtful.confidence, 0.5);
    }
}
