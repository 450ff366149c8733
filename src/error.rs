//! Error taxonomy for exchange access, market data and position coordination

use std::time::Duration;
use thiserror::Error;

use crate::types::Symbol;

/// Failures reported by an exchange adapter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("exchange unreachable: {0}")]
    Connectivity(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{symbol} not supported on {exchange}")]
    SymbolNotSupported { exchange: String, symbol: Symbol },

    #[error("insufficient funds: need {needed:.4}, have {available:.4}")]
    InsufficientFunds { needed: f64, available: f64 },

    #[error("rejected by exchange: {0}")]
    RejectedByExchange(String),

    #[error("exchange '{0}' is disabled")]
    Disabled(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Connectivity(_) | ExchangeError::RateLimited { .. }
        )
    }

    /// The symbol should never be queried on this exchange again
    pub fn is_permanent_for_symbol(&self) -> bool {
        matches!(self, ExchangeError::SymbolNotSupported { .. })
    }
}

/// Failures forming a consensus view
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("no exchange returned data for {symbol}")]
    StaleData { symbol: Symbol },

    #[error("no exchanges available")]
    NoExchanges,
}

/// Failures opening or closing positions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error("maximum open positions reached ({0})")]
    MaxPositionsReached(usize),

    #[error("insufficient capital: need {needed:.2}, available {available:.2}")]
    InsufficientCapital { needed: f64, available: f64 },

    #[error("position already open for {0}")]
    DuplicatePosition(Symbol),

    #[error("no open position for {0}")]
    UnknownPosition(Symbol),

    #[error("signal for {0} is not actionable")]
    NotActionable(Symbol),

    #[error("position book unavailable")]
    StateUnavailable,

    #[error("no available venue quotes {0}")]
    NoVenue(Symbol),

    #[error("fill for {symbol} cost {cost:.2}, above its allocation of {allocation:.2}")]
    FillExceedsAllocation {
        symbol: Symbol,
        cost: f64,
        allocation: f64,
    },

    #[error(transparent)]
    Order(#[from] ExchangeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Connectivity("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited { retry_after: None }.is_transient());
        assert!(!ExchangeError::RejectedByExchange("bad qty".into()).is_transient());

        let unsupported = ExchangeError::SymbolNotSupported {
            exchange: "gemini".into(),
            symbol: Symbol::new("SOL", "USDT"),
        };
        assert!(!unsupported.is_transient());
        assert!(unsupported.is_permanent_for_symbol());
    }

    #[test]
    fn test_coordinator_error_wraps_exchange_error() {
        let err: CoordinatorError = ExchangeError::InsufficientFunds {
            needed: 10.0,
            available: 1.0,
        }
        .into();
        assert!(matches!(err, CoordinatorError::Order(_)));
        assert!(err.to_string().contains("insufficient funds"));
    }
}
