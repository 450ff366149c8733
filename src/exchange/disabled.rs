//! No-op adapter returned for unknown or misconfigured exchanges

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::exchange::{Capabilities, ExchangeAdapter};
use crate::types::{Candle, OrderAck, OrderRequest, Symbol, TickerSnapshot, Timeframe};

/// Every call fails with [`ExchangeError::Disabled`]
pub struct DisabledExchange {
    name: String,
}

impl DisabledExchange {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn disabled(&self) -> ExchangeError {
        ExchangeError::Disabled(self.name.clone())
    }
}

#[async_trait]
impl ExchangeAdapter for DisabledExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: false,
            paper_mode: false,
        }
    }

    async fn connect(&self) -> bool {
        false
    }

    async fn get_ticker(&self, _symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        Err(self.disabled())
    }

    async fn get_top_symbols(
        &self,
        _quote: &str,
        _limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        Err(self.disabled())
    }

    async fn get_history(
        &self,
        _symbol: &Symbol,
        _timeframe: Timeframe,
        _limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        Err(self.disabled())
    }

    async fn place_order(&self, _order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        Err(self.disabled())
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &Symbol) -> Result<(), ExchangeError> {
        Err(self.disabled())
    }

    async fn get_balance(&self, _currency: &str) -> Result<f64, ExchangeError> {
        Err(self.disabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_call_fails_disabled() {
        let ex = DisabledExchange::new("ftx");
        assert!(!ex.connect().await);
        let err = ex.get_ticker(&Symbol::new("BTC", "USDT")).await.unwrap_err();
        assert_eq!(err, ExchangeError::Disabled("ftx".into()));
        assert!(ex.get_balance("USDT").await.is_err());
    }
}
