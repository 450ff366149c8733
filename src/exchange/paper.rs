//! Paper trading wrapper
//!
//! Market data comes from the wrapped adapter; orders are filled locally at
//! the last traded price against in-memory balances. A SELL larger than the
//! base holding opens a short, which needs the full notional as quote
//! collateral.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::ExchangeError;
use crate::exchange::{Capabilities, ExchangeAdapter};
use crate::types::{
    Candle, OrderAck, OrderRequest, OrderSide, OrderStatus, Symbol, TickerSnapshot, Timeframe,
};

pub struct PaperExchange {
    inner: Arc<dyn ExchangeAdapter>,
    taker_fee: f64,
    /// Free balance per currency; negative base balances are open shorts
    balances: RwLock<HashMap<String, f64>>,
    next_order_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(inner: Arc<dyn ExchangeAdapter>, taker_fee: f64) -> Self {
        Self {
            inner,
            taker_fee,
            balances: RwLock::new(HashMap::new()),
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Seed a starting balance
    pub fn with_balance(self, currency: &str, amount: f64) -> Self {
        if let Ok(mut balances) = self.balances.write() {
            balances.insert(currency.to_uppercase(), amount);
        }
        self
    }

    pub fn balance_of(&self, currency: &str) -> f64 {
        self.balances
            .read()
            .map(|b| b.get(&currency.to_uppercase()).copied().unwrap_or(0.0))
            .unwrap_or(0.0)
    }

    /// Apply a fill at `price` or explain why it cannot happen
    fn settle(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Result<f64, ExchangeError> {
        let mut balances = self
            .balances
            .write()
            .map_err(|_| ExchangeError::Connectivity("paper balances poisoned".into()))?;

        let notional = quantity * price;
        let fee = notional * self.taker_fee;
        let quote_free = balances.get(symbol.quote()).copied().unwrap_or(0.0);
        let base_held = balances.get(symbol.base()).copied().unwrap_or(0.0);

        match side {
            OrderSide::Buy => {
                let needed = notional + fee;
                if quote_free < needed {
                    return Err(ExchangeError::InsufficientFunds {
                        needed,
                        available: quote_free,
                    });
                }
                balances.insert(symbol.quote().to_string(), quote_free - needed);
                balances.insert(symbol.base().to_string(), base_held + quantity);
            }
            OrderSide::Sell => {
                let covered = base_held.max(0.0).min(quantity);
                let short = quantity - covered;
                // Shorted notional must be fully collateralised
                let collateral = short * price + fee;
                if short > 0.0 && quote_free < collateral {
                    return Err(ExchangeError::InsufficientFunds {
                        needed: collateral,
                        available: quote_free,
                    });
                }
                balances.insert(symbol.quote().to_string(), quote_free + notional - fee);
                balances.insert(symbol.base().to_string(), base_held - quantity);
            }
        }
        Ok(fee)
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: self.inner.capabilities().spot_trading,
            paper_mode: true,
        }
    }

    async fn connect(&self) -> bool {
        self.inner.connect().await
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        self.inner.get_ticker(symbol).await
    }

    async fn get_top_symbols(
        &self,
        quote: &str,
        limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        self.inner.get_top_symbols(quote, limit).await
    }

    async fn get_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.inner.get_history(symbol, timeframe, limit).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if !order.quantity.is_finite() || order.quantity <= 0.0 {
            return Err(ExchangeError::RejectedByExchange(format!(
                "invalid quantity {}",
                order.quantity
            )));
        }

        let ticker = self.inner.get_ticker(&order.symbol).await?;
        let price = ticker.last;
        let fee = self.settle(&order.symbol, order.side, order.quantity, price)?;
        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            exchange = %self.inner.name(),
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            price = price,
            fee = fee,
            "Paper order filled"
        );

        Ok(OrderAck {
            order_id: format!("paper-{}", id),
            exchange: self.inner.name().to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: OrderStatus::Filled,
            filled_qty: order.quantity,
            avg_price: price,
            fee,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<(), ExchangeError> {
        // Paper orders fill immediately
        Err(ExchangeError::RejectedByExchange(format!(
            "paper order {} already filled",
            order_id
        )))
    }

    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        Ok(self.balance_of(currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimulatedExchange;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    fn make_paper(usdt: f64) -> PaperExchange {
        let sim = SimulatedExchange::with_seed("binance", 11);
        sim.set_market(&btc(), 50000.0, 100.0);
        PaperExchange::new(Arc::new(sim), 0.001).with_balance("USDT", usdt)
    }

    #[tokio::test]
    async fn test_buy_debits_cost_and_fee() {
        let paper = make_paper(10_000.0);
        let ack = paper
            .place_order(&OrderRequest::market(btc(), OrderSide::Buy, 0.1))
            .await
            .unwrap();
        assert_eq!(ack.avg_price, 50000.0);
        assert!((paper.balance_of("USDT") - (10_000.0 - 5000.0 - 5.0)).abs() < 1e-9);
        assert!((paper.balance_of("BTC") - 0.1).abs() < 1e-12);
        assert_eq!(paper.name(), "binance");
        assert!(paper.capabilities().paper_mode);
    }

    #[tokio::test]
    async fn test_buy_without_funds_is_rejected() {
        let paper = make_paper(100.0);
        let err = paper
            .place_order(&OrderRequest::market(btc(), OrderSide::Buy, 0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));
        assert_eq!(paper.balance_of("USDT"), 100.0);
    }

    #[tokio::test]
    async fn test_short_round_trip() {
        let paper = make_paper(10_000.0);
        paper
            .place_order(&OrderRequest::market(btc(), OrderSide::Sell, 0.1))
            .await
            .unwrap();
        assert!((paper.balance_of("BTC") + 0.1).abs() < 1e-12);

        paper
            .place_order(&OrderRequest::market(btc(), OrderSide::Buy, 0.1))
            .await
            .unwrap();
        assert!(paper.balance_of("BTC").abs() < 1e-12);
        // Flat price: only the two fees are lost
        assert!((paper.balance_of("USDT") - (10_000.0 - 10.0)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_short_needs_collateral() {
        let paper = make_paper(1000.0);
        let err = paper
            .place_order(&OrderRequest::market(btc(), OrderSide::Sell, 0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));
    }
}
