//! Offline exchange with geometric-Brownian-motion prices
//!
//! Used for tests, demos and `exchanges.enabled = ["simulated"]`. Every
//! ticker request advances the price of that symbol by one GBM step.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ExchangeError;
use crate::exchange::{Capabilities, ExchangeAdapter};
use crate::types::{
    Candle, OrderAck, OrderRequest, OrderStatus, Symbol, TickerSnapshot, Timeframe,
};

/// Starting prices by base asset
const SEED_PRICES: &[(&str, f64)] = &[
    ("BTC", 65000.0),
    ("ETH", 3500.0),
    ("BNB", 550.0),
    ("SOL", 120.0),
    ("XRP", 0.55),
];

/// Listing order returned by `get_top_symbols`
const LISTED_BASES: &[&str] = &[
    "BTC", "ETH", "BNB", "SOL", "XRP", "ADA", "DOGE", "DOT", "AVAX", "LINK", "MATIC", "UNI",
];

const DEFAULT_VOLATILITY: f64 = 0.01;
const HALF_SPREAD: f64 = 0.0002;
const SIMULATED_FEE: f64 = 0.001;
const DEFAULT_BALANCE: f64 = 100_000.0;

struct SimState {
    rng: StdRng,
    prices: HashMap<Symbol, f64>,
    /// Pinned volumes; unpinned symbols get a random volume per request
    volumes: HashMap<Symbol, f64>,
    unsupported: HashSet<Symbol>,
    next_order_id: u64,
}

impl SimState {
    fn price_of(&mut self, symbol: &Symbol) -> f64 {
        *self.prices.entry(symbol.clone()).or_insert_with(|| {
            SEED_PRICES
                .iter()
                .find(|(base, _)| *base == symbol.base())
                .map(|(_, p)| *p)
                .unwrap_or(1.0)
        })
    }

    /// Standard normal draw (Box-Muller)
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn step(&mut self, price: f64, volatility: f64) -> f64 {
        if volatility <= 0.0 {
            return price;
        }
        let z = self.gaussian();
        price * (volatility * z - 0.5 * volatility * volatility).exp()
    }
}

pub struct SimulatedExchange {
    name: String,
    volatility: f64,
    latency: Duration,
    state: Mutex<SimState>,
    ticker_calls: AtomicUsize,
}

impl SimulatedExchange {
    pub fn new(name: &str) -> Self {
        Self::build(name, StdRng::from_entropy())
    }

    /// Reproducible price paths
    pub fn with_seed(name: &str, seed: u64) -> Self {
        Self::build(name, StdRng::seed_from_u64(seed))
    }

    fn build(name: &str, rng: StdRng) -> Self {
        Self {
            name: name.to_string(),
            volatility: DEFAULT_VOLATILITY,
            latency: Duration::ZERO,
            state: Mutex::new(SimState {
                rng,
                prices: HashMap::new(),
                volumes: HashMap::new(),
                unsupported: HashSet::new(),
                next_order_id: 1,
            }),
            ticker_calls: AtomicUsize::new(0),
        }
    }

    /// Per-step volatility; zero freezes prices
    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility.max(0.0);
        self
    }

    /// Delay applied to every market data response
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Pin the price and volume reported for `symbol`
    pub fn set_market(&self, symbol: &Symbol, price: f64, volume: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.prices.insert(symbol.clone(), price);
            state.volumes.insert(symbol.clone(), volume);
        }
    }

    /// Make `symbol` fail with `SymbolNotSupported`
    pub fn delist(&self, symbol: &Symbol) {
        if let Ok(mut state) = self.state.lock() {
            state.unsupported.insert(symbol.clone());
        }
    }

    /// Number of `get_ticker` calls served so far
    pub fn ticker_calls(&self) -> usize {
        self.ticker_calls.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>, ExchangeError> {
        self.state
            .lock()
            .map_err(|_| ExchangeError::Connectivity(format!("{}: state poisoned", self.name)))
    }

    fn ensure_listed(&self, state: &SimState, symbol: &Symbol) -> Result<(), ExchangeError> {
        if state.unsupported.contains(symbol) {
            return Err(ExchangeError::SymbolNotSupported {
                exchange: self.name.clone(),
                symbol: symbol.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spot_trading: true,
            paper_mode: true,
        }
    }

    async fn connect(&self) -> bool {
        true
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        self.ticker_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        let mut state = self.lock()?;
        self.ensure_listed(&state, symbol)?;

        let pinned_volume = state.volumes.get(symbol).copied();
        let price = match pinned_volume {
            // Pinned markets keep their price
            Some(_) => state.price_of(symbol),
            None => {
                let current = state.price_of(symbol);
                let next = state.step(current, self.volatility);
                state.prices.insert(symbol.clone(), next);
                next
            }
        };
        let volume = match pinned_volume {
            Some(v) => v,
            None => state.rng.gen_range(100.0..1000.0),
        };

        Ok(TickerSnapshot {
            symbol: symbol.clone(),
            last: price,
            bid: price * (1.0 - HALF_SPREAD),
            ask: price * (1.0 + HALF_SPREAD),
            volume,
            exchange: self.name.clone(),
            timestamp: Utc::now(),
        })
    }

    async fn get_top_symbols(
        &self,
        quote: &str,
        limit: usize,
    ) -> Result<Vec<Symbol>, ExchangeError> {
        let state = self.lock()?;
        Ok(LISTED_BASES
            .iter()
            .map(|base| Symbol::new(base, quote))
            .filter(|s| !state.unsupported.contains(s))
            .take(limit)
            .collect())
    }

    async fn get_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.simulate_latency().await;
        let mut state = self.lock()?;
        self.ensure_listed(&state, symbol)?;

        let step_ms = (timeframe.duration_secs() * 1000) as i64;
        let now_ms = Utc::now().timestamp_millis();
        let last_open = now_ms - now_ms.rem_euclid(step_ms);

        // Walk backwards from the current price so the window ends at "now"
        let mut closes = Vec::with_capacity(limit);
        let mut price = state.price_of(symbol);
        for _ in 0..limit {
            closes.push(price);
            price = state.step(price, self.volatility);
        }
        closes.reverse();

        let mut candles = Vec::with_capacity(limit);
        let mut prev_close = closes.first().copied().unwrap_or(price);
        for (i, close) in closes.into_iter().enumerate() {
            let open = prev_close;
            let wiggle = state.rng.gen_range(0.0..0.002);
            candles.push(Candle {
                open_time: last_open - (limit - 1 - i) as i64 * step_ms,
                open,
                high: open.max(close) * (1.0 + wiggle),
                low: open.min(close) * (1.0 - wiggle),
                close,
                volume: state.rng.gen_range(10.0..100.0),
            });
            prev_close = close;
        }
        Ok(candles)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if !order.quantity.is_finite() || order.quantity <= 0.0 {
            return Err(ExchangeError::RejectedByExchange(format!(
                "invalid quantity {}",
                order.quantity
            )));
        }
        let mut state = self.lock()?;
        self.ensure_listed(&state, &order.symbol)?;

        let price = state.price_of(&order.symbol);
        let order_id = format!("{}-{}", self.name, state.next_order_id);
        state.next_order_id += 1;

        Ok(OrderAck {
            order_id,
            exchange: self.name.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: OrderStatus::Filled,
            filled_qty: order.quantity,
            avg_price: price,
            fee: order.quantity * price * SIMULATED_FEE,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<(), ExchangeError> {
        Err(ExchangeError::RejectedByExchange(format!(
            "order {} already filled",
            order_id
        )))
    }

    async fn get_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        Ok(match currency.to_uppercase().as_str() {
            "USDT" | "USD" | "USDC" => DEFAULT_BALANCE,
            _ => 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    #[tokio::test]
    async fn test_seeded_paths_are_reproducible() {
        let a = SimulatedExchange::with_seed("sim", 7);
        let b = SimulatedExchange::with_seed("sim", 7);
        for _ in 0..5 {
            let ta = a.get_ticker(&btc()).await.unwrap();
            let tb = b.get_ticker(&btc()).await.unwrap();
            assert_eq!(ta.last, tb.last);
            assert_eq!(ta.volume, tb.volume);
        }
    }

    #[tokio::test]
    async fn test_prices_start_near_seed() {
        let ex = SimulatedExchange::with_seed("sim", 1);
        let t = ex.get_ticker(&btc()).await.unwrap();
        assert!((t.last - 65000.0).abs() / 65000.0 < 0.1);
        assert!(t.bid < t.last && t.last < t.ask);

        let t = ex.get_ticker(&Symbol::new("PEPE", "USDT")).await.unwrap();
        assert!((t.last - 1.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_pinned_market() {
        let ex = SimulatedExchange::with_seed("sim", 1);
        ex.set_market(&btc(), 50000.0, 12.0);
        let t = ex.get_ticker(&btc()).await.unwrap();
        assert_eq!(t.last, 50000.0);
        assert_eq!(t.volume, 12.0);
        assert_eq!(ex.ticker_calls(), 1);
    }

    #[tokio::test]
    async fn test_history_is_oldest_first_and_ends_at_price() {
        let ex = SimulatedExchange::with_seed("sim", 3).with_volatility(0.0);
        ex.set_market(&btc(), 100.0, 1.0);
        let candles = ex.get_history(&btc(), Timeframe::Hour1, 30).await.unwrap();
        assert_eq!(candles.len(), 30);
        assert!(candles.windows(2).all(|w| w[0].open_time < w[1].open_time));
        assert_eq!(candles.last().unwrap().close, 100.0);
    }

    #[tokio::test]
    async fn test_delisted_symbol() {
        let ex = SimulatedExchange::with_seed("sim", 3);
        ex.delist(&btc());
        let err = ex.get_ticker(&btc()).await.unwrap_err();
        assert!(err.is_permanent_for_symbol());
        let top = ex.get_top_symbols("USDT", 3).await.unwrap();
        assert!(!top.contains(&btc()));
    }

    #[tokio::test]
    async fn test_market_order_fills_at_current_price() {
        let ex = SimulatedExchange::with_seed("sim", 3);
        ex.set_market(&btc(), 50000.0, 1.0);
        let ack = ex
            .place_order(&OrderRequest::market(btc(), OrderSide::Buy, 0.1))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.avg_price, 50000.0);
        assert!((ack.fee - 5.0).abs() < 1e-9);
    }
}
