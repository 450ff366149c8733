//! Trading engine - runs ranking cycles and serves the command surface
//!
//! A single task owns the engine, so cycles never overlap: the periodic tick
//! and the `RunCycleNow` / `ForceClose` commands are handled one at a time.
//! Each cycle runs universe -> consensus + history + signal per symbol ->
//! rank -> exits -> opens -> journal -> publish snapshot. Orders for a
//! symbol go to the highest-volume exchange among its consensus sources.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::coordinator::{ClosedTrade, Coordinator, PortfolioState, Position};
use crate::error::{CoordinatorError, ExchangeError, MarketDataError};
use crate::exchange::{ExchangeAdapter, ExchangeRegistry, ExchangeStatus};
use crate::market::MarketDataAggregator;
use crate::persistence::{PortfolioSnapshotRecord, SignalRecord, TradeJournal, TradeRecord};
use crate::ranking::{RankedOpportunity, SymbolRanker};
use crate::risk::RiskConfig;
use crate::strategy::{self, Strategy};
use crate::types::{ConsensusTicker, Signal, Symbol, Timeframe};

const COMMAND_BUFFER: usize = 32;

/// Requests accepted from the presentation layer
#[derive(Debug)]
pub enum EngineCommand {
    RunCycleNow,
    ForceClose {
        symbol: Symbol,
        reply: oneshot::Sender<Result<ClosedTrade, CoordinatorError>>,
    },
}

/// Why a symbol was left out of (or degraded in) a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// No exchange returned usable data
    StaleData,
    /// Every available exchange reported the symbol as unlisted
    SymbolNotSupported,
    /// No candle history to evaluate
    NoHistory,
    /// Evaluated, but the consensus was low-confidence and the signal discounted
    LowConfidenceConsensus,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::StaleData => write!(f, "STALE_DATA"),
            SkipReason::SymbolNotSupported => write!(f, "SYMBOL_NOT_SUPPORTED"),
            SkipReason::NoHistory => write!(f, "NO_HISTORY"),
            SkipReason::LowConfidenceConsensus => write!(f, "LOW_CONFIDENCE_CONSENSUS"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSymbol {
    pub symbol: Symbol,
    pub reason: SkipReason,
}

/// What the last completed cycle produced
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub evaluated: usize,
    pub ranked: Vec<RankedOpportunity>,
    pub skipped: Vec<SkippedSymbol>,
    pub opened: Vec<Symbol>,
    pub closed: Vec<Symbol>,
    /// Stopped early by shutdown
    pub cancelled: bool,
    /// No exchange was available, nothing was evaluated
    pub halted: bool,
}

/// Cloneable front door to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    snapshot: Arc<RwLock<Option<EngineSnapshot>>>,
    coordinator: Arc<Coordinator>,
    registry: Arc<ExchangeRegistry>,
}

impl EngineHandle {
    pub async fn request_cycle(&self) -> Result<()> {
        if self.commands.send(EngineCommand::RunCycleNow).await.is_err() {
            bail!("engine stopped");
        }
        Ok(())
    }

    /// Close the position on `symbol` at market and wait for the outcome
    pub async fn force_close(&self, symbol: Symbol) -> Result<ClosedTrade> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::ForceClose { symbol, reply })
            .await
            .is_err()
        {
            bail!("engine stopped");
        }
        match response.await {
            Ok(result) => Ok(result?),
            Err(_) => bail!("engine dropped the force-close request"),
        }
    }

    pub fn ranked(&self) -> Vec<RankedOpportunity> {
        self.last_cycle().map(|s| s.ranked).unwrap_or_default()
    }

    pub fn skipped(&self) -> Vec<SkippedSymbol> {
        self.last_cycle().map(|s| s.skipped).unwrap_or_default()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.coordinator.positions()
    }

    pub fn portfolio(&self) -> PortfolioState {
        self.coordinator.portfolio()
    }

    pub fn exchanges(&self) -> Vec<ExchangeStatus> {
        self.registry.statuses()
    }

    pub fn last_cycle(&self) -> Option<EngineSnapshot> {
        self.snapshot.read().ok().and_then(|s| s.clone())
    }
}

/// Symbol evaluated this cycle
struct Evaluation {
    signal: Signal,
    consensus: ConsensusTicker,
}

pub struct TradingEngine {
    registry: Arc<ExchangeRegistry>,
    aggregator: MarketDataAggregator,
    strategy: Box<dyn Strategy>,
    ranker: SymbolRanker,
    coordinator: Arc<Coordinator>,
    journal: Arc<dyn TradeJournal>,
    quote_currency: String,
    universe_size: usize,
    default_symbols: Vec<Symbol>,
    timeframe: Timeframe,
    history_limit: usize,
    low_confidence_discount: f64,
    interval: Duration,
    cycle: AtomicU64,
    snapshot: Arc<RwLock<Option<EngineSnapshot>>>,
    commands_tx: mpsc::Sender<EngineCommand>,
    commands_rx: mpsc::Receiver<EngineCommand>,
}

impl TradingEngine {
    pub fn new(
        config: &AppConfig,
        registry: Arc<ExchangeRegistry>,
        journal: Arc<dyn TradeJournal>,
    ) -> Result<Self> {
        let strategy = strategy::from_config(&config.strategy)?;
        let risk = RiskConfig::from_settings(&config.risk)?;
        let timeframe = match Timeframe::from_str(&config.market.history_timeframe) {
            Some(tf) => tf,
            None => bail!(
                "unknown history timeframe '{}'",
                config.market.history_timeframe
            ),
        };

        let quote = config.bot.quote_currency.to_uppercase();
        let default_symbols = config
            .bot
            .default_symbols
            .iter()
            .map(|base| Symbol::parse(base).unwrap_or_else(|| Symbol::new(base, &quote)))
            .collect();

        let aggregator = MarketDataAggregator::new(
            registry.clone(),
            &config.market,
            config.exchanges.query_timeout(),
        );
        let coordinator = Arc::new(Coordinator::new(
            risk,
            config.risk.max_positions,
            config.risk.initial_capital,
        ));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        info!(
            strategy = strategy.id(),
            timeframe = %timeframe,
            max_positions = config.risk.max_positions,
            paper = registry.is_paper(),
            "Trading engine configured"
        );

        Ok(Self {
            registry,
            aggregator,
            strategy,
            ranker: SymbolRanker::new(config.strategy.min_confidence)
                .with_limit(config.bot.opportunity_limit),
            coordinator,
            journal,
            quote_currency: quote,
            universe_size: config.bot.universe_size,
            default_symbols,
            timeframe,
            history_limit: config.market.history_limit,
            low_confidence_discount: config.market.low_confidence_discount,
            interval: Duration::from_secs(config.bot.interval_secs.max(1)),
            cycle: AtomicU64::new(0),
            snapshot: Arc::new(RwLock::new(None)),
            commands_tx,
            commands_rx,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            commands: self.commands_tx.clone(),
            snapshot: self.snapshot.clone(),
            coordinator: self.coordinator.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn aggregator(&self) -> &MarketDataAggregator {
        &self.aggregator
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Trading engine started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let event = tokio::select! {
                _ = ticker.tick() => Event::Tick,
                Some(command) = self.commands_rx.recv() => Event::Command(command),
                changed = shutdown.changed() => Event::Shutdown(changed.is_err()),
            };

            match event {
                Event::Tick => {
                    self.run_cycle_until(Some(&shutdown)).await;
                }
                Event::Command(command) => self.handle_command(command, &shutdown).await,
                Event::Shutdown(sender_gone) => {
                    if sender_gone || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Trading engine stopped");
        Ok(())
    }

    async fn handle_command(&self, command: EngineCommand, shutdown: &watch::Receiver<bool>) {
        match command {
            EngineCommand::RunCycleNow => {
                info!("Cycle requested");
                self.run_cycle_until(Some(shutdown)).await;
            }
            EngineCommand::ForceClose { symbol, reply } => {
                let result = self.force_close(&symbol).await;
                if reply.send(result).is_err() {
                    debug!(symbol = %symbol, "Force-close requester went away");
                }
            }
        }
    }

    /// Close a position immediately, journaling the trade
    pub async fn force_close(&self, symbol: &Symbol) -> Result<ClosedTrade, CoordinatorError> {
        let position = self
            .coordinator
            .position(symbol)
            .ok_or_else(|| CoordinatorError::UnknownPosition(symbol.clone()))?;
        let venue = self.registry.get(&position.exchange).ok_or_else(|| {
            CoordinatorError::Order(ExchangeError::Disabled(position.exchange.clone()))
        })?;

        let trade = self.coordinator.force_close(symbol, venue.as_ref()).await?;
        self.journal_trade(&trade).await;
        self.journal_portfolio().await;
        Ok(trade)
    }

    /// One full cycle, not cancellable
    pub async fn run_cycle(&self) -> EngineSnapshot {
        self.run_cycle_until(None).await
    }

    async fn run_cycle_until(&self, cancel: Option<&watch::Receiver<bool>>) -> EngineSnapshot {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let started_at = Utc::now();
        let cancelled = || cancel.map(|c| *c.borrow()).unwrap_or(false);

        info!(cycle = cycle, "Ranking cycle started");

        let purged = self.aggregator.cache().purge(started_at);
        if purged > 0 {
            debug!(cycle = cycle, purged = purged, "Expired consensus entries dropped");
        }

        self.registry.probe_unreachable().await;
        if self.registry.list_available().is_empty() {
            warn!(cycle = cycle, "No exchange available, cycle halted");
            let snapshot = EngineSnapshot {
                cycle,
                started_at,
                finished_at: Utc::now(),
                evaluated: 0,
                ranked: Vec::new(),
                skipped: Vec::new(),
                opened: Vec::new(),
                closed: Vec::new(),
                cancelled: false,
                halted: true,
            };
            self.publish(snapshot.clone());
            return snapshot;
        }

        let universe = self
            .aggregator
            .symbol_universe(&self.quote_currency, self.universe_size, &self.default_symbols)
            .await;

        let mut evaluations: Vec<Evaluation> = Vec::with_capacity(universe.len());
        let mut skipped: Vec<SkippedSymbol> = Vec::new();
        let mut was_cancelled = false;

        for symbol in &universe {
            if cancelled() {
                info!(cycle = cycle, "Cycle cancelled between symbols");
                was_cancelled = true;
                break;
            }
            match self.evaluate_symbol(symbol).await {
                Ok(evaluation) => {
                    if evaluation.consensus.low_confidence {
                        skipped.push(SkippedSymbol {
                            symbol: symbol.clone(),
                            reason: SkipReason::LowConfidenceConsensus,
                        });
                    }
                    evaluations.push(evaluation);
                }
                Err(reason) => {
                    debug!(symbol = %symbol, reason = %reason, "Symbol skipped");
                    skipped.push(SkippedSymbol {
                        symbol: symbol.clone(),
                        reason,
                    });
                }
            }
        }

        let evaluated = evaluations.len();
        let records: Vec<SignalRecord> = evaluations
            .iter()
            .map(|e| {
                SignalRecord::from_signal(
                    &e.signal,
                    e.consensus.price,
                    false,
                    e.consensus.low_confidence,
                )
            })
            .collect();
        let prices: HashMap<Symbol, f64> = evaluations
            .iter()
            .map(|e| (e.symbol().clone(), e.consensus.price))
            .collect();

        let ranked = self.ranker.rank(
            evaluations
                .into_iter()
                .map(|e| (e.signal, e.consensus))
                .collect(),
        );
        self.log_ranking(cycle, &ranked);

        let mut closed = Vec::new();
        let mut opened = Vec::new();
        if !was_cancelled {
            closed = self.process_exits(prices).await;
            // A symbol exited this cycle waits for the next one
            let candidates: Vec<RankedOpportunity> = ranked
                .iter()
                .filter(|o| !closed.contains(o.symbol()))
                .cloned()
                .collect();
            opened = self.open_positions(&candidates).await;
        }

        let executed: HashSet<String> = opened.iter().map(|s| s.to_string()).collect();
        for mut record in records {
            record.executed = executed.contains(&record.symbol);
            if let Err(e) = self.journal.append_signal(&record).await {
                warn!(symbol = %record.symbol, error = %e, "Failed to journal signal");
            }
        }
        self.journal_portfolio().await;

        let snapshot = EngineSnapshot {
            cycle,
            started_at,
            finished_at: Utc::now(),
            evaluated,
            ranked,
            skipped,
            opened,
            closed,
            cancelled: was_cancelled,
            halted: false,
        };

        let portfolio = self.coordinator.portfolio();
        info!(
            cycle = cycle,
            ranked = snapshot.ranked.len(),
            skipped = snapshot.skipped.len(),
            opened = snapshot.opened.len(),
            closed = snapshot.closed.len(),
            open_positions = portfolio.open_positions,
            available = %format!("{:.2}", portfolio.available_capital),
            realised_pnl = %format!("{:+.2}", portfolio.realised_pnl),
            "Ranking cycle finished"
        );

        self.publish(snapshot.clone());
        snapshot
    }

    async fn evaluate_symbol(&self, symbol: &Symbol) -> Result<Evaluation, SkipReason> {
        let consensus = match self.aggregator.consensus_ticker(symbol).await {
            Ok(c) => c,
            Err(MarketDataError::StaleData { .. }) | Err(MarketDataError::NoExchanges) => {
                return Err(if self.aggregator.unsupported_everywhere(symbol) {
                    SkipReason::SymbolNotSupported
                } else {
                    SkipReason::StaleData
                });
            }
        };

        let history = self
            .aggregator
            .history(symbol, self.timeframe, self.history_limit)
            .await
            .map_err(|_| SkipReason::NoHistory)?;

        let signal = strategy::evaluate(
            self.strategy.as_ref(),
            symbol,
            &consensus,
            &history,
            self.low_confidence_discount,
        );
        debug!(
            symbol = %symbol,
            direction = %signal.direction,
            confidence = signal.confidence,
            price = consensus.price,
            "Signal generated"
        );
        Ok(Evaluation { signal, consensus })
    }

    /// Re-check stop-loss / take-profit on every open position
    async fn process_exits(&self, mut prices: HashMap<Symbol, f64>) -> Vec<Symbol> {
        for position in self.coordinator.positions() {
            if prices.contains_key(&position.symbol) {
                continue;
            }
            match self.aggregator.consensus_ticker(&position.symbol).await {
                Ok(consensus) => {
                    prices.insert(position.symbol.clone(), consensus.price);
                }
                Err(e) => warn!(
                    symbol = %position.symbol,
                    error = %e,
                    "No price for open position, exit check skipped"
                ),
            }
        }

        let mut closed = Vec::new();
        for exit in self.coordinator.check_exits(&prices) {
            let Some(venue) = self.registry.get(&exit.exchange) else {
                warn!(exchange = %exit.exchange, symbol = %exit.symbol, "Exit venue missing");
                continue;
            };
            info!(
                symbol = %exit.symbol,
                reason = %exit.reason,
                price = exit.price,
                "Exit triggered"
            );
            match self
                .coordinator
                .close_position(&exit.symbol, exit.reason, venue.as_ref())
                .await
            {
                Ok(trade) => {
                    self.journal_trade(&trade).await;
                    closed.push(exit.symbol);
                }
                Err(e) => warn!(symbol = %exit.symbol, error = %e, "Exit failed"),
            }
        }
        closed
    }

    /// Open positions, each on the deepest available exchange that
    /// contributed to its consensus
    async fn open_positions(&self, ranked: &[RankedOpportunity]) -> Vec<Symbol> {
        if ranked.is_empty() {
            return Vec::new();
        }
        let venues = self.registry.available_entries();
        debug!(venues = venues.len(), candidates = ranked.len(), "Opening positions");

        let report = self
            .coordinator
            .open_from_ranked_with(ranked, |opportunity| {
                route(&venues, opportunity).map(|(_, adapter)| adapter.as_ref())
            })
            .await;
        for (symbol, error) in &report.failed {
            if let CoordinatorError::Order(e) = error {
                if e.is_transient() {
                    let venue = ranked
                        .iter()
                        .find(|o| o.symbol() == symbol)
                        .and_then(|o| route(&venues, o));
                    if let Some((name, _)) = venue {
                        self.registry.mark_failure(name);
                    }
                }
            }
            debug!(symbol = %symbol, error = %error, "Opportunity not opened");
        }
        report.opened.into_iter().map(|p| p.symbol).collect()
    }

    async fn journal_trade(&self, trade: &ClosedTrade) {
        let record = TradeRecord::from_closed(trade, self.registry.is_paper());
        if let Err(e) = self.journal.append_trade(&record).await {
            warn!(id = %record.id, error = %e, "Failed to journal trade");
        }
    }

    async fn journal_portfolio(&self) {
        let state = self.coordinator.portfolio();
        let record = PortfolioSnapshotRecord::from_state(&state, self.registry.is_paper());
        if let Err(e) = self.journal.append_portfolio_snapshot(&record).await {
            warn!(error = %e, "Failed to journal portfolio snapshot");
        }
    }

    fn log_ranking(&self, cycle: u64, ranked: &[RankedOpportunity]) {
        for opportunity in ranked {
            info!(
                cycle = cycle,
                rank = opportunity.rank,
                symbol = %opportunity.symbol(),
                direction = %opportunity.signal.direction,
                confidence = %format!("{:.3}", opportunity.confidence()),
                volume = opportunity.volume(),
                low_confidence = opportunity.consensus.low_confidence,
                "Ranked"
            );
        }
    }

    fn publish(&self, snapshot: EngineSnapshot) {
        if let Ok(mut slot) = self.snapshot.write() {
            *slot = Some(snapshot);
        }
    }
}

impl Evaluation {
    fn symbol(&self) -> &Symbol {
        &self.signal.symbol
    }
}

/// First consensus source, by volume, that is still available. Outliers
/// never appear in `sources`, so they are never routed to.
fn route<'a>(
    venues: &'a [(String, Arc<dyn ExchangeAdapter>)],
    opportunity: &RankedOpportunity,
) -> Option<&'a (String, Arc<dyn ExchangeAdapter>)> {
    opportunity
        .consensus
        .sources
        .iter()
        .find_map(|source| venues.iter().find(|(name, _)| name == source))
}

enum Event {
    Tick,
    Command(EngineCommand),
    /// `true` when the shutdown sender was dropped
    Shutdown(bool),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeAdapter, SimulatedExchange};
    use crate::persistence::NullJournal;

    async fn make_engine(
        exchanges: Vec<Arc<SimulatedExchange>>,
        config: AppConfig,
    ) -> TradingEngine {
        let registry = Arc::new(ExchangeRegistry::new(&config.exchanges, false));
        for ex in exchanges {
            let name = ex.name().to_string();
            registry.insert(&name, ex);
        }
        registry.probe_all().await;
        TradingEngine::new(&config, registry, Arc::new(NullJournal)).unwrap()
    }

    fn make_config() -> AppConfig {
        let mut config = AppConfig::defaults().unwrap();
        config.bot.universe_size = 4;
        config.bot.default_symbols = vec!["BTC".into(), "ETH".into()];
        config.strategy.min_confidence = 0.0;
        config.market.history_limit = 40;
        config
    }

    #[tokio::test]
    async fn test_cycle_publishes_snapshot() {
        let sim = Arc::new(SimulatedExchange::with_seed("sim", 11));
        let engine = make_engine(vec![sim], make_config()).await;
        let handle = engine.handle();

        let snapshot = engine.run_cycle().await;
        assert_eq!(snapshot.cycle, 1);
        assert!(!snapshot.halted);
        assert!(snapshot.ranked.len() <= 4);
        assert!(snapshot.opened.len() <= 3);
        assert_eq!(handle.last_cycle().map(|s| s.cycle), Some(1));
        assert_eq!(handle.positions().len(), snapshot.opened.len());
    }

    #[tokio::test]
    async fn test_cycle_halts_without_exchanges() {
        let engine = make_engine(vec![], make_config()).await;
        let snapshot = engine.run_cycle().await;
        assert!(snapshot.halted);
        assert!(snapshot.ranked.is_empty());
    }

    #[tokio::test]
    async fn test_delisted_symbol_reported() {
        let sim = Arc::new(SimulatedExchange::with_seed("sim", 11));
        sim.delist(&Symbol::new("BTC", "USDT"));
        let mut config = make_config();
        // Large enough that the defaults pad the listed symbols
        config.bot.universe_size = 20;
        let engine = make_engine(vec![sim], config).await;
        let snapshot = engine.run_cycle().await;
        assert!(snapshot
            .skipped
            .iter()
            .any(|s| s.symbol == Symbol::new("BTC", "USDT")
                && s.reason == SkipReason::SymbolNotSupported));
    }

    #[tokio::test]
    async fn test_force_close_unknown_symbol() {
        let sim = Arc::new(SimulatedExchange::with_seed("sim", 11));
        let engine = make_engine(vec![sim], make_config()).await;
        let err = engine.force_close(&Symbol::new("DOGE", "USDT")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownPosition(_)));
    }

    #[test]
    fn test_unknown_timeframe_rejected() {
        let mut config = make_config();
        config.market.history_timeframe = "7m".into();
        let registry = Arc::new(ExchangeRegistry::new(&config.exchanges, false));
        assert!(TradingEngine::new(&config, registry, Arc::new(NullJournal)).is_err());
    }

    #[tokio::test]
    async fn test_orders_route_to_consensus_source_not_outlier() {
        let btc = Symbol::new("BTC", "USDT");
        let make_pinned = |name: &str, seed: u64, price: f64, volume: f64| {
            let ex = SimulatedExchange::with_seed(name, seed);
            ex.set_market(&btc, price, volume);
            Arc::new(ex)
        };
        // Registered first, and far from the other two
        let outlier = make_pinned("a", 1, 80_000.0, 500.0);
        let deep = make_pinned("b", 2, 50_000.0, 100.0);
        let shallow = make_pinned("c", 3, 50_050.0, 50.0);

        let mut config = make_config();
        config.bot.universe_size = 1;
        config.bot.default_symbols = vec!["BTC".into()];
        let engine = make_engine(vec![outlier, deep, shallow], config).await;

        let snapshot = engine.run_cycle().await;
        let consensus = &snapshot.ranked[0].consensus;
        assert_eq!(consensus.sources, vec!["b", "c"]);
        assert_eq!(consensus.excluded, vec!["a"]);
        assert_eq!(snapshot.opened, vec![btc.clone()]);

        let position = engine.coordinator().position(&btc).unwrap();
        assert_eq!(position.exchange, "b");
        assert_eq!(position.entry_price, 50_000.0);
        let cost = position.entry_price * position.quantity + position.entry_fee;
        assert!(cost <= position.allocation);
        assert!((position.entry_price - consensus.price).abs() / consensus.price < 0.01);
    }

    #[tokio::test]
    async fn test_symbol_exited_this_cycle_is_not_reopened() {
        let btc = Symbol::new("BTC", "USDT");
        let sim = Arc::new(SimulatedExchange::with_seed("sim", 11));
        sim.set_market(&btc, 100.0, 100.0);

        let mut config = make_config();
        config.bot.universe_size = 1;
        config.bot.default_symbols = vec!["BTC".into()];
        let engine = make_engine(vec![sim.clone()], config).await;

        let first = engine.run_cycle().await;
        assert_eq!(first.opened, vec![btc.clone()]);
        let position = engine.coordinator().position(&btc).unwrap();

        // Ten percent against the position is past any stop-loss
        let adverse = if position.is_long() { 90.0 } else { 110.0 };
        sim.set_market(&btc, adverse, 100.0);
        engine.aggregator().cache().invalidate(&btc);

        let second = engine.run_cycle().await;
        assert!(second.ranked.iter().any(|o| o.symbol() == &btc));
        assert_eq!(second.closed, vec![btc.clone()]);
        assert!(second.opened.is_empty());
        assert!(engine.coordinator().position(&btc).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_universe_cancels_cycle() {
        let sim =
            Arc::new(SimulatedExchange::with_seed("sim", 11).with_latency(Duration::from_secs(1)));
        let engine = make_engine(vec![sim], make_config()).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            // First symbol takes 2s (ticker + history); flip halfway through
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let _ = shutdown_tx.send(true);
        });

        let snapshot = engine.run_cycle_until(Some(&shutdown_rx)).await;
        assert!(snapshot.cancelled);
        assert!(!snapshot.halted);
        assert_eq!(snapshot.evaluated, 1);
        assert!(snapshot.opened.is_empty());
        assert!(snapshot.closed.is_empty());
        assert!(engine.coordinator().positions().is_empty());
    }

    #[tokio::test]
    async fn test_expired_cache_entries_purged_each_cycle() {
        let sim = Arc::new(SimulatedExchange::with_seed("sim", 11));
        let engine = make_engine(vec![sim], make_config()).await;
        let doge = Symbol::new("DOGE", "USDT");
        let written_at = Utc::now() - chrono::Duration::hours(1);
        engine.aggregator().cache().put(ConsensusTicker {
            symbol: doge.clone(),
            price: 0.1,
            bid: 0.1,
            ask: 0.1,
            volume: 1.0,
            sources: vec!["sim".into()],
            excluded: vec![],
            max_divergence_pct: 0.0,
            low_confidence: false,
            timestamp: written_at,
            ttl: Duration::from_secs(10),
        });

        engine.run_cycle().await;
        // Fresh as of its own timestamp, so only a purge removes it
        assert!(engine.aggregator().cache().get_fresh(&doge, written_at).is_none());
    }
}
