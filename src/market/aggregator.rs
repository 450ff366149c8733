//! Market data aggregator - concurrent fan-out to every available exchange

use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::timeout;

use crate::config::MarketConfig;
use crate::error::{ExchangeError, MarketDataError};
use crate::exchange::{ExchangeAdapter, ExchangeRegistry};
use crate::market::{build_consensus, merge_candles, rank_universe, ConsensusCache};
use crate::types::{Candle, ConsensusTicker, Symbol, TickerSnapshot, Timeframe};

pub struct MarketDataAggregator {
    registry: Arc<ExchangeRegistry>,
    divergence_threshold_pct: f64,
    ttl: Duration,
    query_timeout: Duration,
    cache: ConsensusCache,
    /// (exchange, symbol) pairs that reported SymbolNotSupported
    unsupported: RwLock<HashSet<(String, Symbol)>>,
}

impl MarketDataAggregator {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        config: &MarketConfig,
        query_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            divergence_threshold_pct: config.divergence_threshold_pct,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            query_timeout,
            cache: ConsensusCache::new(),
            unsupported: RwLock::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ConsensusCache {
        &self.cache
    }

    pub fn is_unsupported(&self, exchange: &str, symbol: &Symbol) -> bool {
        self.unsupported
            .read()
            .map(|u| u.contains(&(exchange.to_string(), symbol.clone())))
            .unwrap_or(false)
    }

    /// Every available exchange has reported `symbol` as unlisted
    pub fn unsupported_everywhere(&self, symbol: &Symbol) -> bool {
        let names = self.registry.list_available();
        !names.is_empty() && names.iter().all(|name| self.is_unsupported(name, symbol))
    }

    fn remember_unsupported(&self, exchange: &str, symbol: &Symbol) {
        if let Ok(mut unsupported) = self.unsupported.write() {
            if unsupported.insert((exchange.to_string(), symbol.clone())) {
                tracing::info!(
                    exchange = %exchange,
                    symbol = %symbol,
                    "Symbol not listed, excluding pair"
                );
            }
        }
    }

    /// Adapters worth asking about `symbol`
    fn targets(
        &self,
        symbol: &Symbol,
    ) -> Result<Vec<(String, Arc<dyn ExchangeAdapter>)>, MarketDataError> {
        let entries = self.registry.available_entries();
        if entries.is_empty() {
            return Err(MarketDataError::NoExchanges);
        }
        Ok(entries
            .into_iter()
            .filter(|(name, _)| !self.is_unsupported(name, symbol))
            .collect())
    }

    /// Book-keeping for a failed per-exchange query
    fn record_failure(&self, exchange: &str, symbol: &Symbol, err: &ExchangeError) {
        if err.is_permanent_for_symbol() {
            self.remember_unsupported(exchange, symbol);
        } else if err.is_transient() {
            self.registry.mark_failure(exchange);
        } else {
            tracing::debug!(exchange = %exchange, symbol = %symbol, error = %err, "Query failed");
        }
    }

    /// Consensus ticker, served from cache while fresh
    pub async fn consensus_ticker(
        &self,
        symbol: &Symbol,
    ) -> Result<ConsensusTicker, MarketDataError> {
        if let Some(cached) = self.cache.get_fresh(symbol, Utc::now()) {
            return Ok(cached);
        }

        let targets = self.targets(symbol)?;
        let queries = targets.iter().map(|(name, adapter)| async move {
            let result = timeout(self.query_timeout, adapter.get_ticker(symbol)).await;
            (name.as_str(), result)
        });

        let mut snapshots: Vec<TickerSnapshot> = Vec::with_capacity(targets.len());
        for (name, result) in join_all(queries).await {
            match result {
                Ok(Ok(mut snapshot)) => {
                    self.registry.mark_success(name);
                    // Sources are reported by registry name
                    snapshot.exchange = name.to_string();
                    snapshots.push(snapshot);
                }
                Ok(Err(e)) => self.record_failure(name, symbol, &e),
                Err(_) => {
                    tracing::warn!(exchange = %name, symbol = %symbol, "Ticker query timed out");
                    self.registry.mark_failure(name);
                }
            }
        }

        let consensus =
            build_consensus(symbol, &snapshots, self.divergence_threshold_pct, self.ttl)?;

        if consensus.low_confidence {
            tracing::warn!(
                symbol = %symbol,
                price = consensus.price,
                divergence_pct = consensus.max_divergence_pct,
                sources = ?consensus.sources,
                excluded = ?consensus.excluded,
                "Low-confidence consensus"
            );
        } else {
            tracing::debug!(
                symbol = %symbol,
                price = consensus.price,
                sources = consensus.exchange_count(),
                excluded = consensus.excluded.len(),
                "Consensus formed"
            );
        }

        self.cache.put(consensus.clone());
        Ok(consensus)
    }

    /// Candles merged across exchanges, oldest first
    pub async fn history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let targets = self.targets(symbol)?;
        let queries = targets.iter().map(|(name, adapter)| async move {
            let request = adapter.get_history(symbol, timeframe, limit);
            let result = timeout(self.query_timeout, request).await;
            (name.as_str(), result)
        });

        let mut series: Vec<Vec<Candle>> = Vec::new();
        for (name, result) in join_all(queries).await {
            match result {
                Ok(Ok(candles)) if !candles.is_empty() => series.push(candles),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => self.record_failure(name, symbol, &e),
                Err(_) => {
                    tracing::warn!(exchange = %name, symbol = %symbol, "History query timed out");
                    self.registry.mark_failure(name);
                }
            }
        }

        let merged = merge_candles(&series);
        if merged.is_empty() {
            return Err(MarketDataError::StaleData {
                symbol: symbol.clone(),
            });
        }
        let skip = merged.len().saturating_sub(limit);
        Ok(merged.into_iter().skip(skip).collect())
    }

    /// Symbols to evaluate this cycle
    pub async fn symbol_universe(
        &self,
        quote: &str,
        limit: usize,
        defaults: &[Symbol],
    ) -> Vec<Symbol> {
        let entries = self.registry.available_entries();
        let queries = entries.iter().map(|(name, adapter)| async move {
            let result = timeout(self.query_timeout, adapter.get_top_symbols(quote, limit)).await;
            (name.as_str(), result)
        });

        let mut lists: Vec<Vec<Symbol>> = Vec::new();
        for (name, result) in join_all(queries).await {
            match result {
                Ok(Ok(symbols)) => lists.push(symbols),
                Ok(Err(e)) => {
                    tracing::warn!(exchange = %name, error = %e, "Top symbols unavailable");
                    if e.is_transient() {
                        self.registry.mark_failure(name);
                    }
                }
                Err(_) => {
                    tracing::warn!(exchange = %name, "Top symbols query timed out");
                    self.registry.mark_failure(name);
                }
            }
        }

        let universe = rank_universe(&lists, defaults, limit);
        tracing::info!(
            count = universe.len(),
            exchanges = lists.len(),
            "Symbol universe selected"
        );
        universe
    }
}
