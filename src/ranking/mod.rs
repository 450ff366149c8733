//! Symbol ranker - orders actionable signals by confidence
//!
//! Order is total and deterministic: confidence descending, then consensus
//! volume descending, then symbol name ascending. Signals below the minimum
//! confidence (and HOLD signals) never make it into the list.

use serde::Serialize;
use std::cmp::Ordering;

use crate::types::{ConsensusTicker, Signal, Symbol};

/// A signal that made the cut, with the market view it was built on
#[derive(Debug, Clone, Serialize)]
pub struct RankedOpportunity {
    /// 1-based position in the ranked list
    pub rank: usize,
    pub signal: Signal,
    pub consensus: ConsensusTicker,
}

impl RankedOpportunity {
    pub fn symbol(&self) -> &Symbol {
        &self.signal.symbol
    }

    pub fn confidence(&self) -> f64 {
        self.signal.confidence
    }

    pub fn volume(&self) -> f64 {
        self.consensus.volume
    }
}

#[derive(Debug, Clone)]
pub struct SymbolRanker {
    min_confidence: f64,
    limit: Option<usize>,
}

impl SymbolRanker {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence: min_confidence.clamp(0.0, 1.0),
            limit: None,
        }
    }

    /// Keep at most `limit` opportunities; zero means unbounded
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Filter and order `(signal, consensus)` pairs
    pub fn rank(&self, candidates: Vec<(Signal, ConsensusTicker)>) -> Vec<RankedOpportunity> {
        let total = candidates.len();
        let mut kept: Vec<(Signal, ConsensusTicker)> = candidates
            .into_iter()
            .filter(|(signal, _)| {
                signal.is_actionable() && signal.confidence >= self.min_confidence
            })
            .collect();

        kept.sort_by(|a, b| compare(a, b));
        if let Some(limit) = self.limit {
            kept.truncate(limit);
        }

        tracing::debug!(
            candidates = total,
            ranked = kept.len(),
            min_confidence = self.min_confidence,
            "Ranked signals"
        );

        kept.into_iter()
            .enumerate()
            .map(|(i, (signal, consensus))| RankedOpportunity {
                rank: i + 1,
                signal,
                consensus,
            })
            .collect()
    }
}

fn compare(a: &(Signal, ConsensusTicker), b: &(Signal, ConsensusTicker)) -> Ordering {
    b.0.confidence
        .total_cmp(&a.0.confidence)
        .then_with(|| b.1.volume.total_cmp(&a.1.volume))
        .then_with(|| a.0.symbol.to_string().cmp(&b.0.symbol.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalDirection;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn make_candidate(
        base: &str,
        confidence: f64,
        volume: f64,
        direction: SignalDirection,
    ) -> (Signal, ConsensusTicker) {
        let symbol = Symbol::new(base, "USDT");
        let signal = Signal::new(symbol.clone(), "rsi", direction, confidence, BTreeMap::new());
        let consensus = ConsensusTicker {
            symbol,
            price: 100.0,
            bid: 99.9,
            ask: 100.1,
            volume,
            sources: vec!["binance".into()],
            excluded: vec![],
            max_divergence_pct: 0.0,
            low_confidence: false,
            timestamp: Utc::now(),
            ttl: Duration::from_secs(60),
        };
        (signal, consensus)
    }

    fn symbols(ranked: &[RankedOpportunity]) -> Vec<String> {
        ranked.iter().map(|r| r.symbol().to_string()).collect()
    }

    #[test]
    fn test_threshold_excludes_weak_signals() {
        let ranker = SymbolRanker::new(0.4);
        let ranked = ranker.rank(vec![
            make_candidate("BTC", 0.9, 10.0, SignalDirection::Buy),
            make_candidate("ETH", 0.5, 10.0, SignalDirection::Sell),
            make_candidate("SOL", 0.3, 10.0, SignalDirection::Buy),
            make_candidate("XRP", 0.1, 10.0, SignalDirection::Buy),
        ]);
        assert_eq!(symbols(&ranked), vec!["BTC/USDT", "ETH/USDT"]);
        assert!(ranked.iter().all(|r| r.confidence() >= 0.4));
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].rank, 2);
    }

    #[test]
    fn test_tie_breaks_volume_then_name() {
        let ranker = SymbolRanker::new(0.0);
        let ranked = ranker.rank(vec![
            make_candidate("DOT", 0.6, 5.0, SignalDirection::Buy),
            make_candidate("ADA", 0.6, 5.0, SignalDirection::Buy),
            make_candidate("LINK", 0.6, 50.0, SignalDirection::Sell),
            make_candidate("BNB", 0.7, 1.0, SignalDirection::Buy),
        ]);
        assert_eq!(
            symbols(&ranked),
            vec!["BNB/USDT", "LINK/USDT", "ADA/USDT", "DOT/USDT"]
        );
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let ranker = SymbolRanker::new(0.2);
        let input = vec![
            make_candidate("ETH", 0.5, 7.0, SignalDirection::Buy),
            make_candidate("BTC", 0.5, 7.0, SignalDirection::Buy),
            make_candidate("SOL", 0.8, 1.0, SignalDirection::Sell),
            make_candidate("XRP", 0.5, 9.0, SignalDirection::Buy),
        ];
        let mut reversed = input.clone();
        reversed.reverse();

        let first = symbols(&ranker.rank(input.clone()));
        let second = symbols(&ranker.rank(input));
        let third = symbols(&ranker.rank(reversed));
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(first, vec!["SOL/USDT", "XRP/USDT", "BTC/USDT", "ETH/USDT"]);
    }

    #[test]
    fn test_hold_signals_never_ranked() {
        let ranker = SymbolRanker::new(0.0);
        let (mut hold, consensus) = make_candidate("BTC", 0.0, 10.0, SignalDirection::Hold);
        hold.confidence = 0.9;
        assert!(ranker.rank(vec![(hold, consensus)]).is_empty());
    }

    #[test]
    fn test_limit_truncates_after_sort() {
        let ranker = SymbolRanker::new(0.0).with_limit(2);
        let ranked = ranker.rank(vec![
            make_candidate("A", 0.2, 1.0, SignalDirection::Buy),
            make_candidate("B", 0.9, 1.0, SignalDirection::Buy),
            make_candidate("C", 0.5, 1.0, SignalDirection::Buy),
        ]);
        assert_eq!(symbols(&ranked), vec!["B/USDT", "C/USDT"]);
    }
}
