//! Per-symbol consensus cache with TTL

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{ConsensusTicker, Symbol};

/// Last writer wins; entries expire by their own TTL
#[derive(Default)]
pub struct ConsensusCache {
    entries: RwLock<HashMap<Symbol, ConsensusTicker>>,
}

impl ConsensusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached consensus if still fresh at `now`
    pub fn get_fresh(&self, symbol: &Symbol, now: DateTime<Utc>) -> Option<ConsensusTicker> {
        self.entries
            .read()
            .ok()?
            .get(symbol)
            .filter(|c| c.is_fresh(now))
            .cloned()
    }

    pub fn put(&self, ticker: ConsensusTicker) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(ticker.symbol.clone(), ticker);
        }
    }

    pub fn invalidate(&self, symbol: &Symbol) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(symbol);
        }
    }

    /// Drop expired entries
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, c| c.is_fresh(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_consensus(symbol: Symbol, ttl_secs: u64) -> ConsensusTicker {
        ConsensusTicker {
            symbol,
            price: 100.0,
            bid: 99.0,
            ask: 101.0,
            volume: 1.0,
            sources: vec!["binance".into()],
            excluded: vec![],
            max_divergence_pct: 0.0,
            low_confidence: false,
            timestamp: Utc::now(),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    #[test]
    fn test_fresh_entry_is_served() {
        let cache = ConsensusCache::new();
        let sym = Symbol::new("ETH", "USDT");
        cache.put(make_consensus(sym.clone(), 60));
        assert!(cache.get_fresh(&sym, Utc::now()).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_ignored_and_purged() {
        let cache = ConsensusCache::new();
        let sym = Symbol::new("ETH", "USDT");
        cache.put(make_consensus(sym.clone(), 60));
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert!(cache.get_fresh(&sym, later).is_none());
        assert_eq!(cache.purge(later), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = ConsensusCache::new();
        let sym = Symbol::new("SOL", "USDT");
        cache.put(make_consensus(sym.clone(), 60));
        cache.invalidate(&sym);
        assert!(cache.get_fresh(&sym, Utc::now()).is_none());
    }
}
