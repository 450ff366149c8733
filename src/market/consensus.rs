//! Consensus price from per-exchange snapshots
//!
//! Outliers are snapshots whose price deviates from the median by more than
//! the divergence threshold. Survivors are averaged by volume.

use chrono::Utc;
use std::cmp::Ordering;
use std::time::Duration;

use crate::error::MarketDataError;
use crate::types::{ConsensusTicker, Symbol, TickerSnapshot};

/// Median of a non-empty slice
fn median(prices: &[f64]) -> f64 {
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Spread between highest and lowest price, percent of the lowest
pub fn max_divergence_pct(prices: &[f64]) -> f64 {
    if prices.is_empty() {
        return 0.0;
    }
    let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if min <= 0.0 {
        return 0.0;
    }
    (max - min) / min * 100.0
}

/// Volume-weighted mean, or simple mean when no volume is reported
fn weighted_price(snapshots: &[&TickerSnapshot]) -> f64 {
    let total_volume: f64 = snapshots.iter().map(|s| s.volume.max(0.0)).sum();
    if total_volume > 0.0 {
        snapshots
            .iter()
            .map(|s| s.last * s.volume.max(0.0))
            .sum::<f64>()
            / total_volume
    } else {
        snapshots.iter().map(|s| s.last).sum::<f64>() / snapshots.len() as f64
    }
}

/// Highest volume wins; exchange name breaks ties
fn highest_volume<'a>(snapshots: &[&'a TickerSnapshot]) -> Option<&'a TickerSnapshot> {
    snapshots.iter().copied().max_by(|a, b| {
        a.volume
            .partial_cmp(&b.volume)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.exchange.cmp(&a.exchange))
    })
}

fn usable(s: &TickerSnapshot) -> bool {
    s.last.is_finite() && s.last > 0.0 && s.bid.is_finite() && s.ask.is_finite()
}

/// Build the consensus ticker for `symbol`
///
/// Zero usable snapshots is `StaleData`. Two snapshots that disagree beyond
/// the threshold, or a set where every snapshot is an outlier, fall back to
/// the highest-volume snapshot and are flagged low-confidence. Survivors
/// that are not a strict majority of the respondents are also flagged.
/// `sources` lists survivors by descending volume.
pub fn build_consensus(
    symbol: &Symbol,
    snapshots: &[TickerSnapshot],
    divergence_threshold_pct: f64,
    ttl: Duration,
) -> Result<ConsensusTicker, MarketDataError> {
    let valid: Vec<&TickerSnapshot> = snapshots.iter().filter(|s| usable(s)).collect();
    if valid.is_empty() {
        return Err(MarketDataError::StaleData {
            symbol: symbol.clone(),
        });
    }

    let prices: Vec<f64> = valid.iter().map(|s| s.last).collect();
    let divergence = max_divergence_pct(&prices);
    let center = median(&prices);

    let (mut survivors, low_confidence): (Vec<&TickerSnapshot>, bool) =
        if valid.len() == 2 && divergence > divergence_threshold_pct {
            // No majority possible
            (highest_volume(&valid).into_iter().collect(), true)
        } else {
            let kept: Vec<&TickerSnapshot> = valid
                .iter()
                .copied()
                .filter(|s| (s.last - center).abs() / center * 100.0 <= divergence_threshold_pct)
                .collect();
            if kept.is_empty() {
                (highest_volume(&valid).into_iter().collect(), true)
            } else {
                // Survivors must be a strict majority of respondents
                let majority = kept.len() * 2 > valid.len();
                (kept, !majority)
            }
        };

    let excluded: Vec<String> = valid
        .iter()
        .filter(|s| !survivors.iter().any(|k| std::ptr::eq(*k, **s)))
        .map(|s| s.exchange.clone())
        .collect();

    // Deepest market first; it is the preferred venue for orders
    survivors.sort_by(|a, b| b.volume.partial_cmp(&a.volume).unwrap_or(Ordering::Equal));

    let bid = survivors
        .iter()
        .map(|s| s.bid)
        .fold(f64::NEG_INFINITY, f64::max);
    let ask = survivors.iter().map(|s| s.ask).fold(f64::INFINITY, f64::min);

    Ok(ConsensusTicker {
        symbol: symbol.clone(),
        price: weighted_price(&survivors),
        bid,
        ask,
        volume: survivors.iter().map(|s| s.volume.max(0.0)).sum(),
        sources: survivors.iter().map(|s| s.exchange.clone()).collect(),
        excluded,
        max_divergence_pct: divergence,
        low_confidence,
        timestamp: Utc::now(),
        ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_snapshot(exchange: &str, last: f64, volume: f64) -> TickerSnapshot {
        TickerSnapshot {
            symbol: Symbol::new("BTC", "USDT"),
            last,
            bid: last - 1.0,
            ask: last + 1.0,
            volume,
            exchange: exchange.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_outlier_is_excluded() {
        let snaps = vec![
            make_snapshot("binance", 50000.0, 10.0),
            make_snapshot("coinbase", 50050.0, 10.0),
            make_snapshot("kraken", 80000.0, 10.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert!((c.price - 50025.0).abs() < 1e-6);
        assert!(!c.low_confidence);
        assert_eq!(c.sources, vec!["binance", "coinbase"]);
        assert_eq!(c.excluded, vec!["kraken"]);
        assert!(c.max_divergence_pct > 59.0);
        assert_eq!(c.bid, 50049.0);
        assert_eq!(c.ask, 50001.0);
    }

    #[test]
    fn test_volume_weighting() {
        let snaps = vec![
            make_snapshot("binance", 100.0, 3.0),
            make_snapshot("coinbase", 101.0, 1.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert!((c.price - 100.25).abs() < 1e-9);
        assert_eq!(c.volume, 4.0);
    }

    #[test]
    fn test_sources_ordered_by_volume() {
        let snaps = vec![
            make_snapshot("binance", 100.0, 3.0),
            make_snapshot("coinbase", 101.0, 9.0),
            make_snapshot("kraken", 100.5, 3.0),
            make_snapshot("gemini", 160.0, 50.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert_eq!(c.sources, vec!["coinbase", "binance", "kraken"]);
        assert_eq!(c.excluded, vec!["gemini"]);
    }

    #[test]
    fn test_zero_volume_uses_simple_mean() {
        let snaps = vec![
            make_snapshot("binance", 100.0, 0.0),
            make_snapshot("coinbase", 102.0, 0.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert!((c.price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_way_disagreement_prefers_volume() {
        let snaps = vec![
            make_snapshot("binance", 50000.0, 5.0),
            make_snapshot("kraken", 60000.0, 50.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert_eq!(c.price, 60000.0);
        assert!(c.low_confidence);
        assert_eq!(c.sources, vec!["kraken"]);
        assert_eq!(c.excluded, vec!["binance"]);
    }

    #[test]
    fn test_even_split_falls_back_to_volume() {
        let snaps = vec![
            make_snapshot("a", 100.0, 1.0),
            make_snapshot("b", 100.0, 1.0),
            make_snapshot("c", 200.0, 9.0),
            make_snapshot("d", 200.0, 1.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert!(c.low_confidence);
        assert_eq!(c.sources, vec!["c"]);
    }

    #[test]
    fn test_no_majority_is_low_confidence() {
        let snaps = vec![
            make_snapshot("a", 100.0, 1.0),
            make_snapshot("b", 150.0, 1.0),
            make_snapshot("c", 225.0, 1.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert_eq!(c.price, 150.0);
        assert_eq!(c.sources, vec!["b"]);
        assert_eq!(c.excluded, vec!["a", "c"]);
        assert!(c.low_confidence);
    }

    #[test]
    fn test_half_agreement_is_low_confidence() {
        let snaps = vec![
            make_snapshot("a", 100.0, 1.0),
            make_snapshot("b", 101.0, 1.0),
            make_snapshot("c", 90.0, 1.0),
            make_snapshot("d", 200.0, 1.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert_eq!(c.sources, vec!["a", "b"]);
        assert!(c.low_confidence);
    }

    #[test]
    fn test_single_snapshot() {
        let snaps = vec![make_snapshot("binance", 42.0, 1.0)];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert_eq!(c.price, 42.0);
        assert_eq!(c.exchange_count(), 1);
        assert!(!c.low_confidence);
    }

    #[test]
    fn test_no_snapshots_is_stale() {
        assert_eq!(
            build_consensus(&btc(), &[], 5.0, TTL).unwrap_err(),
            MarketDataError::StaleData { symbol: btc() }
        );
        let junk = vec![make_snapshot("binance", f64::NAN, 1.0)];
        assert!(build_consensus(&btc(), &junk, 5.0, TTL).is_err());
    }

    #[test]
    fn test_price_within_contributor_range() {
        let snaps = vec![
            make_snapshot("a", 100.0, 7.0),
            make_snapshot("b", 101.5, 2.0),
            make_snapshot("c", 99.2, 0.5),
            make_snapshot("d", 100.7, 3.0),
        ];
        let c = build_consensus(&btc(), &snaps, 5.0, TTL).unwrap();
        assert!(c.price >= 99.2 && c.price <= 101.5);
    }
}
