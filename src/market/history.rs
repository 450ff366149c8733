//! Candle merging and symbol-universe selection

use std::collections::{BTreeMap, HashMap};

use crate::types::{Candle, Symbol};

/// Merge per-exchange candle series by open time
///
/// Open and close are averaged, high is the max, low the min, volume summed.
/// Output is oldest first.
pub fn merge_candles(series: &[Vec<Candle>]) -> Vec<Candle> {
    let mut buckets: BTreeMap<i64, Vec<&Candle>> = BTreeMap::new();
    for candles in series {
        for candle in candles {
            buckets.entry(candle.open_time).or_default().push(candle);
        }
    }

    buckets
        .into_iter()
        .map(|(open_time, group)| {
            let n = group.len() as f64;
            Candle {
                open_time,
                open: group.iter().map(|c| c.open).sum::<f64>() / n,
                high: group.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max),
                low: group.iter().map(|c| c.low).fold(f64::INFINITY, f64::min),
                close: group.iter().map(|c| c.close).sum::<f64>() / n,
                volume: group.iter().map(|c| c.volume).sum(),
            }
        })
        .collect()
}

/// Combine per-exchange top lists into one universe
///
/// A symbol at position `i` of a list of length `n` scores `n - i`; scores
/// are summed across exchanges. Ties break on symbol name. The result is
/// padded with `defaults` up to `limit`.
pub fn rank_universe(lists: &[Vec<Symbol>], defaults: &[Symbol], limit: usize) -> Vec<Symbol> {
    let mut scores: HashMap<&Symbol, usize> = HashMap::new();
    for list in lists {
        let n = list.len();
        for (i, symbol) in list.iter().enumerate() {
            *scores.entry(symbol).or_insert(0) += n - i;
        }
    }

    let mut ranked: Vec<(&Symbol, usize)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut universe: Vec<Symbol> = ranked
        .into_iter()
        .take(limit)
        .map(|(s, _)| s.clone())
        .collect();

    for symbol in defaults {
        if universe.len() >= limit {
            break;
        }
        if !universe.contains(symbol) {
            universe.push(symbol.clone());
        }
    }
    universe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candle(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn sym(base: &str) -> Symbol {
        Symbol::new(base, "USDT")
    }

    #[test]
    fn test_merge_aligns_by_open_time() {
        let a = vec![
            make_candle(1000, 10.0, 12.0, 9.0, 11.0),
            make_candle(2000, 11.0, 13.0, 10.0, 12.0),
        ];
        let b = vec![
            make_candle(2000, 13.0, 14.0, 9.5, 14.0),
            make_candle(3000, 14.0, 15.0, 13.0, 15.0),
        ];
        let merged = merge_candles(&[a, b]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].open_time, 2000);
        assert_eq!(merged[1].open, 12.0);
        assert_eq!(merged[1].high, 14.0);
        assert_eq!(merged[1].low, 9.5);
        assert_eq!(merged[1].close, 13.0);
        assert_eq!(merged[1].volume, 2.0);
    }

    #[test]
    fn test_universe_scores_across_exchanges() {
        let lists = vec![
            vec![sym("BTC"), sym("ETH"), sym("SOL")],
            vec![sym("ETH"), sym("BTC"), sym("XRP")],
        ];
        let universe = rank_universe(&lists, &[], 3);
        // BTC and ETH tie on score 5; name breaks the tie
        assert_eq!(universe, vec![sym("BTC"), sym("ETH"), sym("SOL")]);
    }

    #[test]
    fn test_universe_padded_with_defaults() {
        let lists = vec![vec![sym("BTC")]];
        let defaults = vec![sym("BTC"), sym("ETH"), sym("SOL")];
        let universe = rank_universe(&lists, &defaults, 3);
        assert_eq!(universe, vec![sym("BTC"), sym("ETH"), sym("SOL")]);

        let universe = rank_universe(&[], &defaults, 2);
        assert_eq!(universe, vec![sym("BTC"), sym("ETH")]);
    }
}
