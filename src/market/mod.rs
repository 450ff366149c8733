//! Market data - multi-exchange consensus prices and merged history
//!
//! Queries every available exchange concurrently, discards outliers and
//! produces one consensus view per symbol, cached for a short TTL.

mod aggregator;
mod cache;
mod consensus;
mod history;

pub use aggregator::MarketDataAggregator;
pub use cache::ConsensusCache;
pub use consensus::{build_consensus, max_divergence_pct};
pub use history::{merge_candles, rank_universe};
