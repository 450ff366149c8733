//! RankBot Library
//!
//! Consensus market data across spot exchanges, per-symbol signals,
//! confidence ranking and capped position management.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod features;
pub mod logging;
pub mod market;
pub mod persistence;
pub mod ranking;
pub mod risk;
pub mod strategy;
pub mod types;
