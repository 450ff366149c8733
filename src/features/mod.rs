//! Technical indicators over candle closes
//!
//! - RSI (Wilder's smoothing, seeded with a simple average)
//! - SMA / EMA
//!
//! All functions return `None` when the window is too short or the result
//! would not be finite.

use crate::types::Candle;

/// Close prices, oldest first
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Relative Strength Index with Wilder's smoothing
///
/// The first `period` changes seed the averages with a simple mean; every
/// later change is folded in as `avg = (prev * (period - 1) + x) / period`.
/// A flat window is neutral (50).
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        tracing::debug!(
            candle_count = closes.len(),
            required = period + 1,
            "RSI: not enough candles"
        );
        return None;
    }
    if closes.iter().any(|c| !c.is_finite()) {
        return None;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let (seed, rest) = changes.split_at(period);

    let p = period as f64;
    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / p;
    let mut avg_loss = seed.iter().filter(|c| **c < 0.0).map(|c| c.abs()).sum::<f64>() / p;

    for change in rest {
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    if avg_loss < 1e-12 && avg_gain < 1e-12 {
        return Some(50.0);
    }
    if avg_loss < 1e-12 {
        return Some(100.0);
    }
    if avg_gain < 1e-12 {
        return Some(0.0);
    }
    let rs = avg_gain / avg_loss;
    let value = 100.0 - (100.0 / (1.0 + rs));
    value.is_finite().then_some(value)
}

/// Simple moving average of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}

/// Exponential moving average seeded with the first value
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[0];
    for v in values.iter().skip(1) {
        ema = (v - ema) * multiplier + ema;
    }
    ema.is_finite().then_some(ema)
}
