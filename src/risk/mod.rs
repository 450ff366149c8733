//! Risk controls - exit levels and position sizing
//!
//! Implements:
//! - Stop-loss / take-profit distances per risk level
//! - Exit evaluation against the latest consensus price
//! - Fixed-fraction position sizing with a minimum order value

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;

use crate::config::RiskSettings;
use crate::types::OrderSide;

/// Stop-loss / take-profit profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }

    /// Adverse move that triggers a stop, as a fraction of entry
    pub fn stop_loss_pct(&self) -> f64 {
        match self {
            RiskLevel::Low => 0.02,
            RiskLevel::Medium => 0.03,
            RiskLevel::High => 0.05,
        }
    }

    /// Favourable move that locks in profit, as a fraction of entry
    pub fn take_profit_pct(&self) -> f64 {
        match self {
            RiskLevel::Low => 0.04,
            RiskLevel::Medium => 0.06,
            RiskLevel::High => 0.10,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Absolute exit prices for one position
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExitLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl ExitLevels {
    /// Levels for a position entered with `side` at `entry`.
    /// A SELL entry is a short, so its stop sits above the entry.
    pub fn for_entry(side: OrderSide, entry: f64, level: RiskLevel) -> Self {
        let sl = level.stop_loss_pct();
        let tp = level.take_profit_pct();
        match side {
            OrderSide::Buy => Self {
                stop_loss: entry * (1.0 - sl),
                take_profit: entry * (1.0 + tp),
            },
            OrderSide::Sell => Self {
                stop_loss: entry * (1.0 + sl),
                take_profit: entry * (1.0 - tp),
            },
        }
    }

    /// Stop-loss is checked first so a gap through both levels counts as a loss
    pub fn evaluate(&self, side: OrderSide, price: f64) -> Option<ExitReason> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        match side {
            OrderSide::Buy if price <= self.stop_loss => Some(ExitReason::StopLoss),
            OrderSide::Buy if price >= self.take_profit => Some(ExitReason::TakeProfit),
            OrderSide::Sell if price >= self.stop_loss => Some(ExitReason::StopLoss),
            OrderSide::Sell if price <= self.take_profit => Some(ExitReason::TakeProfit),
            _ => None,
        }
    }
}

/// Exit check for a tracked position
pub fn evaluate_exit(position: &crate::coordinator::Position, price: f64) -> Option<ExitReason> {
    position.levels.evaluate(position.side, price)
}

/// Sizing and exit parameters resolved from `[risk]`
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub level: RiskLevel,
    /// Fraction of available capital per position
    pub capital_fraction: f64,
    /// Smallest allocation worth placing
    pub min_order_value: f64,
    pub taker_fee: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            level: RiskLevel::Medium,
            capital_fraction: 0.2,
            min_order_value: 10.0,
            taker_fee: 0.001,
        }
    }
}

impl RiskConfig {
    pub fn from_settings(settings: &RiskSettings) -> Result<Self> {
        let level = match RiskLevel::from_name(&settings.risk_level) {
            Some(level) => level,
            None => bail!("unknown risk level '{}'", settings.risk_level),
        };
        if !(settings.capital_fraction > 0.0 && settings.capital_fraction <= 1.0) {
            bail!(
                "capital_fraction must be in (0, 1], got {}",
                settings.capital_fraction
            );
        }
        Ok(Self {
            level,
            capital_fraction: settings.capital_fraction,
            min_order_value: settings.min_order_value.max(0.0),
            taker_fee: settings.taker_fee.max(0.0),
        })
    }

    /// Quote amount to commit from `available`, or `None` if it would be
    /// below the minimum order value
    pub fn allocation(&self, available: f64) -> Option<f64> {
        if !available.is_finite() || available <= 0.0 {
            return None;
        }
        let allocation = available * self.capital_fraction;
        if allocation < self.min_order_value || allocation <= 0.0 {
            tracing::debug!(
                available = available,
                allocation = allocation,
                min_order_value = self.min_order_value,
                "Allocation below minimum order value"
            );
            return None;
        }
        Some(allocation)
    }

    pub fn exit_levels(&self, side: OrderSide, entry: f64) -> ExitLevels {
        ExitLevels::for_entry(side, entry, self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_percentages() {
        assert_eq!(RiskLevel::Low.stop_loss_pct(), 0.02);
        assert_eq!(RiskLevel::Medium.take_profit_pct(), 0.06);
        assert_eq!(RiskLevel::High.stop_loss_pct(), 0.05);
        assert_eq!(RiskLevel::from_name("HIGH"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::from_name("yolo"), None);
    }

    #[test]
    fn test_long_exit_levels() {
        let levels = ExitLevels::for_entry(OrderSide::Buy, 100.0, RiskLevel::Medium);
        assert!((levels.stop_loss - 97.0).abs() < 1e-9);
        assert!((levels.take_profit - 106.0).abs() < 1e-9);

        assert_eq!(levels.evaluate(OrderSide::Buy, 100.0), None);
        assert_eq!(levels.evaluate(OrderSide::Buy, 96.5), Some(ExitReason::StopLoss));
        assert_eq!(levels.evaluate(OrderSide::Buy, 107.0), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_short_exit_levels() {
        let levels = ExitLevels::for_entry(OrderSide::Sell, 100.0, RiskLevel::Low);
        assert!((levels.stop_loss - 102.0).abs() < 1e-9);
        assert!((levels.take_profit - 96.0).abs() < 1e-9);

        assert_eq!(levels.evaluate(OrderSide::Sell, 103.0), Some(ExitReason::StopLoss));
        assert_eq!(levels.evaluate(OrderSide::Sell, 95.0), Some(ExitReason::TakeProfit));
        assert_eq!(levels.evaluate(OrderSide::Sell, f64::NAN), None);
    }

    #[test]
    fn test_allocation_fraction_and_minimum() {
        let risk = RiskConfig::default();
        assert_eq!(risk.allocation(10_000.0), Some(2_000.0));
        assert_eq!(risk.allocation(40.0), None);
        assert_eq!(risk.allocation(0.0), None);
    }

    #[test]
    fn test_from_settings_validates() {
        let settings = RiskSettings {
            risk_level: "extreme".into(),
            ..Default::default()
        };
        assert!(RiskConfig::from_settings(&settings).is_err());

        let settings = RiskSettings {
            capital_fraction: 1.5,
            ..Default::default()
        };
        assert!(RiskConfig::from_settings(&settings).is_err());

        let risk = RiskConfig::from_settings(&RiskSettings::default()).unwrap();
        assert_eq!(risk.level, RiskLevel::Medium);
    }
}
