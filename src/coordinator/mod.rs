//! Position/portfolio coordinator
//!
//! Owns the position book and the capital ledger. Positions move through
//! `Opening -> Open -> Closing -> Closed`; a symbol with no entry in the book
//! is in the implicit `None` state. Locks are never held across an order
//! placement: a position is reserved as `Opening` (or `Closing`) first, the
//! order is sent, then the outcome is written back.
//!
//! An allocation never exceeds the venue's free quote balance. A fill that
//! costs more than its allocation takes the difference from available
//! capital, or is sold back when the ledger cannot cover it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{CoordinatorError, ExchangeError};
use crate::exchange::ExchangeAdapter;
use crate::ranking::RankedOpportunity;
use crate::risk::{evaluate_exit, ExitLevels, ExitReason, RiskConfig};
use crate::types::{OrderAck, OrderRequest, OrderSide, OrderStatus, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Opening => write!(f, "OPENING"),
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closing => write!(f, "CLOSING"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// One tracked position
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: String,
    pub symbol: Symbol,
    pub exchange: String,
    /// Entry side; SELL is a short
    pub side: OrderSide,
    pub quantity: f64,
    pub entry_price: f64,
    /// Quote capital reserved for this position
    pub allocation: f64,
    pub entry_fee: f64,
    pub levels: ExitLevels,
    pub status: PositionStatus,
    /// Signal confidence at entry
    pub confidence: f64,
    pub opened_at: DateTime<Utc>,
    /// Latest consensus price seen for the symbol
    pub last_price: f64,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.side == OrderSide::Buy
    }

    /// Price move times quantity, sign-flipped for shorts
    pub fn gross_pnl(&self, price: f64) -> f64 {
        match self.side {
            OrderSide::Buy => (price - self.entry_price) * self.quantity,
            OrderSide::Sell => (self.entry_price - price) * self.quantity,
        }
    }

    pub fn unrealised_pnl(&self) -> f64 {
        self.gross_pnl(self.last_price) - self.entry_fee
    }
}

/// A position after its exit order filled
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub exit_price: f64,
    pub exit_fee: f64,
    /// Net of entry and exit fees
    pub realised_pnl: f64,
    pub reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

/// Point-in-time view of capital and exposure
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioState {
    pub timestamp: DateTime<Utc>,
    pub available_capital: f64,
    /// Allocations of every position not yet closed
    pub capital_at_risk: f64,
    pub realised_pnl: f64,
    pub unrealised_pnl: f64,
    pub open_positions: usize,
    pub max_positions: usize,
    /// available + at risk + unrealised
    pub total_value: f64,
    /// Fraction below the highest total value seen
    pub drawdown: f64,
}

/// Outcome of walking a ranked list
#[derive(Debug, Default)]
pub struct OpenReport {
    pub opened: Vec<Position>,
    pub failed: Vec<(Symbol, CoordinatorError)>,
    /// The cap was hit before the list was exhausted
    pub cap_reached: bool,
}

/// Exit triggered by the latest prices
#[derive(Debug, Clone, PartialEq)]
pub struct PendingExit {
    pub symbol: Symbol,
    pub exchange: String,
    pub reason: ExitReason,
    pub price: f64,
}

#[derive(Debug)]
struct CapitalLedger {
    available: f64,
    realised_pnl: f64,
    peak_value: f64,
}

pub struct Coordinator {
    risk: RiskConfig,
    max_positions: usize,
    initial_capital: f64,
    positions: RwLock<BTreeMap<Symbol, Position>>,
    capital: RwLock<CapitalLedger>,
    closed: RwLock<Vec<ClosedTrade>>,
    next_id: AtomicU64,
}

impl Coordinator {
    pub fn new(risk: RiskConfig, max_positions: usize, initial_capital: f64) -> Self {
        Self {
            risk,
            max_positions,
            initial_capital,
            positions: RwLock::new(BTreeMap::new()),
            capital: RwLock::new(CapitalLedger {
                available: initial_capital,
                realised_pnl: 0.0,
                peak_value: initial_capital,
            }),
            closed: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    /// Positions not yet closed (Opening, Open or Closing)
    pub fn active_count(&self) -> usize {
        self.positions.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn available_capital(&self) -> f64 {
        self.capital.read().map(|c| c.available).unwrap_or(0.0)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn position(&self, symbol: &Symbol) -> Option<Position> {
        self.positions.read().ok()?.get(symbol).cloned()
    }

    pub fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.closed.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Walk `ranked` in order, opening positions on `venue` until the cap
    /// is reached. A failed attempt is reported and the walk continues with
    /// the next opportunity; nothing is retried.
    pub async fn open_from_ranked<'v>(
        &self,
        ranked: &[RankedOpportunity],
        venue: &'v dyn ExchangeAdapter,
    ) -> OpenReport {
        self.open_from_ranked_with(ranked, |_| Some(venue)).await
    }

    /// Same walk, with the venue chosen per opportunity. An opportunity
    /// without a venue fails with [`CoordinatorError::NoVenue`].
    pub async fn open_from_ranked_with<'v, F>(
        &self,
        ranked: &[RankedOpportunity],
        venue_for: F,
    ) -> OpenReport
    where
        F: Fn(&RankedOpportunity) -> Option<&'v dyn ExchangeAdapter>,
    {
        let mut report = OpenReport::default();

        for (index, opportunity) in ranked.iter().enumerate() {
            if self.active_count() >= self.max_positions {
                report.cap_reached = true;
                info!(
                    max_positions = self.max_positions,
                    remaining = ranked.len() - index,
                    "Position cap reached, not opening lower-ranked symbols"
                );
                break;
            }

            let outcome = match venue_for(opportunity) {
                Some(venue) => self.open_position(opportunity, venue).await,
                None => Err(CoordinatorError::NoVenue(opportunity.symbol().clone())),
            };
            match outcome {
                Ok(position) => report.opened.push(position),
                Err(CoordinatorError::MaxPositionsReached(_)) => {
                    report.cap_reached = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        symbol = %opportunity.symbol(),
                        rank = opportunity.rank,
                        error = %e,
                        "Position attempt failed, moving to next opportunity"
                    );
                    report.failed.push((opportunity.symbol().clone(), e));
                }
            }
        }

        report
    }

    /// `None -> Opening -> Open`, or back to `None` on failure
    pub async fn open_position(
        &self,
        opportunity: &RankedOpportunity,
        venue: &dyn ExchangeAdapter,
    ) -> Result<Position, CoordinatorError> {
        let signal = &opportunity.signal;
        let symbol = signal.symbol.clone();
        let price = opportunity.consensus.price;

        let side = match signal.direction.entry_side() {
            Some(side) if signal.is_actionable() => side,
            _ => return Err(CoordinatorError::NotActionable(symbol)),
        };
        if !price.is_finite() || price <= 0.0 {
            return Err(CoordinatorError::NotActionable(symbol));
        }

        let balance = venue.get_balance(symbol.quote()).await?;
        let reserved =
            self.reserve(&symbol, side, price, signal.confidence, venue.name(), balance)?;
        let order = OrderRequest::market(symbol.clone(), side, reserved.quantity);

        let outcome = venue.place_order(&order).await.and_then(ensure_filled);
        match outcome {
            Ok(ack) => {
                let position = match self.confirm_open(&symbol, &ack, price) {
                    Ok(position) => position,
                    Err(CoordinatorError::FillExceedsAllocation { cost, .. }) => {
                        self.unwind_overfill(&symbol, &ack, price, cost, venue).await?
                    }
                    Err(e) => return Err(e),
                };
                info!(
                    id = %position.id,
                    symbol = %symbol,
                    exchange = %position.exchange,
                    side = %side,
                    quantity = position.quantity,
                    entry_price = position.entry_price,
                    allocation = position.allocation,
                    confidence = position.confidence,
                    "Position opened"
                );
                Ok(position)
            }
            Err(e) => {
                self.release(&symbol);
                Err(CoordinatorError::Order(e))
            }
        }
    }

    /// Record the latest prices on open positions and list those whose
    /// stop-loss or take-profit has been crossed
    pub fn check_exits(&self, prices: &HashMap<Symbol, f64>) -> Vec<PendingExit> {
        let mut due = Vec::new();
        let Ok(mut positions) = self.positions.write() else {
            return due;
        };

        for position in positions.values_mut() {
            if position.status != PositionStatus::Open {
                continue;
            }
            let Some(price) = prices.get(&position.symbol).copied() else {
                continue;
            };
            if !price.is_finite() || price <= 0.0 {
                continue;
            }
            position.last_price = price;
            if let Some(reason) = evaluate_exit(position, price) {
                due.push(PendingExit {
                    symbol: position.symbol.clone(),
                    exchange: position.exchange.clone(),
                    reason,
                    price,
                });
            }
        }
        due
    }

    /// `Open -> Closing -> Closed`. If the exit order fails the position
    /// goes back to `Open` and the error is returned.
    pub async fn close_position(
        &self,
        symbol: &Symbol,
        reason: ExitReason,
        venue: &dyn ExchangeAdapter,
    ) -> Result<ClosedTrade, CoordinatorError> {
        let position = {
            let mut positions = self
                .positions
                .write()
                .map_err(|_| CoordinatorError::StateUnavailable)?;
            match positions.get_mut(symbol) {
                Some(p) if p.status == PositionStatus::Open => {
                    p.status = PositionStatus::Closing;
                    p.clone()
                }
                _ => return Err(CoordinatorError::UnknownPosition(symbol.clone())),
            }
        };

        let order =
            OrderRequest::market(symbol.clone(), position.side.opposite(), position.quantity);
        let ack = match venue.place_order(&order).await.and_then(ensure_filled) {
            Ok(ack) => ack,
            Err(e) => {
                if let Ok(mut positions) = self.positions.write() {
                    if let Some(p) = positions.get_mut(symbol) {
                        p.status = PositionStatus::Open;
                    }
                }
                warn!(
                    symbol = %symbol,
                    reason = %reason,
                    error = %e,
                    "Exit order failed, position stays open"
                );
                return Err(CoordinatorError::Order(e));
            }
        };

        let exit_price = fill_price(&ack, position.last_price);
        let realised_pnl = position.gross_pnl(exit_price) - position.entry_fee - ack.fee;

        let mut closed_position = {
            let mut positions = self
                .positions
                .write()
                .map_err(|_| CoordinatorError::StateUnavailable)?;
            positions.remove(symbol).unwrap_or(position)
        };
        closed_position.status = PositionStatus::Closed;
        closed_position.last_price = exit_price;

        if let Ok(mut capital) = self.capital.write() {
            capital.available += closed_position.allocation + realised_pnl;
            capital.realised_pnl += realised_pnl;
        }

        let trade = ClosedTrade {
            position: closed_position,
            exit_price,
            exit_fee: ack.fee,
            realised_pnl,
            reason,
            closed_at: Utc::now(),
        };
        if let Ok(mut closed) = self.closed.write() {
            closed.push(trade.clone());
        }

        info!(
            id = %trade.position.id,
            symbol = %symbol,
            reason = %reason,
            entry_price = trade.position.entry_price,
            exit_price = exit_price,
            pnl = %format!("{:+.2}", realised_pnl),
            available = self.available_capital(),
            "Position closed"
        );
        Ok(trade)
    }

    /// Explicit close requested from the command surface
    pub async fn force_close(
        &self,
        symbol: &Symbol,
        venue: &dyn ExchangeAdapter,
    ) -> Result<ClosedTrade, CoordinatorError> {
        self.close_position(symbol, ExitReason::Manual, venue).await
    }

    pub fn portfolio(&self) -> PortfolioState {
        let positions = self.positions();
        let capital_at_risk: f64 = positions.iter().map(|p| p.allocation).sum();
        let unrealised_pnl: f64 = positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.unrealised_pnl())
            .sum();

        let (available, realised, peak) = match self.capital.write() {
            Ok(mut capital) => {
                let total = capital.available + capital_at_risk + unrealised_pnl;
                if total > capital.peak_value {
                    capital.peak_value = total;
                }
                (capital.available, capital.realised_pnl, capital.peak_value)
            }
            Err(_) => (0.0, 0.0, self.initial_capital),
        };

        let total_value = available + capital_at_risk + unrealised_pnl;
        let drawdown = if peak > 0.0 {
            ((peak - total_value) / peak).max(0.0)
        } else {
            0.0
        };

        PortfolioState {
            timestamp: Utc::now(),
            available_capital: available,
            capital_at_risk,
            realised_pnl: realised,
            unrealised_pnl,
            open_positions: positions.len(),
            max_positions: self.max_positions,
            total_value,
            drawdown,
        }
    }

    /// Insert an `Opening` position and take its allocation from the ledger
    fn reserve(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        price: f64,
        confidence: f64,
        exchange: &str,
        venue_balance: f64,
    ) -> Result<Position, CoordinatorError> {
        let mut positions = self
            .positions
            .write()
            .map_err(|_| CoordinatorError::StateUnavailable)?;
        if positions.contains_key(symbol) {
            return Err(CoordinatorError::DuplicatePosition(symbol.clone()));
        }
        if positions.len() >= self.max_positions {
            return Err(CoordinatorError::MaxPositionsReached(self.max_positions));
        }

        let mut capital = self
            .capital
            .write()
            .map_err(|_| CoordinatorError::StateUnavailable)?;
        let allocation = self
            .risk
            .allocation(capital.available)
            .map(|a| a.min(venue_balance))
            .filter(|a| *a >= self.risk.min_order_value)
            .ok_or(CoordinatorError::InsufficientCapital {
                needed: self.risk.min_order_value,
                available: capital.available.min(venue_balance),
            })?;
        if allocation < capital.available * self.risk.capital_fraction {
            debug!(
                symbol = %symbol,
                exchange = %exchange,
                venue_balance = venue_balance,
                allocation = allocation,
                "Allocation capped by venue balance"
            );
        }
        // Leave room for the taker fee inside the allocation
        let quantity = allocation / (price * (1.0 + self.risk.taker_fee));
        capital.available -= allocation;

        let position = Position {
            id: format!("pos-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            symbol: symbol.clone(),
            exchange: exchange.to_string(),
            side,
            quantity,
            entry_price: price,
            allocation,
            entry_fee: 0.0,
            levels: self.risk.exit_levels(side, price),
            status: PositionStatus::Opening,
            confidence,
            opened_at: Utc::now(),
            last_price: price,
        };
        positions.insert(symbol.clone(), position.clone());
        Ok(position)
    }

    fn confirm_open(
        &self,
        symbol: &Symbol,
        ack: &OrderAck,
        quoted_price: f64,
    ) -> Result<Position, CoordinatorError> {
        let mut positions = self
            .positions
            .write()
            .map_err(|_| CoordinatorError::StateUnavailable)?;
        let position = positions
            .get_mut(symbol)
            .ok_or_else(|| CoordinatorError::UnknownPosition(symbol.clone()))?;

        let cost = fill_cost(position, ack, quoted_price);
        if cost > position.allocation * (1.0 + FILL_TOLERANCE) {
            let extra = cost - position.allocation;
            let mut capital = self
                .capital
                .write()
                .map_err(|_| CoordinatorError::StateUnavailable)?;
            if capital.available < extra {
                return Err(CoordinatorError::FillExceedsAllocation {
                    symbol: symbol.clone(),
                    cost,
                    allocation: position.allocation,
                });
            }
            capital.available -= extra;
            warn!(
                symbol = %symbol,
                cost = cost,
                allocation = position.allocation,
                "Fill above allocation, difference taken from available capital"
            );
            position.allocation = cost;
        }

        self.apply_fill(position, ack, quoted_price);
        Ok(position.clone())
    }

    fn apply_fill(&self, position: &mut Position, ack: &OrderAck, quoted_price: f64) {
        let entry = fill_price(ack, quoted_price);
        if ack.filled_qty > 0.0 {
            position.quantity = ack.filled_qty;
        }
        position.entry_price = entry;
        position.last_price = entry;
        position.entry_fee = ack.fee;
        position.levels = self.risk.exit_levels(position.side, entry);
        position.status = PositionStatus::Open;
    }

    /// Trade a fill the ledger cannot cover back out and settle the round
    /// trip. If the reversing order fails the fill is kept as an open
    /// position funded by whatever capital remains.
    async fn unwind_overfill(
        &self,
        symbol: &Symbol,
        ack: &OrderAck,
        quoted_price: f64,
        cost: f64,
        venue: &dyn ExchangeAdapter,
    ) -> Result<Position, CoordinatorError> {
        let Some(reserved) = self.position(symbol) else {
            return Err(CoordinatorError::UnknownPosition(symbol.clone()));
        };
        let quantity = if ack.filled_qty > 0.0 {
            ack.filled_qty
        } else {
            reserved.quantity
        };
        let order = OrderRequest::market(symbol.clone(), ack.side.opposite(), quantity);

        match venue.place_order(&order).await.and_then(ensure_filled) {
            Ok(exit) => {
                let mut filled = reserved.clone();
                self.apply_fill(&mut filled, ack, quoted_price);
                let exit_price = fill_price(&exit, filled.entry_price);
                let pnl = filled.gross_pnl(exit_price) - filled.entry_fee - exit.fee;

                let removed = self
                    .positions
                    .write()
                    .ok()
                    .and_then(|mut positions| positions.remove(symbol));
                if let (Some(position), Ok(mut capital)) = (removed, self.capital.write()) {
                    capital.available += position.allocation + pnl;
                    capital.realised_pnl += pnl;
                }
                warn!(
                    symbol = %symbol,
                    cost = cost,
                    allocation = reserved.allocation,
                    pnl = %format!("{:+.2}", pnl),
                    "Fill above allocation could not be covered, position unwound"
                );
                Err(CoordinatorError::FillExceedsAllocation {
                    symbol: symbol.clone(),
                    cost,
                    allocation: reserved.allocation,
                })
            }
            Err(e) => {
                error!(
                    symbol = %symbol,
                    cost = cost,
                    error = %e,
                    "Unwind order failed, keeping the oversized position"
                );
                let mut positions = self
                    .positions
                    .write()
                    .map_err(|_| CoordinatorError::StateUnavailable)?;
                let mut capital = self
                    .capital
                    .write()
                    .map_err(|_| CoordinatorError::StateUnavailable)?;
                let position = positions
                    .get_mut(symbol)
                    .ok_or_else(|| CoordinatorError::UnknownPosition(symbol.clone()))?;
                let absorbed = (cost - position.allocation).min(capital.available).max(0.0);
                capital.available -= absorbed;
                position.allocation += absorbed;
                self.apply_fill(position, ack, quoted_price);
                Ok(position.clone())
            }
        }
    }

    /// Drop an `Opening` reservation and return its allocation
    fn release(&self, symbol: &Symbol) {
        let removed = self
            .positions
            .write()
            .ok()
            .and_then(|mut positions| positions.remove(symbol));
        if let Some(position) = removed {
            if let Ok(mut capital) = self.capital.write() {
                capital.available += position.allocation;
            }
        }
    }
}

/// Relative slack before a fill counts as costing more than its allocation
const FILL_TOLERANCE: f64 = 1e-9;

fn fill_price(ack: &OrderAck, fallback: f64) -> f64 {
    if ack.avg_price > 0.0 {
        ack.avg_price
    } else {
        fallback
    }
}

/// Quote spent (or, for a short, collateral committed) by an entry fill
fn fill_cost(position: &Position, ack: &OrderAck, quoted_price: f64) -> f64 {
    let quantity = if ack.filled_qty > 0.0 {
        ack.filled_qty
    } else {
        position.quantity
    };
    fill_price(ack, quoted_price) * quantity + ack.fee
}

fn ensure_filled(ack: OrderAck) -> Result<OrderAck, ExchangeError> {
    match ack.status {
        OrderStatus::Rejected | OrderStatus::Cancelled => Err(ExchangeError::RejectedByExchange(
            format!("order {} {}", ack.order_id, ack.status),
        )),
        _ => Ok(ack),
    }
}
