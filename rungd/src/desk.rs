//! Desk: operator actions outside the reconcile cycle.
//!
//! - [`Desk::open_position`] places a sized set of entry orders and creates
//!   (or extends) the master record
//! - [`Desk::close_symbol`] / [`Desk::close_all`] flatten live exposure with
//!   reduce-only market orders; the reconciler retires the records once the
//!   exchange reports them flat
//! - [`Desk::set_tpsl_enabled`] toggles ladder and stop management

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rung_domain::{weighted_entry_price, LivePosition, Position, Price, Quantity, Side, Symbol};
use rung_exec::{ExecError, OrderRequest};
use rung_store::Modified;

use crate::coordinator::Coordinator;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::DaemonEvent;

/// Pause between symbols in [`Desk::close_all`].
const CLOSE_ALL_PAUSE: Duration = Duration::from_millis(300);

// =============================================================================
// Requests and results
// =============================================================================

/// One limit entry leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOrder {
    pub price: Price,
    pub quantity: Quantity,
}

/// Fully sized request to open (or add to) a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub entries: Vec<EntryOrder>,
    pub targets: Vec<Price>,
    pub stop_loss: Option<Price>,
    /// Defaults to the configured leverage
    pub leverage: Option<u32>,
    pub post_only: bool,
}

/// Result of [`Desk::open_position`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    /// Master record as stored
    pub position: Position,
    /// Exchange ids of the accepted entries
    pub order_ids: Vec<String>,
    /// Errors of the rejected entries
    pub failed: Vec<String>,
    /// An existing record was extended instead of created
    pub reused: bool,
}

/// One flattened exposure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedExposure {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub order_id: String,
}

/// Result of a manual close.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloseSummary {
    pub closed: Vec<ClosedExposure>,
    pub failures: Vec<String>,
}

impl CloseSummary {
    /// Total quantity closed across all symbols.
    pub fn total_closed(&self) -> Decimal {
        self.closed.iter().map(|c| c.quantity).sum()
    }

    fn merge(&mut self, other: CloseSummary) {
        self.closed.extend(other.closed);
        self.failures.extend(other.failures);
    }
}

// =============================================================================
// Desk
// =============================================================================

/// Manual operations against the exchange and the store.
pub struct Desk {
    ctx: Arc<Coordinator>,
}

impl Desk {
    pub fn new(ctx: Arc<Coordinator>) -> Self {
        Self { ctx }
    }

    /// Place the entry orders of `request` and track them.
    ///
    /// An active master record for the same symbol and side is extended
    /// rather than duplicated.
    ///
    /// # Errors
    /// `InvalidRequest` for a request without entries, targets or stop-loss;
    /// the last exchange error when no entry was accepted.
    pub async fn open_position(&self, request: OpenRequest) -> DaemonResult<OpenOutcome> {
        if request.entries.is_empty() {
            return Err(DaemonError::InvalidRequest("no entry orders".to_string()));
        }
        if request.targets.is_empty() {
            return Err(DaemonError::InvalidRequest("no take-profit targets".to_string()));
        }
        if request.stop_loss.is_none() {
            return Err(DaemonError::InvalidRequest("no stop-loss".to_string()));
        }

        let leverage = request.leverage.unwrap_or(self.ctx.default_leverage());
        if let Err(e) = self.ctx.exchange.change_leverage(&request.symbol, leverage).await {
            warn!(symbol = %request.symbol, leverage, error = %e, "Failed to set leverage, placing entries anyway");
        }

        let mut order_ids = Vec::new();
        let mut failed = Vec::new();
        let mut legs: Vec<(Price, Decimal)> = Vec::new();
        let mut last_error: Option<ExecError> = None;

        for entry in &request.entries {
            let order = OrderRequest::limit_entry(
                request.symbol.clone(),
                request.side,
                entry.price,
                entry.quantity,
                request.post_only,
            );
            match self.ctx.exchange.place_order(&order).await {
                Ok(ack) => {
                    info!(
                        symbol = %request.symbol,
                        side = %request.side,
                        price = %entry.price,
                        quantity = %entry.quantity,
                        order_id = %ack.order_id,
                        "Entry order placed"
                    );
                    order_ids.push(ack.order_id);
                    legs.push((entry.price, entry.quantity.as_decimal()));
                },
                Err(e) => {
                    warn!(symbol = %request.symbol, price = %entry.price, error = %e, "Entry order rejected");
                    failed.push(e.to_string());
                    last_error = Some(e);
                },
            }
        }

        if legs.is_empty() {
            return Err(last_error
                .map(DaemonError::from)
                .unwrap_or_else(|| DaemonError::InvalidRequest("no entry accepted".to_string())));
        }

        let placed_qty: Decimal = legs.iter().map(|(_, qty)| *qty).sum();
        let (position, reused) = match self.find_active(&request.symbol, request.side).await? {
            Some(existing) => (self.extend(existing, &legs, placed_qty).await?, true),
            None => {
                let mut position = Position::new(
                    request.symbol.clone(),
                    request.side,
                    request.targets.clone(),
                    request.stop_loss,
                    placed_qty,
                );
                position.avg_entry_price = weighted_entry_price(&legs);
                (self.ctx.store.insert(&position).await?, false)
            },
        };

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            entries = order_ids.len(),
            total_qty = %position.total_qty,
            reused,
            "Position tracked"
        );
        self.ctx.event_bus.send(DaemonEvent::PositionsChanged);

        Ok(OpenOutcome {
            position,
            order_ids,
            failed,
            reused,
        })
    }

    async fn find_active(&self, symbol: &Symbol, side: Side) -> DaemonResult<Option<Position>> {
        let positions = self.ctx.store.load().await?;
        Ok(positions
            .into_iter()
            .find(|p| &p.symbol == symbol && p.side == side && p.is_active()))
    }

    async fn extend(&self, existing: Position, legs: &[(Price, Decimal)], placed_qty: Decimal) -> DaemonResult<Position> {
        let result = self
            .ctx
            .modify(existing.id, |p| {
                let mut weighted: Vec<(Price, Decimal)> = legs.to_vec();
                if let Some(avg) = p.avg_entry_price {
                    weighted.push((avg, p.total_qty));
                }
                p.avg_entry_price = weighted_entry_price(&weighted);
                p.total_qty += placed_qty;
                true
            })
            .await?;

        match result {
            Modified::Updated(p) | Modified::Unchanged(p) => Ok(p),
            Modified::Missing => Err(DaemonError::InvalidRequest(format!(
                "position {} disappeared while being extended",
                existing.id
            ))),
        }
    }

    /// Flatten live exposure on `symbol`, optionally one side only.
    pub async fn close_symbol(&self, symbol: &Symbol, side: Option<Side>) -> DaemonResult<CloseSummary> {
        let live = self.ctx.exchange.list_open_positions().await?;
        let targets: Vec<LivePosition> = live
            .into_iter()
            .filter(|p| match side {
                Some(side) => p.matches(symbol, side),
                None => p.matches(symbol, Side::Long) || p.matches(symbol, Side::Short),
            })
            .collect();
        Ok(self.close_live(&targets).await)
    }

    /// Flatten every live position, one symbol at a time.
    pub async fn close_all(&self) -> DaemonResult<CloseSummary> {
        let live = self.ctx.exchange.list_open_positions().await?;

        let mut by_symbol: Vec<(Symbol, Vec<LivePosition>)> = Vec::new();
        for position in live {
            let Ok(symbol) = Symbol::from_pair(&position.symbol) else {
                warn!(symbol = %position.symbol, "Unrecognised symbol, skipping");
                continue;
            };
            match by_symbol.iter_mut().find(|(s, _)| s == &symbol) {
                Some((_, group)) => group.push(position),
                None => by_symbol.push((symbol, vec![position])),
            }
        }

        let mut summary = CloseSummary::default();
        for (index, (symbol, group)) in by_symbol.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(CLOSE_ALL_PAUSE).await;
            }
            info!(symbol = %symbol, positions = group.len(), "Closing symbol");
            summary.merge(self.close_live(group).await);
        }
        Ok(summary)
    }

    async fn close_live(&self, live: &[LivePosition]) -> CloseSummary {
        let mut summary = CloseSummary::default();

        for position in live {
            let (symbol, side) = match (Symbol::from_pair(&position.symbol), Side::parse(&position.side)) {
                (Ok(symbol), Ok(side)) => (symbol, side),
                _ => {
                    summary.failures.push(format!("{} {}: unparseable position", position.symbol, position.side));
                    continue;
                },
            };
            let Ok(quantity) = Quantity::new(position.quantity()) else {
                continue;
            };

            let order = OrderRequest::market_close(symbol.clone(), side, quantity);
            match self.ctx.exchange.place_order(&order).await {
                Ok(ack) => {
                    info!(symbol = %symbol, side = %side, quantity = %quantity, order_id = %ack.order_id, "Position closed manually");
                    summary.closed.push(ClosedExposure {
                        symbol,
                        side,
                        quantity: quantity.as_decimal(),
                        order_id: ack.order_id,
                    });
                },
                Err(e) => {
                    warn!(symbol = %symbol, side = %side, error = %e, "Manual close failed");
                    summary.failures.push(format!("{} {}: {}", symbol, side, e));
                },
            }
        }

        summary
    }

    /// Toggle ladder and stop management. Returns the previous value.
    pub fn set_tpsl_enabled(&self, enabled: bool) -> bool {
        self.ctx.set_tpsl_enabled(enabled)
    }
}

// =============================================================================
// Tests
// =============================================================================
