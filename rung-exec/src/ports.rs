//! Execution layer port definitions.
//!
//! Ports define the interfaces for external services (exchange, market data,
//! notification and history sinks). Adapters implement these ports for
//! specific services (Bitunix, stub, etc.).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rung_domain::{LivePosition, OrderSide, PendingOrder, Position, Price, Quantity, Side, Symbol};
use rung_engine::{CloseReason, TakeProfitOrder};

use crate::error::ExecResult;

// =============================================================================
// Order requests
// =============================================================================

/// Execution style of a plain order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Execute immediately at market
    Market,
    /// Rest at `price`
    Limit {
        /// Limit price
        price: Price,
        /// Reject instead of taking liquidity
        post_only: bool,
    },
}

/// A plain (non TP/SL) order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Trading pair
    pub symbol: Symbol,
    /// Buy or Sell
    pub side: OrderSide,
    /// Market or limit
    pub kind: OrderKind,
    /// Amount to trade
    pub quantity: Quantity,
    /// Only ever shrink an existing position
    pub reduce_only: bool,
    /// Unique ID for idempotency
    pub client_order_id: String,
}

impl OrderRequest {
    /// Reduce-only market order closing `quantity` of a `position_side` position.
    pub fn market_close(symbol: Symbol, position_side: Side, quantity: Quantity) -> Self {
        Self {
            symbol,
            side: position_side.exit_action(),
            kind: OrderKind::Market,
            quantity,
            reduce_only: true,
            client_order_id: Uuid::now_v7().to_string(),
        }
    }

    /// Limit order opening or adding to a `side` position.
    pub fn limit_entry(
        symbol: Symbol,
        side: Side,
        price: Price,
        quantity: Quantity,
        post_only: bool,
    ) -> Self {
        Self {
            symbol,
            side: side.entry_action(),
            kind: OrderKind::Limit { price, post_only },
            quantity,
            reduce_only: false,
            client_order_id: Uuid::now_v7().to_string(),
        }
    }
}

/// Take-profit leg of a position TP/SL order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeProfitLeg {
    /// Mark price that arms the order
    pub trigger_price: Price,
    /// Limit price of the resulting order
    pub limit_price: Price,
    /// Quantity to close
    pub quantity: Quantity,
}

/// Stop-loss leg of a position TP/SL order (market on trigger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLossLeg {
    /// Mark price that arms the order
    pub trigger_price: Price,
    /// Quantity to close
    pub quantity: Quantity,
}

/// Reduce-only conditional order attached to an exchange position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpSlRequest {
    /// Trading pair
    pub symbol: Symbol,
    /// Exchange-side position identity
    pub position_id: String,
    /// Take-profit leg
    pub take_profit: Option<TakeProfitLeg>,
    /// Stop-loss leg
    pub stop_loss: Option<StopLossLeg>,
}

impl TpSlRequest {
    /// One ladder level.
    pub fn take_profit(symbol: Symbol, position_id: String, order: &TakeProfitOrder) -> Self {
        Self {
            symbol,
            position_id,
            take_profit: Some(TakeProfitLeg {
                trigger_price: order.trigger_price,
                limit_price: order.limit_price,
                quantity: order.quantity,
            }),
            stop_loss: None,
        }
    }

    /// Full-size protective stop.
    pub fn stop_loss(symbol: Symbol, position_id: String, stop: Price, quantity: Quantity) -> Self {
        Self {
            symbol,
            position_id,
            take_profit: None,
            stop_loss: Some(StopLossLeg { trigger_price: stop, quantity }),
        }
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Exchange-assigned order ID
    pub order_id: String,
    /// Execution price, when the exchange reports one
    pub price: Option<Price>,
}

/// Result of a batch cancel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// Cancelled order IDs
    pub succeeded: Vec<String>,
    /// Order IDs the exchange refused to cancel
    pub failed: Vec<String>,
}

impl CancelOutcome {
    /// True when nothing failed.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// Exchange Port
// =============================================================================

/// Port for exchange operations.
///
/// Implementations:
/// - `StubExchange` - For testing (scriptable live state, recorded orders)
/// - `BitunixRestClient` - Bitunix USDT-M futures
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// All open positions on the account.
    async fn list_open_positions(&self) -> ExecResult<Vec<LivePosition>>;

    /// All orders still resting on the book.
    async fn list_pending_orders(&self) -> ExecResult<Vec<PendingOrder>>;

    /// Place a plain order.
    async fn place_order(&self, request: &OrderRequest) -> ExecResult<OrderAck>;

    /// Place a TP/SL order attached to an exchange position.
    async fn place_tpsl_order(&self, request: &TpSlRequest) -> ExecResult<OrderAck>;

    /// Cancel a batch of orders on one symbol.
    async fn cancel_orders(&self, symbol: &Symbol, order_ids: &[String]) -> ExecResult<CancelOutcome>;

    /// Set leverage for a symbol.
    async fn change_leverage(&self, symbol: &Symbol, leverage: u32) -> ExecResult<()>;
}

// =============================================================================
// Market Data Port
// =============================================================================

/// Port for market data subscriptions.
///
/// Implementations:
/// - `StubMarketData` - For testing (manual price injection)
/// - `BitunixTickerFeed` - Bitunix public ticker WebSocket
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Subscribe to last-price updates for a symbol.
    ///
    /// Returns a receiver that yields price updates until unsubscribed.
    async fn subscribe(
        &self,
        symbol: &Symbol,
    ) -> ExecResult<tokio::sync::mpsc::Receiver<PriceUpdate>>;

    /// Unsubscribe from price updates.
    async fn unsubscribe(&self, symbol: &Symbol) -> ExecResult<()>;
}

/// Price update from market data feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Trading pair
    pub symbol: Symbol,
    /// Last traded price
    pub price: Price,
    /// Update timestamp
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Sinks
// =============================================================================

/// Push notification delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    async fn notify(&self, title: &str, text: &str) -> ExecResult<()>;
}

/// Archive of retired positions.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Record a position that is about to be removed from the store.
    async fn record_closed(&self, record: &ClosedPosition) -> ExecResult<()>;
}

/// History entry for a retired position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    /// Final state of the record
    pub position: Position,
    /// Why it was closed
    pub reason: CloseReason,
    /// When it left the store
    pub retired_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
