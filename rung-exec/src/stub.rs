//! Stub implementations for testing.
//!
//! These implementations simulate exchange and market data behavior
//! without making real API calls. Live state is scripted by the test;
//! every order is recorded for later inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::debug;

use rung_domain::{LivePosition, PendingOrder, Price, Side, Symbol};

use crate::error::{ExecError, ExecResult};
use crate::ports::{
    CancelOutcome, ExchangePort, MarketDataPort, OrderAck, OrderKind, OrderRequest, PriceUpdate,
    TpSlRequest,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Scripted failures
// =============================================================================

/// Exchange operation a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubOp {
    /// `list_open_positions`
    ListPositions,
    /// `list_pending_orders`
    ListOrders,
    /// `place_order`
    PlaceOrder,
    /// `place_tpsl_order`
    PlaceTpSl,
    /// `cancel_orders`
    Cancel,
    /// `change_leverage`
    Leverage,
}

/// Failure to inject into the next call of a [`StubOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubFailure {
    /// Network style failure
    Transient,
    /// Exchange rejection with this message
    Reject(String),
}

impl StubFailure {
    fn into_error(self, op: StubOp) -> ExecError {
        match self {
            StubFailure::Transient => ExecError::Exchange(format!("Simulated {:?} failure", op)),
            StubFailure::Reject(message) => ExecError::rejected(message),
        }
    }
}

// =============================================================================
// Stub Exchange
// =============================================================================

/// Stub exchange for testing.
///
/// - live positions and pending orders are whatever the test last set
/// - reduce-only market orders shrink the matching live position
/// - every request is recorded
pub struct StubExchange {
    positions: Mutex<Vec<LivePosition>>,
    pending: Mutex<Vec<PendingOrder>>,
    orders: Mutex<Vec<OrderRequest>>,
    tpsl_orders: Mutex<Vec<TpSlRequest>>,
    cancels: Mutex<Vec<(Symbol, Vec<String>)>>,
    leverage_calls: Mutex<Vec<(Symbol, u32)>>,
    failures: Mutex<HashMap<StubOp, VecDeque<StubFailure>>>,
    fill_price: Mutex<Option<Decimal>>,
    order_delay: Mutex<Option<Duration>>,
    order_counter: AtomicU64,
}

impl StubExchange {
    /// Create a stub exchange with no positions and no orders.
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            tpsl_orders: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            leverage_calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            fill_price: Mutex::new(None),
            order_delay: Mutex::new(None),
            order_counter: AtomicU64::new(0),
        }
    }

    /// Replace the live position list.
    pub fn set_positions(&self, positions: Vec<LivePosition>) {
        *lock(&self.positions) = positions;
    }

    /// Replace the pending order list.
    pub fn set_pending_orders(&self, orders: Vec<PendingOrder>) {
        *lock(&self.pending) = orders;
    }

    /// Price reported back for market fills.
    pub fn set_fill_price(&self, price: Decimal) {
        *lock(&self.fill_price) = Some(price);
    }

    /// Delay every `place_order` call (simulates exchange latency).
    pub fn set_order_delay(&self, delay: Duration) {
        *lock(&self.order_delay) = Some(delay);
    }

    /// Fail the next call of `op`. Failures queue up per operation.
    pub fn fail_next(&self, op: StubOp, failure: StubFailure) {
        lock(&self.failures).entry(op).or_default().push_back(failure);
    }

    /// Plain orders placed so far.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        lock(&self.orders).clone()
    }

    /// TP/SL orders placed so far.
    pub fn tpsl_orders(&self) -> Vec<TpSlRequest> {
        lock(&self.tpsl_orders).clone()
    }

    /// Cancel batches requested so far.
    pub fn cancelled(&self) -> Vec<(Symbol, Vec<String>)> {
        lock(&self.cancels).clone()
    }

    /// Leverage changes requested so far.
    pub fn leverage_calls(&self) -> Vec<(Symbol, u32)> {
        lock(&self.leverage_calls).clone()
    }

    /// Generate a unique order ID.
    fn next_order_id(&self) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("STUB-{}", n)
    }

    /// Pop a scripted failure for `op`, if any.
    fn take_failure(&self, op: StubOp) -> ExecResult<()> {
        match lock(&self.failures).get_mut(&op).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.into_error(op)),
            None => Ok(()),
        }
    }

    /// Apply a reduce-only market fill to the live book.
    fn fill_reduce_only(&self, request: &OrderRequest) {
        let position_side = match request.side {
            rung_domain::OrderSide::Sell => Side::Long,
            rung_domain::OrderSide::Buy => Side::Short,
        };
        let mut positions = lock(&self.positions);
        if let Some(live) = positions
            .iter_mut()
            .find(|p| p.matches(&request.symbol, position_side))
        {
            let remaining = (live.quantity() - request.quantity.as_decimal()).max(Decimal::ZERO);
            live.qty = Some(remaining.normalize().to_string());
            live.position_qty = None;
            live.hold_qty = None;
            live.position_amt = None;
            live.avail_qty = None;
            live.position_size = None;
        }
        positions.retain(|p| !p.quantity().is_zero());
    }
}

impl Default for StubExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangePort for StubExchange {
    async fn list_open_positions(&self) -> ExecResult<Vec<LivePosition>> {
        self.take_failure(StubOp::ListPositions)?;
        Ok(lock(&self.positions).clone())
    }

    async fn list_pending_orders(&self) -> ExecResult<Vec<PendingOrder>> {
        self.take_failure(StubOp::ListOrders)?;
        Ok(lock(&self.pending).clone())
    }

    async fn place_order(&self, request: &OrderRequest) -> ExecResult<OrderAck> {
        let delay = *lock(&self.order_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.take_failure(StubOp::PlaceOrder)?;

        lock(&self.orders).push(request.clone());
        if request.reduce_only && request.kind == OrderKind::Market {
            self.fill_reduce_only(request);
        }

        let order_id = self.next_order_id();
        debug!(%order_id, symbol = %request.symbol, side = %request.side, "Stub: order placed");

        let fill = *lock(&self.fill_price);
        Ok(OrderAck {
            order_id,
            price: fill.and_then(|p| Price::new(p).ok()),
        })
    }

    async fn place_tpsl_order(&self, request: &TpSlRequest) -> ExecResult<OrderAck> {
        self.take_failure(StubOp::PlaceTpSl)?;
        lock(&self.tpsl_orders).push(request.clone());
        Ok(OrderAck {
            order_id: self.next_order_id(),
            price: None,
        })
    }

    async fn cancel_orders(&self, symbol: &Symbol, order_ids: &[String]) -> ExecResult<CancelOutcome> {
        self.take_failure(StubOp::Cancel)?;
        lock(&self.cancels).push((symbol.clone(), order_ids.to_vec()));
        lock(&self.pending).retain(|o| {
            o.order_id
                .as_ref()
                .map(|id| !order_ids.contains(id))
                .unwrap_or(true)
        });
        Ok(CancelOutcome {
            succeeded: order_ids.to_vec(),
            failed: Vec::new(),
        })
    }

    async fn change_leverage(&self, symbol: &Symbol, leverage: u32) -> ExecResult<()> {
        self.take_failure(StubOp::Leverage)?;
        lock(&self.leverage_calls).push((symbol.clone(), leverage));
        Ok(())
    }
}

// =============================================================================
// Stub Market Data
// =============================================================================

/// Stub market data provider for testing.
///
/// Allows manual price injection for testing scenarios.
pub struct StubMarketData {
    /// Active subscriptions (symbol -> sender)
    subscriptions: Mutex<HashMap<String, mpsc::Sender<PriceUpdate>>>,
    /// Number of subscribe calls made
    subscribe_calls: AtomicU64,
}

impl StubMarketData {
    /// Create a new stub market data provider.
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            subscribe_calls: AtomicU64::new(0),
        }
    }

    /// Push a last-price tick to subscribers of `symbol`.
    ///
    /// Returns `false` when nobody is subscribed.
    pub async fn push_price(&self, symbol: &Symbol, price: Decimal) -> bool {
        let sender = lock(&self.subscriptions).get(&symbol.as_pair()).cloned();
        let (Some(sender), Ok(price)) = (sender, Price::new(price)) else {
            return false;
        };
        let update = PriceUpdate {
            symbol: symbol.clone(),
            price,
            timestamp: Utc::now(),
        };
        sender.send(update).await.is_ok()
    }

    /// Symbols with a live subscription, sorted.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// How many times `subscribe` was called.
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

impl Default for StubMarketData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataPort for StubMarketData {
    async fn subscribe(&self, symbol: &Symbol) -> ExecResult<mpsc::Receiver<PriceUpdate>> {
        let (tx, rx) = mpsc::channel(256);
        lock(&self.subscriptions).insert(symbol.as_pair(), tx);
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        debug!(symbol = %symbol, "Stub: subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, symbol: &Symbol) -> ExecResult<()> {
        lock(&self.subscriptions).remove(&symbol.as_pair());
        debug!(symbol = %symbol, "Stub: unsubscribed");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
