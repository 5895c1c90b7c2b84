//! The reconciler and the price monitor write the same records without
//! coordinating. Neither may undo the other's change.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use rung_domain::{LivePosition, PendingOrder, Position, PositionStatus, Price, Side, Symbol};
use rung_engine::{CloseReason, LadderEngine, ReconcileDelta};
use rung_exec::{
    CancelOutcome, ExchangePort, ExecResult, MemoryHistory, OrderAck, OrderRequest, RecordingNotifier,
    StubExchange, StubMarketData, TpSlRequest,
};
use rung_store::{MemoryStore, PositionStore};
use rungd::{Adapters, Config, Coordinator, PositionOutcome, PriceMonitor, Reconciler};

/// Snapshot taken on entry, delivered after a delay: a stale view by the
/// time the caller sees it.
struct LaggingExchange {
    inner: Arc<StubExchange>,
    lag: Duration,
}

#[async_trait]
impl ExchangePort for LaggingExchange {
    async fn list_open_positions(&self) -> ExecResult<Vec<LivePosition>> {
        let snapshot = self.inner.list_open_positions().await;
        tokio::time::sleep(self.lag).await;
        snapshot
    }

    async fn list_pending_orders(&self) -> ExecResult<Vec<PendingOrder>> {
        self.inner.list_pending_orders().await
    }

    async fn place_order(&self, request: &OrderRequest) -> ExecResult<OrderAck> {
        self.inner.place_order(request).await
    }

    async fn place_tpsl_order(&self, request: &TpSlRequest) -> ExecResult<OrderAck> {
        self.inner.place_tpsl_order(request).await
    }

    async fn cancel_orders(&self, symbol: &Symbol, order_ids: &[String]) -> ExecResult<CancelOutcome> {
        self.inner.cancel_orders(symbol, order_ids).await
    }

    async fn change_leverage(&self, symbol: &Symbol, leverage: u32) -> ExecResult<()> {
        self.inner.change_leverage(symbol, leverage).await
    }
}

/// Fills market orders immediately but acknowledges them late, and reads
/// positions only after a delay.
struct SlowAckExchange {
    inner: Arc<StubExchange>,
    read_delay: Duration,
    ack_delay: Duration,
}

#[async_trait]
impl ExchangePort for SlowAckExchange {
    async fn list_open_positions(&self) -> ExecResult<Vec<LivePosition>> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.list_open_positions().await
    }

    async fn list_pending_orders(&self) -> ExecResult<Vec<PendingOrder>> {
        self.inner.list_pending_orders().await
    }

    async fn place_order(&self, request: &OrderRequest) -> ExecResult<OrderAck> {
        let ack = self.inner.place_order(request).await;
        tokio::time::sleep(self.ack_delay).await;
        ack
    }

    async fn place_tpsl_order(&self, request: &TpSlRequest) -> ExecResult<OrderAck> {
        self.inner.place_tpsl_order(request).await
    }

    async fn cancel_orders(&self, symbol: &Symbol, order_ids: &[String]) -> ExecResult<CancelOutcome> {
        self.inner.cancel_orders(symbol, order_ids).await
    }

    async fn change_leverage(&self, symbol: &Symbol, leverage: u32) -> ExecResult<()> {
        self.inner.change_leverage(symbol, leverage).await
    }
}

fn px(value: Decimal) -> Price {
    Price::new(value).unwrap()
}

fn open_position(qty: Decimal) -> Position {
    let targets = [dec!(100), dec!(110), dec!(120)].into_iter().map(px).collect();
    let mut position = Position::new(
        Symbol::from_pair("BTCUSDT").unwrap(),
        Side::Long,
        targets,
        Some(px(dec!(95))),
        qty,
    );
    position.status = PositionStatus::Open;
    position.current_qty = qty;
    position.sl_placed = true;
    position
}

fn live(qty: &str) -> LivePosition {
    LivePosition {
        symbol: "BTCUSDT".to_string(),
        side: "BUY".to_string(),
        position_id: Some("pos-1".to_string()),
        qty: Some(qty.to_string()),
        ..Default::default()
    }
}

async fn wait_for_closed(store: &MemoryStore, position: &Position) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if let Some(p) = store.find_by_id(position.id).await.unwrap() {
            if p.is_closed() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("position never closed");
}

#[tokio::test]
async fn test_stale_reconcile_does_not_revive_stop_loss_close() {
    let position = open_position(dec!(10));
    let id = position.id;

    let stub = Arc::new(StubExchange::new());
    stub.set_positions(vec![live("10")]);
    let market = Arc::new(StubMarketData::new());
    let store = Arc::new(MemoryStore::with_positions([position.clone()]));
    let history = Arc::new(MemoryHistory::new());
    let adapters = Adapters {
        exchange: Arc::new(LaggingExchange {
            inner: stub.clone(),
            lag: Duration::from_millis(400),
        }),
        market_data: market.clone(),
        store: store.clone(),
        notifier: Arc::new(RecordingNotifier::new()),
        history: history.clone(),
    };
    let ctx = Arc::new(Coordinator::new(&Config::test(), adapters).unwrap());
    let monitor = tokio::spawn(PriceMonitor::new(ctx.clone()).run());
    let reconciler = Arc::new(Reconciler::new(ctx.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while market.subscribed_symbols().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "monitor never subscribed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Tick snapshots qty 10, then stalls while the stop fires
    let tick = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.try_run_tick().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let btc = Symbol::from_pair("BTCUSDT").unwrap();
    assert!(market.push_price(&btc, dec!(94.9)).await);
    wait_for_closed(&store, &position).await;

    let report = tick.await.unwrap().unwrap();
    assert!(report.aborted.is_none());

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert_eq!(stored.current_qty, Decimal::ZERO);
    assert!(stored.allocated_total() <= stored.current_qty);

    // Next tick sees the exchange flat and retires the record
    let report = reconciler.try_run_tick().await.unwrap();
    assert_eq!(
        report.outcome_for(id),
        Some(&PositionOutcome::Closed { reason: CloseReason::Triggered })
    );
    assert_eq!(store.position_count().await, 0);
    assert_eq!(history.records().len(), 1);

    ctx.shutdown.cancel();
    monitor.await.unwrap();
}

#[tokio::test]
async fn test_fill_seen_by_reconcile_before_ack_is_not_counted_twice() {
    let position = open_position(dec!(10));
    let id = position.id;

    let stub = Arc::new(StubExchange::new());
    stub.set_positions(vec![live("10")]);
    let market = Arc::new(StubMarketData::new());
    let store = Arc::new(MemoryStore::with_positions([position]));
    let adapters = Adapters {
        exchange: Arc::new(SlowAckExchange {
            inner: stub.clone(),
            read_delay: Duration::from_millis(150),
            ack_delay: Duration::from_millis(400),
        }),
        market_data: market.clone(),
        store: store.clone(),
        notifier: Arc::new(RecordingNotifier::new()),
        history: Arc::new(MemoryHistory::new()),
    };
    let mut config = Config::test();
    config.reconcile.tpsl_enabled = false;
    let ctx = Arc::new(Coordinator::new(&config, adapters).unwrap());
    let monitor = tokio::spawn(PriceMonitor::new(ctx.clone()).run());
    let reconciler = Reconciler::new(ctx.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while market.subscribed_symbols().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "monitor never subscribed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // First target: 3 of 10 close on the exchange, the ack lags
    let btc = Symbol::from_pair("BTCUSDT").unwrap();
    assert!(market.push_price(&btc, dec!(100.5)).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(ctx.exit_in_flight(id));

    // The tick reads the reduced size while the exit is unrecorded
    reconciler.try_run_tick().await.unwrap();
    let during = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(during.current_qty, dec!(10));
    assert_eq!(during.exchange_position_id.as_deref(), Some("pos-1"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let p = store.find_by_id(id).await.unwrap().unwrap();
        if p.next_level_index == 1 && !ctx.exit_in_flight(id) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "exit never recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let recorded = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(recorded.current_qty, dec!(7));

    reconciler.try_run_tick().await.unwrap();
    let synced = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(synced.current_qty, dec!(7));
    assert!(synced.allocated_total() <= synced.current_qty);

    ctx.shutdown.cancel();
    monitor.await.unwrap();
    ctx.tasks.close();
    ctx.tasks.wait().await;
}

#[tokio::test]
async fn test_interleaved_mutations_are_all_applied() {
    let store = Arc::new(MemoryStore::with_positions([open_position(dec!(10))]));
    let id = store.load().await.unwrap()[0].id;
    let ctx = Arc::new(
        Coordinator::new(
            &Config::test(),
            Adapters {
                exchange: Arc::new(StubExchange::new()),
                market_data: Arc::new(StubMarketData::new()),
                store: store.clone(),
                notifier: Arc::new(RecordingNotifier::new()),
                history: Arc::new(MemoryHistory::new()),
            },
        )
        .unwrap(),
    );

    // Monitor-style market exits on three levels racing reconcile-style
    // bookkeeping that only touches the pending entry count
    let mut handles = Vec::new();
    for level in 0..3usize {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            ctx.modify(id, |p| {
                LadderEngine::apply_market_exit(p, level, dec!(1));
                true
            })
            .await
            .unwrap();
        }));
    }
    for count in 0..3u32 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            ctx.modify(id, |p| {
                let previous = p.pending_entry_count;
                p.pending_entry_count = Some(previous.unwrap_or(0) + count + 1);
                true
            })
            .await
            .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.current_qty, dec!(7));
    assert_eq!(stored.allocated_total(), dec!(3));
    assert_eq!(stored.next_level_index, 3);
    assert_eq!(stored.pending_entry_count, Some(6));
    assert_eq!(stored.version, 7);
}

#[tokio::test]
async fn test_stale_delta_keeps_fresher_quantity() {
    let store = Arc::new(MemoryStore::with_positions([open_position(dec!(10))]));
    let id = store.load().await.unwrap()[0].id;
    let ctx = Arc::new(
        Coordinator::new(
            &Config::test(),
            Adapters {
                exchange: Arc::new(StubExchange::new()),
                market_data: Arc::new(StubMarketData::new()),
                store: store.clone(),
                notifier: Arc::new(RecordingNotifier::new()),
                history: Arc::new(MemoryHistory::new()),
            },
        )
        .unwrap(),
    );

    let snapshot = store.find_by_id(id).await.unwrap().unwrap();
    let assessment = rung_engine::assess(
        &snapshot,
        &[live("10")],
        &[],
        ctx.thresholds(),
    );
    let observed_at = chrono::Utc::now();
    let delta = ReconcileDelta::observe(&assessment, observed_at);

    // Monitor closes 3 after the snapshot was taken
    let closed_at = observed_at + chrono::Duration::milliseconds(5);
    ctx.modify(id, |p| {
        LadderEngine::apply_market_exit(p, 0, dec!(3));
        p.qty_synced_at = Some(closed_at);
        true
    })
    .await
    .unwrap();

    ctx.modify(id, |p| delta.apply(p)).await.unwrap();

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.current_qty, dec!(7));
    assert_eq!(stored.exchange_position_id.as_deref(), Some("pos-1"));
}
