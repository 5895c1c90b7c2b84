//! Reconciliation cycle against the stub exchange.
//!
//! Each test seeds the store and the stub's live state, runs one or more
//! ticks and checks the stored record, the orders sent and the sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use rung_domain::{LivePosition, PendingOrder, Position, PositionStatus, Price, Quantity, Side, Symbol};
use rung_engine::CloseReason;
use rung_exec::{
    CancelOutcome, ExchangePort, ExecResult, MemoryHistory, OrderAck, OrderRequest, RecordingNotifier,
    StubExchange, StubFailure, StubMarketData, StubOp, TpSlRequest,
};
use rung_store::{JsonFileStore, MemoryStore, PositionStore};
use rungd::{Adapters, Config, Coordinator, DaemonEvent, PositionOutcome, Reconciler};

// =============================================================================
// Fixtures
// =============================================================================

struct Harness {
    exchange: Arc<StubExchange>,
    notifier: Arc<RecordingNotifier>,
    history: Arc<MemoryHistory>,
    ctx: Arc<Coordinator>,
    reconciler: Reconciler,
}

fn harness(config: Config, store: Arc<dyn PositionStore>) -> Harness {
    let exchange = Arc::new(StubExchange::new());
    harness_with_exchange(config, store, exchange.clone(), exchange)
}

fn harness_with_exchange(
    config: Config,
    store: Arc<dyn PositionStore>,
    stub: Arc<StubExchange>,
    exchange: Arc<dyn ExchangePort>,
) -> Harness {
    let notifier = Arc::new(RecordingNotifier::new());
    let history = Arc::new(MemoryHistory::new());
    let adapters = Adapters {
        exchange,
        market_data: Arc::new(StubMarketData::new()),
        store,
        notifier: notifier.clone(),
        history: history.clone(),
    };
    let ctx = Arc::new(Coordinator::new(&config, adapters).unwrap());
    Harness {
        exchange: stub,
        notifier,
        history,
        reconciler: Reconciler::new(ctx.clone()),
        ctx,
    }
}

fn btc() -> Symbol {
    Symbol::from_pair("BTCUSDT").unwrap()
}

fn px(value: Decimal) -> Price {
    Price::new(value).unwrap()
}

/// Long BTC position with targets 100..150 and a stop at 95.
fn ladder_position(status: PositionStatus, qty: Decimal) -> Position {
    let targets = [dec!(100), dec!(110), dec!(120), dec!(130), dec!(140), dec!(150)]
        .into_iter()
        .map(px)
        .collect();
    let mut position = Position::new(btc(), Side::Long, targets, Some(px(dec!(95))), qty);
    position.status = status;
    position.current_qty = qty;
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

fn entry(id: &str) -> PendingOrder {
    PendingOrder {
        order_id: Some(id.to_string()),
        symbol: "BTCUSDT".to_string(),
        side: "BUY".to_string(),
        order_type: "LIMIT".to_string(),
        reduce_only: false,
        status: "NEW".to_string(),
        trade_qty: Some("0".to_string()),
        price: Some("97".to_string()),
        qty: Some("3".to_string()),
    }
}

fn take_profit_qty(request: &TpSlRequest) -> Option<Decimal> {
    request.take_profit.as_ref().map(|leg| leg.quantity.as_decimal())
}

// =============================================================================
// Ladder
// =============================================================================

#[tokio::test]
async fn test_ladder_first_submission_and_idempotence() {
    let position = ladder_position(PositionStatus::Open, dec!(10));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("10")]);

    let report = h.reconciler.try_run_tick().await.unwrap();
    assert_eq!(report.outcome_for(id), Some(&PositionOutcome::Updated));

    let orders = h.exchange.tpsl_orders();
    let first = orders[0].take_profit.as_ref().unwrap();
    assert_eq!(first.quantity, Quantity::new(dec!(3)).unwrap());
    assert_eq!(first.trigger_price, px(dec!(100)));
    assert_eq!(first.limit_price, px(dec!(100.1)));
    assert_eq!(orders[0].position_id, "pos-1");

    let ladder: Vec<Decimal> = orders.iter().filter_map(take_profit_qty).collect();
    assert_eq!(ladder, vec![dec!(3), dec!(3), dec!(2), dec!(1), dec!(0.5), dec!(0.5)]);

    let stop = orders.iter().find_map(|o| o.stop_loss.as_ref()).unwrap();
    assert_eq!(stop.trigger_price, px(dec!(95)));
    assert_eq!(stop.quantity.as_decimal(), dec!(10));

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.next_level_index, 6);
    assert_eq!(stored.allocated_total(), dec!(10));
    assert!(stored.sl_placed);
    assert!(stored.allocated_total() <= stored.current_qty);

    // Same live quantity: nothing new is sent or written
    let report = h.reconciler.try_run_tick().await.unwrap();
    assert_eq!(report.outcome_for(id), Some(&PositionOutcome::Unchanged));
    assert_eq!(report.persisted, 0);
    assert_eq!(h.exchange.tpsl_orders().len(), orders.len());
}

#[tokio::test]
async fn test_pending_fill_activates_and_builds_ladder_in_one_tick() {
    let position = ladder_position(PositionStatus::PendingFill, Decimal::ZERO);
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("2")]);
    h.exchange.set_pending_orders(vec![entry("e2")]);

    h.reconciler.try_run_tick().await.unwrap();

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Open);
    assert_eq!(stored.current_qty, dec!(2));
    assert_eq!(stored.pending_entry_count, Some(1));
    assert_eq!(stored.exchange_position_id.as_deref(), Some("pos-1"));
    assert_eq!(take_profit_qty(&h.exchange.tpsl_orders()[0]), Some(dec!(0.6)));
}

#[tokio::test]
async fn test_expected_rejection_advances_ladder() {
    let position = ladder_position(PositionStatus::Open, dec!(10));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("10")]);
    h.exchange.fail_next(StubOp::PlaceTpSl, StubFailure::Reject("Duplicate order".to_string()));

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert_eq!(report.outcome_for(id), Some(&PositionOutcome::Updated));
    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.allocated_qty_per_level[0], dec!(3));
    assert_eq!(stored.next_level_index, 6);
}

#[tokio::test]
async fn test_transient_failure_leaves_ladder_for_next_tick() {
    let position = ladder_position(PositionStatus::Open, dec!(10));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("10")]);
    h.exchange.fail_next(StubOp::PlaceTpSl, StubFailure::Transient);

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert!(matches!(report.outcome_for(id), Some(PositionOutcome::Failed { .. })));
    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.next_level_index, 0);
    assert_eq!(stored.allocated_total(), Decimal::ZERO);

    h.reconciler.try_run_tick().await.unwrap();
    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.next_level_index, 6);
    assert_eq!(stored.allocated_total(), dec!(10));
}

#[tokio::test]
async fn test_tpsl_disabled_tracks_lifecycle_only() {
    let position = ladder_position(PositionStatus::PendingFill, Decimal::ZERO);
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.ctx.set_tpsl_enabled(false);
    h.exchange.set_positions(vec![live("4")]);

    h.reconciler.try_run_tick().await.unwrap();

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Open);
    assert!(h.exchange.tpsl_orders().is_empty());
    assert!(!stored.sl_placed);
}

// =============================================================================
// Refill
// =============================================================================

#[tokio::test]
async fn test_refill_resets_ladder() {
    let mut position = ladder_position(PositionStatus::Open, dec!(5));
    position.sl_placed = true;
    position.pending_entry_count = Some(2);
    position.allocated_qty_per_level = vec![dec!(1.5), dec!(1.5), dec!(0), dec!(0), dec!(0), dec!(0)];
    position.next_level_index = 2;
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    let mut events = h.ctx.event_bus.subscribe();

    h.exchange.set_positions(vec![live("8")]);
    h.exchange.set_pending_orders(vec![entry("e2")]);

    h.reconciler.try_run_tick().await.unwrap();

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.next_level_index, 0);
    assert!(stored.allocated_qty_per_level.iter().all(|q| q.is_zero()));
    assert_eq!(stored.current_qty, dec!(8));

    // The stop is re-placed for the new size in the same tick
    assert!(stored.sl_placed);
    let stop = h.exchange.tpsl_orders().iter().find_map(|o| o.stop_loss.clone()).unwrap();
    assert_eq!(stop.quantity.as_decimal(), dec!(8));
    assert_eq!(stored.pending_entry_count, Some(1));

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Ladder Executed");
    assert!(sent[0].1.contains("+3"));

    let mut rebuilt = None;
    while let Some(event) = events.try_recv() {
        if let Ok(DaemonEvent::LadderRebuilt { fill_qty, .. }) = event {
            rebuilt = Some(fill_qty);
        }
    }
    assert_eq!(rebuilt, Some(dec!(3)));
}

// =============================================================================
// Close and retire
// =============================================================================

#[tokio::test]
async fn test_flat_position_closes_and_is_removed_once() {
    let position = ladder_position(PositionStatus::Open, dec!(2));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("0.0004")]);

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert_eq!(
        report.outcome_for(id),
        Some(&PositionOutcome::Closed { reason: CloseReason::Flat })
    );
    assert_eq!(report.removed, 1);
    assert_eq!(store.position_count().await, 0);

    let records = h.history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, CloseReason::Flat);
    assert_eq!(records[0].position.status, PositionStatus::Closed);
    assert!(records[0].position.closed_at.is_some());

    let report = h.reconciler.try_run_tick().await.unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(h.history.records().len(), 1);
    assert_eq!(h.notifier.titles(), vec!["Trade Closed - BTCUSDT".to_string()]);
}

#[tokio::test]
async fn test_unidentified_position_is_force_closed() {
    let position = ladder_position(PositionStatus::Open, dec!(3));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_pending_orders(vec![entry("e1")]);

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert_eq!(
        report.outcome_for(id),
        Some(&PositionOutcome::Closed { reason: CloseReason::Unidentified })
    );
    assert_eq!(h.exchange.cancelled(), vec![(btc(), vec!["e1".to_string()])]);
    assert_eq!(store.position_count().await, 0);
    assert_eq!(h.history.records()[0].reason, CloseReason::Unidentified);
}

#[tokio::test]
async fn test_unidentified_position_kept_when_forced_close_disabled() {
    let position = ladder_position(PositionStatus::Open, dec!(3));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let mut config = Config::test();
    config.reconcile.thresholds.force_close_unidentified = false;
    let h = harness(config, store.clone());
    h.exchange.set_positions(vec![LivePosition {
        position_id: None,
        ..live("3")
    }]);

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert!(matches!(report.outcome_for(id), Some(PositionOutcome::Skipped { .. })));
    assert_eq!(store.position_count().await, 1);
    assert!(h.history.records().is_empty());
}

#[tokio::test]
async fn test_position_gone_from_listing_closes_as_flat() {
    let position = ladder_position(PositionStatus::Open, dec!(3));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert_eq!(
        report.outcome_for(id),
        Some(&PositionOutcome::Closed { reason: CloseReason::Flat })
    );
    let (title, text) = h.notifier.sent().remove(0);
    assert_eq!(title, "Trade Closed - BTCUSDT");
    assert!(text.contains("no live quantity left"));
}

#[tokio::test]
async fn test_failed_cancel_keeps_record_for_retry() {
    let position = ladder_position(PositionStatus::Open, dec!(3));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_pending_orders(vec![entry("e1")]);
    h.exchange.fail_next(StubOp::Cancel, StubFailure::Transient);

    let report = h.reconciler.try_run_tick().await.unwrap();
    assert!(matches!(report.outcome_for(id), Some(PositionOutcome::Failed { .. })));
    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert!(stored.removal_requested);

    let report = h.reconciler.try_run_tick().await.unwrap();
    assert_eq!(
        report.outcome_for(id),
        Some(&PositionOutcome::Closed { reason: CloseReason::Flat })
    );
    assert_eq!(store.position_count().await, 0);
    assert_eq!(h.notifier.titles().len(), 1);
}

#[tokio::test]
async fn test_locally_closed_position_retires_once_flat() {
    let mut position = ladder_position(PositionStatus::Closed, Decimal::ZERO);
    position.closed_at = Some(chrono::Utc::now());
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert_eq!(
        report.outcome_for(id),
        Some(&PositionOutcome::Closed { reason: CloseReason::Triggered })
    );
    assert_eq!(h.history.records()[0].reason, CloseReason::Triggered);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_lingering_exposure_after_local_close_alerts_once() {
    let mut position = ladder_position(PositionStatus::Closed, Decimal::ZERO);
    position.closed_at = Some(chrono::Utc::now());
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("2.5")]);

    // One tick of lag is tolerated
    h.reconciler.try_run_tick().await.unwrap();
    assert!(h.notifier.sent().is_empty());

    for _ in 0..3 {
        h.reconciler.try_run_tick().await.unwrap();
    }
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Unmanaged Exposure - BTCUSDT");
    assert!(sent[0].1.contains("2.5 still open"));

    // Still tracked, no orders sent for it
    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert!(h.exchange.tpsl_orders().is_empty());

    h.exchange.set_positions(Vec::new());
    let report = h.reconciler.try_run_tick().await.unwrap();
    assert_eq!(
        report.outcome_for(id),
        Some(&PositionOutcome::Closed { reason: CloseReason::Triggered })
    );
}

// =============================================================================
// Tick-level behaviour
// =============================================================================

#[tokio::test]
async fn test_fetch_failure_aborts_tick() {
    let position = ladder_position(PositionStatus::Open, dec!(10));
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("10")]);
    h.exchange.fail_next(StubOp::ListPositions, StubFailure::Transient);

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert!(report.aborted.is_some());
    assert!(report.positions.is_empty());
    assert!(h.exchange.tpsl_orders().is_empty());
    assert_eq!(store.find_by_id(id).await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn test_invalid_record_is_skipped_without_touching_others() {
    let mut broken = ladder_position(PositionStatus::Open, dec!(1));
    broken.allocated_qty_per_level.pop();
    let healthy = ladder_position(PositionStatus::Open, dec!(10));
    let (broken_id, healthy_id) = (broken.id, healthy.id);

    // Bypass insert validation: the record arrives as stored
    let store = Arc::new(MemoryStore::with_positions([broken, healthy]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("10")]);

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert!(matches!(report.outcome_for(broken_id), Some(PositionOutcome::Skipped { .. })));
    assert_eq!(report.outcome_for(healthy_id), Some(&PositionOutcome::Updated));
}

#[tokio::test]
async fn test_record_without_targets_is_skipped() {
    let mut position = ladder_position(PositionStatus::Open, dec!(10));
    position.targets.clear();
    position.allocated_qty_per_level.clear();
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("10")]);

    let report = h.reconciler.try_run_tick().await.unwrap();

    assert!(matches!(report.outcome_for(id), Some(PositionOutcome::Skipped { .. })));
    assert!(h.exchange.tpsl_orders().is_empty());
    assert_eq!(store.find_by_id(id).await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn test_record_without_stop_loss_is_skipped() {
    let mut position = ladder_position(PositionStatus::Open, dec!(10));
    position.stop_loss = None;
    let id = position.id;
    let store = Arc::new(MemoryStore::with_positions([position]));
    let h = harness(Config::test(), store.clone());
    h.exchange.set_positions(vec![live("10")]);

    let report = h.reconciler.try_run_tick().await.unwrap();

    match report.outcome_for(id) {
        Some(PositionOutcome::Skipped { reason }) => assert!(reason.contains("stop-loss")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(h.exchange.tpsl_orders().is_empty());
    assert_eq!(store.position_count().await, 1);
}

/// Exchange whose position listing takes a while.
struct SlowExchange {
    inner: Arc<StubExchange>,
    delay: Duration,
}

#[async_trait]
impl ExchangePort for SlowExchange {
    async fn list_open_positions(&self) -> ExecResult<Vec<LivePosition>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_open_positions().await
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

#[tokio::test]
async fn test_overlapping_tick_is_skipped() {
    let store = Arc::new(MemoryStore::with_positions([ladder_position(PositionStatus::Open, dec!(10))]));
    let stub = Arc::new(StubExchange::new());
    let slow = Arc::new(SlowExchange {
        inner: stub.clone(),
        delay: Duration::from_millis(300),
    });
    let h = Arc::new(harness_with_exchange(Config::test(), store, stub, slow));

    let first = {
        let h = h.clone();
        tokio::spawn(async move { h.reconciler.try_run_tick().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.reconciler.try_run_tick().await.is_none());
    assert!(first.await.unwrap().is_some());
    assert!(h.reconciler.try_run_tick().await.is_some());
}

#[tokio::test]
async fn test_ladder_progress_survives_restart_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("positions.json");
    let position = ladder_position(PositionStatus::Open, dec!(10));
    let id = position.id;

    {
        let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
        store.insert(&position).await.unwrap();
        let h = harness(Config::test(), store);
        h.exchange.set_positions(vec![live("10")]);
        h.reconciler.try_run_tick().await.unwrap();
    }

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let stored = reopened.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.next_level_index, 6);
    assert_eq!(stored.version, 2);
    assert!(stored.sl_placed);
}
