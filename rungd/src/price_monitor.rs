//! Price Monitor: evaluates exit triggers on the live price stream.
//!
//! Keeps a cache of open positions grouped by symbol and holds one price
//! subscription per cached symbol. On every tick the cached positions of that
//! symbol are checked against their stop and next target; a trigger is
//! dispatched as a background task so the stream is never blocked on the
//! exchange.
//!
//! # Architecture
//!
//! ```text
//! Store ──refresh──▶ cache ──symbols──▶ MarketDataPort
//!                      │                     │
//!                      ▼                     ▼ ticks
//!               evaluate_tick ◀──────── price channel
//!                      │
//!                      ▼
//!          TaskTracker: market close → modify → notify
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use rung_domain::{Position, PositionId, Price, Symbol};
use rung_engine::{evaluate_tick, CloseReason, LadderEngine, Trigger};
use rung_exec::{notify_best_effort, OrderRequest, PriceUpdate};
use rung_store::Modified;

use crate::coordinator::Coordinator;
use crate::error::DaemonResult;
use crate::event_bus::DaemonEvent;

/// Buffer of the merged price channel.
const PRICE_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// State
// =============================================================================

/// Mutable state owned by the monitor loop.
#[derive(Default)]
struct MonitorState {
    /// Open, non-empty positions by symbol
    cache: HashMap<Symbol, Vec<Position>>,
    /// Forwarder task per subscribed symbol
    feeds: HashMap<Symbol, JoinHandle<()>>,
    /// Last trigger per position
    last_trigger: HashMap<PositionId, Instant>,
}

// =============================================================================
// Price Monitor
// =============================================================================

/// Streaming trigger evaluator.
pub struct PriceMonitor {
    ctx: Arc<Coordinator>,
}

impl PriceMonitor {
    pub fn new(ctx: Arc<Coordinator>) -> Self {
        Self { ctx }
    }

    /// Run until the coordinator's shutdown token is cancelled.
    ///
    /// Trigger executions already dispatched keep running on the
    /// coordinator's task tracker.
    pub async fn run(self) {
        let (price_tx, mut price_rx) = mpsc::channel::<PriceUpdate>(PRICE_CHANNEL_CAPACITY);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<PositionId>();
        let mut events = self.ctx.event_bus.subscribe();
        let mut state = MonitorState::default();

        let mut refresh = tokio::time::interval(self.ctx.monitor_refresh());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            debounce_ms = self.ctx.debounce().as_millis() as u64,
            refresh_secs = self.ctx.monitor_refresh().as_secs(),
            "Price monitor started"
        );

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    info!("Price monitor received shutdown signal");
                    break;
                }
                Some(event_result) = events.recv() => {
                    match event_result {
                        Ok(DaemonEvent::PositionsChanged)
                        | Ok(DaemonEvent::PositionClosed { .. })
                        | Ok(DaemonEvent::LadderRebuilt { .. }) => {
                            self.refresh_logged(&mut state, &price_tx).await;
                        }
                        Ok(DaemonEvent::Shutdown) => {
                            info!("Price monitor received shutdown event");
                            break;
                        }
                        Ok(DaemonEvent::TickCompleted(_)) => {}
                        Err(lag_msg) => {
                            warn!(%lag_msg, "Price monitor event receiver lagged");
                            self.refresh_logged(&mut state, &price_tx).await;
                        }
                    }
                }
                _ = refresh.tick() => {
                    self.refresh_logged(&mut state, &price_tx).await;
                }
                Some(position_id) = done_rx.recv() => {
                    debug!(%position_id, "Trigger execution finished");
                    self.refresh_logged(&mut state, &price_tx).await;
                }
                Some(update) = price_rx.recv() => {
                    self.on_price(&mut state, &update, &done_tx);
                }
            }
        }

        for (symbol, feed) in state.feeds.drain() {
            feed.abort();
            if let Err(e) = self.ctx.market_data.unsubscribe(&symbol).await {
                debug!(symbol = %symbol, error = %e, "Unsubscribe on shutdown failed");
            }
        }
        info!("Price monitor stopped");
    }

    async fn refresh_logged(&self, state: &mut MonitorState, price_tx: &mpsc::Sender<PriceUpdate>) {
        if let Err(e) = self.refresh(state, price_tx).await {
            error!(error = %e, "Failed to refresh price monitor cache");
        }
    }

    /// Reload the cache from the store and align subscriptions with it.
    async fn refresh(&self, state: &mut MonitorState, price_tx: &mpsc::Sender<PriceUpdate>) -> DaemonResult<()> {
        let positions = self.ctx.store.load().await?;

        let mut cache: HashMap<Symbol, Vec<Position>> = HashMap::new();
        for position in positions.into_iter().filter(is_watchable) {
            cache.entry(position.symbol.clone()).or_default().push(position);
        }

        let stale: Vec<Symbol> = state.feeds.keys().filter(|s| !cache.contains_key(*s)).cloned().collect();
        for symbol in stale {
            if let Some(feed) = state.feeds.remove(&symbol) {
                feed.abort();
            }
            match self.ctx.market_data.unsubscribe(&symbol).await {
                Ok(()) => info!(symbol = %symbol, "Unsubscribed, no open positions left"),
                Err(e) => warn!(symbol = %symbol, error = %e, "Unsubscribe failed"),
            }
        }

        for symbol in cache.keys() {
            if state.feeds.contains_key(symbol) {
                continue;
            }
            match self.ctx.market_data.subscribe(symbol).await {
                Ok(mut rx) => {
                    let tx = price_tx.clone();
                    let feed = tokio::spawn(async move {
                        while let Some(update) = rx.recv().await {
                            if tx.send(update).await.is_err() {
                                break;
                            }
                        }
                    });
                    state.feeds.insert(symbol.clone(), feed);
                    info!(symbol = %symbol, "Subscribed to price updates");
                },
                // Retried on the next refresh
                Err(e) => warn!(symbol = %symbol, error = %e, "Subscribe failed"),
            }
        }

        let live: HashSet<PositionId> = cache.values().flatten().map(|p| p.id).collect();
        state.last_trigger.retain(|id, _| live.contains(id));
        state.cache = cache;

        debug!(
            symbols = state.cache.len(),
            positions = live.len(),
            "Price monitor cache refreshed"
        );
        Ok(())
    }

    /// Evaluate one tick against every cached position of its symbol.
    fn on_price(&self, state: &mut MonitorState, update: &PriceUpdate, done_tx: &mpsc::UnboundedSender<PositionId>) {
        let Some(positions) = state.cache.get(&update.symbol) else {
            return;
        };
        let now = Instant::now();
        let debounce = self.ctx.debounce();

        for position in positions {
            if self.ctx.exit_in_flight(position.id) {
                continue;
            }
            if let Some(last) = state.last_trigger.get(&position.id) {
                if now.duration_since(*last) < debounce {
                    continue;
                }
            }
            let Some(trigger) = evaluate_tick(position, update.price, self.ctx.ladder()) else {
                continue;
            };
            let Some(claim) = self.ctx.claim_exit(position.id) else {
                continue;
            };

            info!(
                position_id = %position.id,
                symbol = %position.symbol,
                trigger = trigger.label(),
                price = %update.price,
                quantity = %trigger.quantity(),
                "Price trigger fired"
            );
            state.last_trigger.insert(position.id, now);

            let ctx = self.ctx.clone();
            let position = position.clone();
            let price = update.price;
            let done_tx = done_tx.clone();
            self.ctx.tasks.spawn(async move {
                execute_trigger(&ctx, position, trigger, price).await;
                let position_id = claim.position_id();
                drop(claim);
                let _ = done_tx.send(position_id);
            });
        }
    }
}

/// Positions the monitor watches.
fn is_watchable(position: &Position) -> bool {
    position.is_open() && position.current_qty > rust_decimal::Decimal::ZERO
}

/// Market-close the triggered quantity and record it.
async fn execute_trigger(ctx: &Coordinator, position: Position, trigger: Trigger, tick_price: Price) {
    let request = OrderRequest::market_close(position.symbol.clone(), position.side, trigger.quantity());
    let ack = match ctx.exchange.place_order(&request).await {
        Ok(ack) => ack,
        Err(e) => {
            error!(
                position_id = %position.id,
                symbol = %position.symbol,
                trigger = trigger.label(),
                error = %e,
                "Trigger close failed"
            );
            return;
        },
    };
    let acked_at = Utc::now();
    let fill_price = ack.price.unwrap_or(tick_price);
    let quantity = trigger.quantity().as_decimal();

    let result = match &trigger {
        Trigger::StopLoss { .. } => {
            ctx.modify(position.id, |p| {
                p.current_qty = rust_decimal::Decimal::ZERO;
                p.qty_synced_at = Some(acked_at);
                p.clamp_allocations();
                p.mark_closed(acked_at);
                true
            })
            .await
        },
        Trigger::TakeProfit { level, .. } => {
            // The claim keeps reconcile from writing the quantity, so the
            // relative decrement is the only change to it
            let level = *level;
            ctx.modify(position.id, |p| {
                if p.is_closed() {
                    return false;
                }
                LadderEngine::apply_market_exit(p, level, quantity);
                p.qty_synced_at = Some(acked_at);
                p.touch(acked_at);
                true
            })
            .await
        },
    };

    match result {
        Ok(Modified::Updated(stored)) => {
            info!(
                position_id = %stored.id,
                symbol = %stored.symbol,
                trigger = trigger.label(),
                order_id = %ack.order_id,
                remaining_qty = %stored.current_qty,
                "Trigger close recorded"
            );
        },
        Ok(Modified::Unchanged(_)) | Ok(Modified::Missing) => {
            warn!(position_id = %position.id, "Position changed before the trigger close could be recorded");
        },
        Err(e) => {
            // The exchange side is done; the next reconcile tick resyncs the quantity
            error!(position_id = %position.id, error = %e, "Failed to record trigger close");
        },
    }

    match trigger {
        Trigger::StopLoss { .. } => {
            let text = format!("{} fully closed @ {}", position.symbol, fill_price);
            notify_best_effort(ctx.notifier.as_ref(), "SL Hit", &text).await;
            ctx.event_bus.send(DaemonEvent::PositionClosed {
                position_id: position.id,
                symbol: position.symbol.clone(),
                reason: CloseReason::Triggered,
            });
        },
        Trigger::TakeProfit { .. } => {
            let text = format!("{} closed {} @ {}", position.symbol, quantity.normalize(), fill_price);
            notify_best_effort(ctx.notifier.as_ref(), "TP Hit", &text).await;
        },
    }
}
