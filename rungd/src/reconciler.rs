//! Reconciliation cycle.
//!
//! Every tick fetches live positions and pending orders once, then walks the
//! tracked positions one by one:
//!
//! ```text
//! assess → close / activate → ladder → refill reset → stop-loss → persist
//! ```
//!
//! Each position is an isolated failure boundary; its result lands in the
//! [`TickReport`]. A failed exchange fetch aborts the whole tick and nothing
//! is written. Ticks never overlap: one that finds the previous still running
//! is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rung_domain::{LivePosition, PendingOrder, Position, PositionId, PositionStatus, Quantity, Side, Symbol};
use rung_engine::{assess, Assessment, CloseReason, LadderEngine, LadderStep, Lifecycle, ReconcileDelta};
use rung_exec::{notify_best_effort, record_best_effort, ClosedPosition, ExecError, TpSlRequest};
use rung_store::Modified;

use crate::coordinator::Coordinator;
use crate::event_bus::DaemonEvent;

// =============================================================================
// Tick report
// =============================================================================

/// What happened to one position during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PositionOutcome {
    /// Nothing material changed
    Unchanged,
    /// Record written
    Updated,
    /// Closed and removed from the store
    Closed { reason: CloseReason },
    /// Left alone this tick
    Skipped { reason: String },
    /// An exchange or store call failed; retried next tick
    Failed { error: String },
}

/// Per-position line of a [`TickReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionReport {
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    #[serde(flatten)]
    pub outcome: PositionOutcome,
}

/// Summary of one reconciliation tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub positions: Vec<PositionReport>,
    /// Records deleted from the store
    pub removed: usize,
    /// Records written
    pub persisted: usize,
    /// Why the tick stopped before looking at any position
    pub aborted: Option<String>,
}

impl TickReport {
    fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            positions: Vec::new(),
            removed: 0,
            persisted: 0,
            aborted: None,
        }
    }

    /// Outcome recorded for `id`, if it was visited.
    pub fn outcome_for(&self, id: PositionId) -> Option<&PositionOutcome> {
        self.positions.iter().find(|r| r.position_id == id).map(|r| &r.outcome)
    }

    pub fn failures(&self) -> usize {
        self.positions
            .iter()
            .filter(|r| matches!(r.outcome, PositionOutcome::Failed { .. }))
            .count()
    }
}

/// Result of reconciling one position.
struct Step {
    outcome: PositionOutcome,
    persisted: bool,
    removed: bool,
}

impl Step {
    fn new(outcome: PositionOutcome) -> Self {
        Self {
            outcome,
            persisted: false,
            removed: false,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self::new(PositionOutcome::Skipped { reason: reason.into() })
    }

    fn failed(error: impl ToString) -> Self {
        Self::new(PositionOutcome::Failed { error: error.to_string() })
    }

    fn persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }
}

// =============================================================================
// Tick guard
// =============================================================================

/// Non-reentrancy flag for the cycle.
#[derive(Debug, Default)]
pub struct TickGuard {
    running: AtomicBool,
}

/// Held while a tick runs; releases the guard on drop.
#[derive(Debug)]
pub struct TickPermit<'a> {
    guard: &'a TickGuard,
}

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a tick is already running.
    pub fn try_acquire(&self) -> Option<TickPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Consecutive ticks a locally closed position may still show size before
/// an operator is alerted.
const LINGERING_TICKS_BEFORE_ALERT: u32 = 2;

/// Periodic reconciliation of the store against the exchange.
pub struct Reconciler {
    ctx: Arc<Coordinator>,
    guard: TickGuard,
    /// Consecutive `AwaitRetire` ticks per position
    lingering: Mutex<HashMap<PositionId, u32>>,
}

impl Reconciler {
    pub fn new(ctx: Arc<Coordinator>) -> Self {
        Self {
            ctx,
            guard: TickGuard::new(),
            lingering: Mutex::new(HashMap::new()),
        }
    }

    /// Run ticks every `interval` until `shutdown` is cancelled.
    ///
    /// A tick in progress when shutdown arrives runs to completion.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.try_run_tick().await;
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Run one tick unless another is in progress.
    pub async fn try_run_tick(&self) -> Option<TickReport> {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!("Previous reconcile tick still running, skipping");
            return None;
        };
        Some(self.tick().await)
    }

    async fn tick(&self) -> TickReport {
        let clock = Instant::now();
        let mut report = TickReport::empty(Utc::now());

        let positions = match self.ctx.store.load().await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "Failed to load positions, aborting tick");
                report.aborted = Some(e.to_string());
                return self.finish(report, clock);
            },
        };
        if positions.is_empty() {
            debug!("No tracked positions");
            return self.finish(report, clock);
        }

        // Captured before the fetch: the snapshot is at least this fresh
        let observed_at = Utc::now();
        let fetched = tokio::try_join!(
            self.ctx.exchange.list_open_positions(),
            self.ctx.exchange.list_pending_orders()
        );
        let (live, pending) = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Exchange fetch failed, aborting tick");
                report.aborted = Some(e.to_string());
                return self.finish(report, clock);
            },
        };

        for position in &positions {
            let step = self.reconcile_position(position, &live, &pending, observed_at).await;
            if step.persisted {
                report.persisted += 1;
            }
            if step.removed {
                report.removed += 1;
            }
            report.positions.push(PositionReport {
                position_id: position.id,
                symbol: position.symbol.clone(),
                side: position.side,
                outcome: step.outcome,
            });
        }

        self.finish(report, clock)
    }

    fn finish(&self, mut report: TickReport, clock: Instant) -> TickReport {
        report.duration = clock.elapsed();

        if report.removed > 0 || report.persisted > 0 {
            self.ctx.event_bus.send(DaemonEvent::PositionsChanged);
        }
        if report.aborted.is_none() {
            info!(
                positions = report.positions.len(),
                persisted = report.persisted,
                removed = report.removed,
                failures = report.failures(),
                duration_ms = report.duration.as_millis() as u64,
                "Reconcile tick completed"
            );
        }
        self.ctx.event_bus.send(DaemonEvent::TickCompleted(report.clone()));
        report
    }

    async fn reconcile_position(
        &self,
        position: &Position,
        live: &[LivePosition],
        pending: &[PendingOrder],
        observed_at: DateTime<Utc>,
    ) -> Step {
        if let Err(e) = position.validate() {
            warn!(position_id = %position.id, symbol = %position.symbol, error = %e, "Invalid record, skipping");
            return Step::skipped(e.to_string());
        }
        if position.status == PositionStatus::Error {
            return Step::skipped("status is error");
        }

        let assessment = assess(position, live, pending, self.ctx.thresholds());
        let mut delta = ReconcileDelta::observe(&assessment, observed_at);
        if !matches!(assessment.lifecycle, Lifecycle::AwaitRetire) {
            self.lingering_ticks(position.id, false);
        }

        match &assessment.lifecycle {
            Lifecycle::Unresolved => {
                warn!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    side = %position.side,
                    "Exchange reports no identity and forced close is disabled"
                );
                return Step::skipped("exchange identity missing");
            },
            Lifecycle::Close(reason) => return self.close(position, delta, &assessment, *reason).await,
            Lifecycle::Retire => {
                let reason = if position.removal_requested {
                    CloseReason::Flat
                } else {
                    CloseReason::Triggered
                };
                return self.retire(position, &assessment.pending_entry_ids, reason, false).await;
            },
            Lifecycle::AwaitRetire => {
                warn!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    live_qty = %assessment.live_qty,
                    "Closed locally but the exchange still shows size"
                );
                if self.lingering_ticks(position.id, true) == LINGERING_TICKS_BEFORE_ALERT {
                    let title = format!("Unmanaged Exposure - {}", position.symbol);
                    let text = format!(
                        "{} {} closed locally but {} still open on the exchange",
                        position.symbol,
                        position.side,
                        assessment.live_qty.normalize()
                    );
                    notify_best_effort(self.ctx.notifier.as_ref(), &title, &text).await;
                }
            },
            Lifecycle::Activate => {
                info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    live_qty = %assessment.live_qty,
                    "Entry filled, position open"
                );
                delta.status = Some(PositionStatus::Open);
            },
            Lifecycle::Hold => {},
        }

        // Project the observation so the ladder plans against live size
        let mut working = position.clone();
        delta.apply(&mut working);

        let mut failure: Option<String> = None;
        let identity = assessment.identity.as_deref();
        // A monitor exit in flight owns the size until it is recorded
        let exiting = self.ctx.exit_in_flight(position.id);
        if exiting {
            debug!(position_id = %position.id, "Monitor exit in flight, leaving orders for next tick");
        }
        let tpsl = self.ctx.tpsl_enabled() && !exiting;

        if let Some(identity) = identity.filter(|_| tpsl && working.is_open()) {
            if let Err(e) = self.submit_ladder(&mut working, &mut delta, identity).await {
                failure = Some(e.to_string());
            }
        }

        if let Some(refill) = &assessment.refill {
            info!(
                position_id = %position.id,
                symbol = %position.symbol,
                filled_orders = refill.filled_orders(),
                fill_qty = %refill.fill_qty,
                "Entry refill detected, rebuilding ladder"
            );
            delta.ladder_reset = true;
            working.reset_ladder();
        }

        if let Some(identity) = identity.filter(|_| tpsl) {
            if let Err(e) = self.place_stop_loss(&working, &mut delta, identity).await {
                if failure.is_none() {
                    failure = Some(e.to_string());
                }
            }
        }

        let written = match self.ctx.modify(position.id, |p| self.merge(&delta, p)).await {
            Ok(Modified::Updated(_)) => true,
            Ok(Modified::Unchanged(_)) => false,
            Ok(Modified::Missing) => return Step::skipped("removed concurrently"),
            Err(e) => {
                error!(position_id = %position.id, error = %e, "Failed to persist reconcile delta");
                return Step::failed(e);
            },
        };

        if let (Some(refill), true) = (&assessment.refill, written) {
            let text = format!(
                "{} {}: {} entry order(s) filled (+{}), ladder rebuilt",
                position.symbol,
                position.side,
                refill.filled_orders(),
                refill.fill_qty.normalize()
            );
            notify_best_effort(self.ctx.notifier.as_ref(), "Ladder Executed", &text).await;
            self.ctx.event_bus.send(DaemonEvent::LadderRebuilt {
                position_id: position.id,
                symbol: position.symbol.clone(),
                fill_qty: refill.fill_qty,
            });
        }

        let outcome = match failure {
            Some(error) => PositionOutcome::Failed { error },
            None if written => PositionOutcome::Updated,
            None => PositionOutcome::Unchanged,
        };
        Step::new(outcome).persisted(written)
    }

    /// Merge `delta` onto the latest record. The observed size is held back
    /// while a monitor exit on the position is between order and write.
    fn merge(&self, delta: &ReconcileDelta, position: &mut Position) -> bool {
        if self.ctx.exit_in_flight(position.id) {
            delta.apply_holding_quantity(position)
        } else {
            delta.apply(position)
        }
    }

    /// Count one more lingering tick for `id`, or forget it. Returns the
    /// count after the update.
    fn lingering_ticks(&self, id: PositionId, lingering: bool) -> u32 {
        let mut counts = self.lingering.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if lingering {
            let count = counts.entry(id).or_insert(0);
            *count += 1;
            *count
        } else {
            counts.remove(&id);
            0
        }
    }

    /// Walk the ladder from the pointer until it is exhausted or a
    /// submission fails.
    async fn submit_ladder(
        &self,
        working: &mut Position,
        delta: &mut ReconcileDelta,
        identity: &str,
    ) -> Result<(), ExecError> {
        loop {
            match self.ctx.ladder().plan(working) {
                LadderStep::Exhausted => return Ok(()),
                LadderStep::Skip { level } => {
                    debug!(position_id = %working.id, level, "Level already covered");
                    LadderEngine::advance(working, level);
                    delta.skipped_to = Some(level);
                },
                LadderStep::Submit(order) => {
                    let request =
                        TpSlRequest::take_profit(working.symbol.clone(), identity.to_string(), &order);
                    match self.ctx.exchange.place_tpsl_order(&request).await {
                        Ok(ack) => {
                            info!(
                                position_id = %working.id,
                                symbol = %working.symbol,
                                level = order.level,
                                quantity = %order.quantity,
                                trigger = %order.trigger_price,
                                limit = %order.limit_price,
                                order_id = %ack.order_id,
                                "Take-profit placed"
                            );
                        },
                        Err(e) if e.is_expected_rejection() => {
                            warn!(
                                position_id = %working.id,
                                level = order.level,
                                error = %e,
                                "Take-profit already on the book"
                            );
                        },
                        Err(e) => {
                            error!(
                                position_id = %working.id,
                                symbol = %working.symbol,
                                level = order.level,
                                error = %e,
                                "Take-profit placement failed"
                            );
                            return Err(e);
                        },
                    }
                    let quantity = order.quantity.as_decimal();
                    LadderEngine::apply_submission(working, order.level, quantity);
                    delta.submissions.push((order.level, quantity));
                },
            }
        }
    }

    async fn place_stop_loss(
        &self,
        working: &Position,
        delta: &mut ReconcileDelta,
        identity: &str,
    ) -> Result<(), ExecError> {
        if working.sl_placed || working.is_closed() || working.current_qty <= Decimal::ZERO {
            return Ok(());
        }
        let Some(stop) = working.stop_loss else {
            return Ok(());
        };

        let quantity = Quantity::new(working.current_qty)?;
        let request = TpSlRequest::stop_loss(working.symbol.clone(), identity.to_string(), stop, quantity);
        match self.ctx.exchange.place_tpsl_order(&request).await {
            Ok(ack) => {
                info!(
                    position_id = %working.id,
                    symbol = %working.symbol,
                    stop = %stop,
                    quantity = %quantity,
                    order_id = %ack.order_id,
                    "Stop-loss placed"
                );
            },
            Err(e) if e.is_expected_rejection() => {
                warn!(position_id = %working.id, error = %e, "Stop-loss already on the book");
            },
            Err(e) => {
                error!(position_id = %working.id, symbol = %working.symbol, error = %e, "Stop-loss placement failed");
                return Err(e);
            },
        }
        delta.sl_placed = true;
        Ok(())
    }

    /// Close transition: persist `closed`, announce it, then retire.
    async fn close(
        &self,
        position: &Position,
        mut delta: ReconcileDelta,
        assessment: &Assessment,
        reason: CloseReason,
    ) -> Step {
        match reason {
            CloseReason::Unidentified => warn!(
                position_id = %position.id,
                symbol = %position.symbol,
                side = %position.side,
                current_qty = %position.current_qty,
                "Exchange no longer identifies position, forcing close"
            ),
            _ => info!(
                position_id = %position.id,
                symbol = %position.symbol,
                side = %position.side,
                live_qty = %assessment.live_qty,
                "Position flat, closing"
            ),
        }

        delta.status = Some(PositionStatus::Closed);
        delta.removal_requested = true;

        let (stored, written) = match self.ctx.modify(position.id, |p| self.merge(&delta, p)).await {
            Ok(Modified::Updated(p)) => (p, true),
            Ok(Modified::Unchanged(p)) => (p, false),
            Ok(Modified::Missing) => return Step::skipped("removed concurrently"),
            Err(e) => {
                error!(position_id = %position.id, error = %e, "Failed to persist close");
                return Step::failed(e);
            },
        };

        let title = format!("Trade Closed - {}", position.symbol);
        let text = format!("{} {} closed ({})", position.symbol, position.side, describe(reason));
        notify_best_effort(self.ctx.notifier.as_ref(), &title, &text).await;

        self.retire(&stored, &assessment.pending_entry_ids, reason, written).await
    }

    /// Cancel leftover entries, archive the record and delete it.
    async fn retire(
        &self,
        position: &Position,
        pending_entry_ids: &[String],
        reason: CloseReason,
        persisted: bool,
    ) -> Step {
        if !pending_entry_ids.is_empty() {
            match self.ctx.exchange.cancel_orders(&position.symbol, pending_entry_ids).await {
                Ok(outcome) if outcome.all_succeeded() => {
                    info!(
                        position_id = %position.id,
                        symbol = %position.symbol,
                        cancelled = outcome.succeeded.len(),
                        "Cancelled stale entry orders"
                    );
                },
                Ok(outcome) => {
                    warn!(
                        position_id = %position.id,
                        symbol = %position.symbol,
                        failed = ?outcome.failed,
                        "Some entry orders could not be cancelled"
                    );
                    return Step::failed(format!("{} entry order(s) not cancelled", outcome.failed.len()))
                        .persisted(persisted);
                },
                Err(e) => {
                    error!(position_id = %position.id, error = %e, "Failed to cancel entry orders");
                    return Step::failed(e).persisted(persisted);
                },
            }
        }

        let record = ClosedPosition {
            position: position.clone(),
            reason,
            retired_at: Utc::now(),
        };
        record_best_effort(self.ctx.history.as_ref(), &record).await;

        match self.ctx.remove_closed(position.id).await {
            Ok(true) => {
                self.lingering_ticks(position.id, false);
                info!(position_id = %position.id, symbol = %position.symbol, ?reason, "Position retired");
                self.ctx.event_bus.send(DaemonEvent::PositionClosed {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    reason,
                });
                Step {
                    outcome: PositionOutcome::Closed { reason },
                    persisted,
                    removed: true,
                }
            },
            Ok(false) => Step::skipped("already retired").persisted(persisted),
            Err(e) => {
                error!(position_id = %position.id, error = %e, "Failed to remove closed position");
                Step::failed(e).persisted(persisted)
            },
        }
    }
}

fn describe(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::Flat => "no live quantity left",
        CloseReason::Unidentified => "exchange lost track of the position",
        CloseReason::Triggered => "closed by price trigger",
    }
}

// =============================================================================
// Tests
// =============================================================================
