//! Reconciliation decisions.
//!
//! [`assess`] compares one tracked position with a live exchange snapshot and
//! returns what the lifecycle should do. [`ReconcileDelta`] captures what a
//! reconcile pass changed as a re-appliable mutation, so it can be merged
//! onto a record that another writer touched in the meantime.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rung_domain::{LivePosition, PendingOrder, Position, PositionStatus};

use crate::ladder::LadderEngine;

// =============================================================================
// Thresholds
// =============================================================================

/// Tolerances used when classifying live quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Below this the exposure counts as gone
    pub close_epsilon: Decimal,
    /// At or above this a pending position counts as filled
    pub min_fill_qty: Decimal,
    /// Close positions the exchange no longer identifies
    pub force_close_unidentified: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            close_epsilon: Decimal::new(1, 3),
            min_fill_qty: Decimal::new(1, 4),
            force_close_unidentified: true,
        }
    }
}

// =============================================================================
// Assessment
// =============================================================================

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Live quantity below epsilon with no entries left
    Flat,
    /// Exchange shows size or resting entries but no identity for a
    /// position believed to be live
    Unidentified,
    /// Closed locally by a price trigger, now confirmed flat
    Triggered,
}

/// Lifecycle decision for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Close and schedule removal
    Close(CloseReason),
    /// Already closed locally and the exchange agrees; remove
    Retire,
    /// Closed locally but the exchange still shows size; wait
    AwaitRetire,
    /// Identity missing but forced close is disabled; leave it alone
    Unresolved,
    /// `pending_fill` → `open`
    Activate,
    /// No lifecycle change
    Hold,
}

/// Entry orders filled since the previous reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refill {
    pub previous_pending: u32,
    pub current_pending: u32,
    /// Increase in live size since the last recorded quantity
    pub fill_qty: Decimal,
}

impl Refill {
    pub fn filled_orders(&self) -> u32 {
        self.previous_pending - self.current_pending
    }
}

/// Everything the reconciler needs to know about one position this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub live_qty: Decimal,
    pub identity: Option<String>,
    /// Exchange ids of the resting entry orders
    pub pending_entry_ids: Vec<String>,
    pub lifecycle: Lifecycle,
    pub refill: Option<Refill>,
}

impl Assessment {
    pub fn pending_entry_count(&self) -> u32 {
        u32::try_from(self.pending_entry_ids.len()).unwrap_or(u32::MAX)
    }
}

/// Assess `position` against the live exchange state.
pub fn assess(
    position: &Position,
    live_positions: &[LivePosition],
    pending_orders: &[PendingOrder],
    thresholds: &Thresholds,
) -> Assessment {
    let live = live_positions.iter().find(|p| p.matches(&position.symbol, position.side));
    let identity = live.and_then(|p| p.identity()).map(str::to_string);
    let live_qty = live.map(LivePosition::quantity).unwrap_or(Decimal::ZERO);

    let entries: Vec<&PendingOrder> = pending_orders
        .iter()
        .filter(|o| o.is_unfilled_entry(&position.symbol, position.side))
        .collect();
    let pending_entry_ids: Vec<String> =
        entries.iter().filter_map(|o| o.order_id.clone()).collect();
    let current_pending = u32::try_from(entries.len()).unwrap_or(u32::MAX);

    let is_flat = live_qty < thresholds.close_epsilon;
    let unidentified = identity.is_none()
        && (position.status == PositionStatus::Open || position.current_qty > Decimal::ZERO);

    let lifecycle = if position.is_closed() {
        if is_flat {
            Lifecycle::Retire
        } else {
            Lifecycle::AwaitRetire
        }
    } else if position.is_active() && is_flat && entries.is_empty() {
        // A fully closed position usually drops out of the exchange listing
        Lifecycle::Close(CloseReason::Flat)
    } else if unidentified {
        if thresholds.force_close_unidentified {
            Lifecycle::Close(CloseReason::Unidentified)
        } else {
            Lifecycle::Unresolved
        }
    } else if position.status == PositionStatus::PendingFill && live_qty >= thresholds.min_fill_qty
    {
        Lifecycle::Activate
    } else {
        Lifecycle::Hold
    };

    let previous_pending = position.pending_entry_count.unwrap_or(current_pending);
    let refill = (current_pending < previous_pending && !matches!(lifecycle, Lifecycle::Close(_)))
        .then(|| Refill {
            previous_pending,
            current_pending,
            fill_qty: live_qty - position.current_qty,
        });

    Assessment {
        live_qty,
        identity,
        pending_entry_ids,
        lifecycle,
        refill,
    }
}

// =============================================================================
// Delta
// =============================================================================

/// Changes produced by one reconcile pass over one position.
///
/// Applying a delta is a merge, not an overwrite:
/// - the observed quantity only lands if it is at least as fresh as the
///   record's `qty_synced_at`
/// - ladder submissions add to whatever allocations the record already holds
/// - status only moves forward
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileDelta {
    pub observed_qty: Decimal,
    pub observed_at: DateTime<Utc>,
    pub exchange_position_id: Option<String>,
    pub pending_entry_count: Option<u32>,
    /// `(level, quantity)` accepted this tick
    pub submissions: Vec<(usize, Decimal)>,
    /// Levels passed over without a submission
    pub skipped_to: Option<usize>,
    pub ladder_reset: bool,
    pub sl_placed: bool,
    pub status: Option<PositionStatus>,
    pub removal_requested: bool,
}

impl ReconcileDelta {
    /// Start a delta from a fresh observation.
    pub fn observe(assessment: &Assessment, observed_at: DateTime<Utc>) -> Self {
        Self {
            observed_qty: assessment.live_qty,
            observed_at,
            exchange_position_id: assessment.identity.clone(),
            pending_entry_count: Some(assessment.pending_entry_count()),
            submissions: Vec::new(),
            skipped_to: None,
            ladder_reset: false,
            sl_placed: false,
            status: None,
            removal_requested: false,
        }
    }

    /// Merge the delta into `position`. Returns `true` if any material field
    /// changed; `last_updated` is only bumped in that case.
    pub fn apply(&self, position: &mut Position) -> bool {
        self.merge(position, true)
    }

    /// Merge everything except the observed quantity, which another writer
    /// is in the middle of changing.
    pub fn apply_holding_quantity(&self, position: &mut Position) -> bool {
        self.merge(position, false)
    }

    fn merge(&self, position: &mut Position, take_quantity: bool) -> bool {
        let before = position.clone();

        let fresh = position.qty_synced_at.map_or(true, |synced| self.observed_at >= synced);
        if take_quantity && fresh {
            position.current_qty = self.observed_qty.max(Decimal::ZERO);
            position.qty_synced_at = Some(self.observed_at);
        }

        if let Some(id) = &self.exchange_position_id {
            position.exchange_position_id = Some(id.clone());
        }
        if self.pending_entry_count.is_some() {
            position.pending_entry_count = self.pending_entry_count;
        }

        for (level, quantity) in &self.submissions {
            LadderEngine::apply_submission(position, *level, *quantity);
        }
        if let Some(level) = self.skipped_to {
            LadderEngine::advance(position, level);
        }
        if self.ladder_reset {
            position.reset_ladder();
        }
        if self.sl_placed {
            position.sl_placed = true;
        }

        if let Some(status) = self.status {
            if status == PositionStatus::Closed {
                position.mark_closed(self.observed_at);
            } else {
                position.advance_status(status);
            }
        }
        if self.removal_requested {
            position.removal_requested = true;
        }

        position.clamp_allocations();

        let changed = materially_differs(&before, position);
        if changed {
            position.touch(Utc::now());
        } else {
            // Keep the record byte-identical when nothing material moved
            position.qty_synced_at = before.qty_synced_at;
            position.last_updated = before.last_updated;
        }
        changed
    }
}

/// Compare two records ignoring bookkeeping timestamps and version.
pub fn materially_differs(a: &Position, b: &Position) -> bool {
    a.status != b.status
        || a.current_qty != b.current_qty
        || a.sl_placed != b.sl_placed
        || a.allocated_qty_per_level != b.allocated_qty_per_level
        || a.next_level_index != b.next_level_index
        || a.pending_entry_count != b.pending_entry_count
        || a.exchange_position_id != b.exchange_position_id
        || a.removal_requested != b.removal_requested
        || a.closed_at != b.closed_at
}

// =============================================================================
// Tests
// =============================================================================
