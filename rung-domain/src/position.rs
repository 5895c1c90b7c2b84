//! Position entity
//!
//! A `Position` is the local master record of one directional exposure on
//! one symbol. It carries the ladder bookkeeping (targets, per-level
//! allocations, pointer) and the lifecycle status that the reconciler and the
//! price monitor both advance.

use crate::value_objects::{DomainError, Price, Side, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Position ID
// =============================================================================

/// Unique identifier for a Position (UUID v7, time ordered)
pub type PositionId = Uuid;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a position
///
/// Transitions only move forward along [`PositionStatus::rank`]. A new signal
/// for the same symbol creates a new record instead of reviving a closed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Entry orders placed, nothing filled yet
    PendingFill,
    /// Some quantity is live on the exchange
    Open,
    /// Record could not be managed (manual intervention)
    Error,
    /// Exposure gone; awaiting retirement from the store
    Closed,
}

impl PositionStatus {
    /// Ordering used to keep transitions forward-only
    pub fn rank(&self) -> u8 {
        match self {
            PositionStatus::PendingFill => 0,
            PositionStatus::Open => 1,
            PositionStatus::Error => 2,
            PositionStatus::Closed => 3,
        }
    }

    /// Get the name of the status for display
    pub fn name(&self) -> &'static str {
        match self {
            PositionStatus::PendingFill => "pending_fill",
            PositionStatus::Open => "open",
            PositionStatus::Error => "error",
            PositionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Position
// =============================================================================

/// Master position record
///
/// # Invariants
/// - at least one target and a stop-loss
/// - `current_qty >= 0`
/// - `allocated_qty_per_level.len() == targets.len()`
/// - `Σ allocated_qty_per_level <= current_qty` (restored by
///   [`Position::clamp_allocations`] whenever the live size shrinks)
/// - `next_level_index <= targets.len()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    pub status: PositionStatus,

    // Sizing
    pub avg_entry_price: Option<Price>,
    /// Planned size across all entry orders
    pub total_qty: Decimal,
    /// Live size as last reported by the exchange (or reduced by a local close)
    pub current_qty: Decimal,

    // Stop-loss
    pub stop_loss: Option<Price>,
    pub sl_placed: bool,

    // Take-profit ladder
    pub targets: Vec<Price>,
    pub allocated_qty_per_level: Vec<Decimal>,
    pub next_level_index: usize,

    /// Entry orders still resting on the exchange at the last reconcile
    pub pending_entry_count: Option<u32>,
    /// Exchange-side position identity, once resolved
    pub exchange_position_id: Option<String>,
    pub removal_requested: bool,

    /// Optimistic concurrency version, bumped by the store on every write
    pub version: u64,
    /// When `current_qty` was last set from an authoritative observation
    pub qty_synced_at: Option<DateTime<Utc>>,

    // Audit
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a new master record awaiting entry fills.
    pub fn new(
        symbol: Symbol,
        side: Side,
        targets: Vec<Price>,
        stop_loss: Option<Price>,
        total_qty: Decimal,
    ) -> Self {
        let now = Utc::now();
        let levels = targets.len();
        Self {
            id: Uuid::now_v7(),
            symbol,
            side,
            status: PositionStatus::PendingFill,
            avg_entry_price: None,
            total_qty,
            current_qty: Decimal::ZERO,
            stop_loss,
            sl_placed: false,
            targets,
            allocated_qty_per_level: vec![Decimal::ZERO; levels],
            next_level_index: 0,
            pending_entry_count: None,
            exchange_position_id: None,
            removal_requested: false,
            version: 0,
            qty_synced_at: None,
            created_at: now,
            last_updated: now,
            closed_at: None,
        }
    }

    /// Check structural invariants.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPosition` describing the first violation.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.targets.is_empty() {
            return Err(DomainError::InvalidPosition("no take-profit targets".to_string()));
        }
        if self.stop_loss.is_none() {
            return Err(DomainError::InvalidPosition("no stop-loss".to_string()));
        }
        if self.current_qty < Decimal::ZERO {
            return Err(DomainError::InvalidPosition(format!(
                "current_qty is negative ({})",
                self.current_qty
            )));
        }
        if self.allocated_qty_per_level.len() != self.targets.len() {
            return Err(DomainError::InvalidPosition(format!(
                "{} targets but {} allocation slots",
                self.targets.len(),
                self.allocated_qty_per_level.len()
            )));
        }
        if self.allocated_qty_per_level.iter().any(|q| *q < Decimal::ZERO) {
            return Err(DomainError::InvalidPosition("negative allocation".to_string()));
        }
        if self.next_level_index > self.targets.len() {
            return Err(DomainError::InvalidPosition(format!(
                "next_level_index {} beyond {} targets",
                self.next_level_index,
                self.targets.len()
            )));
        }
        Ok(())
    }

    /// Pending fill or open.
    pub fn is_active(&self) -> bool {
        matches!(self.status, PositionStatus::PendingFill | PositionStatus::Open)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    /// Sum of quantity already committed to take-profit orders.
    pub fn allocated_total(&self) -> Decimal {
        self.allocated_qty_per_level.iter().copied().sum()
    }

    /// Live quantity not yet committed to any take-profit level.
    pub fn headroom(&self) -> Decimal {
        (self.current_qty - self.allocated_total()).max(Decimal::ZERO)
    }

    /// Target of the level the ladder pointer is on, if any remain.
    pub fn next_target(&self) -> Option<Price> {
        self.targets.get(self.next_level_index).copied()
    }

    /// Move status forward. Returns `true` if it changed.
    pub fn advance_status(&mut self, next: PositionStatus) -> bool {
        if next.rank() > self.status.rank() {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Mark the position closed at `now`.
    pub fn mark_closed(&mut self, now: DateTime<Utc>) {
        self.advance_status(PositionStatus::Closed);
        if self.closed_at.is_none() {
            self.closed_at = Some(now);
        }
        self.last_updated = now;
    }

    /// Restart the ladder after an entry refill.
    pub fn reset_ladder(&mut self) {
        self.next_level_index = 0;
        self.allocated_qty_per_level = vec![Decimal::ZERO; self.targets.len()];
        self.sl_placed = false;
    }

    /// Trim allocations so they never exceed the live quantity.
    ///
    /// Resting take-profit orders fill nearest-first, so the shrinkage is
    /// taken out of the lowest levels. Returns `true` if anything changed.
    pub fn clamp_allocations(&mut self) -> bool {
        let mut excess = self.allocated_total() - self.current_qty;
        if excess <= Decimal::ZERO {
            return false;
        }
        for slot in self.allocated_qty_per_level.iter_mut() {
            if excess <= Decimal::ZERO {
                break;
            }
            let cut = (*slot).min(excess);
            *slot -= cut;
            excess -= cut;
        }
        true
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_updated = now;
    }
}

/// Quantity-weighted average price of a set of entry legs.
///
/// Returns `None` when the legs carry no quantity.
pub fn weighted_entry_price(legs: &[(Price, Decimal)]) -> Option<Price> {
    let total: Decimal = legs.iter().map(|(_, qty)| *qty).sum();
    if total <= Decimal::ZERO {
        return None;
    }
    let notional: Decimal = legs.iter().map(|(price, qty)| price.as_decimal() * *qty).sum();
    Price::new(notional / total).ok()
}

// =============================================================================
// Tests
// =============================================================================
