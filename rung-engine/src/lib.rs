//! Rung Engine Layer
//!
//! Pure decision logic, deterministic, no I/O.
//! Takes a position plus exchange observations → returns what to do.
//!
//! - [`ladder`]: take-profit ladder planning and bookkeeping
//! - [`reconcile`]: per-position lifecycle assessment and mergeable deltas
//! - [`trigger`]: last-price trigger evaluation
//! - [`schedule`]: allocation schedule

#![warn(clippy::all)]

pub mod error;
pub mod ladder;
pub mod reconcile;
pub mod schedule;
pub mod trigger;

pub use error::{EngineError, EngineResult};
pub use ladder::{default_limit_offset, LadderEngine, LadderStep, TakeProfitOrder, QTY_SCALE};
pub use reconcile::{
    assess, materially_differs, Assessment, CloseReason, Lifecycle, ReconcileDelta, Refill,
    Thresholds,
};
pub use schedule::AllocationSchedule;
pub use trigger::{evaluate_tick, Trigger};
