//! Take-profit ladder engine.
//!
//! Pure computation over a [`Position`]: which level is next, how much of the
//! live quantity it still needs, and at what price. The caller performs the
//! exchange call and then feeds the outcome back through
//! [`LadderEngine::apply_submission`] or [`LadderEngine::advance`].
//!
//! # Invariant
//!
//! A planned quantity never exceeds the position's uncommitted headroom
//! (`current_qty - Σ allocated`), so `Σ allocated <= current_qty` holds after
//! every successful submission.

use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rung_domain::{Position, Price, Quantity, Side};

use crate::error::{EngineError, EngineResult};
use crate::schedule::AllocationSchedule;

/// Decimal places used for order quantities.
pub const QTY_SCALE: u32 = 6;

/// Default distance of the limit price past the trigger (0.1%).
pub fn default_limit_offset() -> Decimal {
    Decimal::new(1, 3)
}

// =============================================================================
// Plan
// =============================================================================

/// Reduce-only limit order closing one ladder level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeProfitOrder {
    /// Ladder level (index into `targets`)
    pub level: usize,
    /// Quantity still owed to this level
    pub quantity: Quantity,
    /// Target price that arms the order
    pub trigger_price: Price,
    /// Limit price, offset past the target
    pub limit_price: Price,
}

/// Next thing the ladder wants done for a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderStep {
    /// Every level has been handled
    Exhausted,
    /// Current level already holds its share; move on without an exchange call
    Skip {
        /// Level being skipped
        level: usize,
    },
    /// Submit this order
    Submit(TakeProfitOrder),
}

// =============================================================================
// Engine
// =============================================================================

/// Ladder engine configured with an allocation schedule.
#[derive(Debug, Clone)]
pub struct LadderEngine {
    schedule: AllocationSchedule,
    limit_offset: Decimal,
}

impl LadderEngine {
    /// Create an engine.
    ///
    /// # Errors
    /// `InvalidLadder` unless `0 <= limit_offset < 1`.
    pub fn new(schedule: AllocationSchedule, limit_offset: Decimal) -> EngineResult<Self> {
        if limit_offset < Decimal::ZERO || limit_offset >= Decimal::ONE {
            return Err(EngineError::InvalidLadder(format!(
                "limit offset {} outside [0, 1)",
                limit_offset
            )));
        }
        Ok(Self { schedule, limit_offset })
    }

    pub fn schedule(&self) -> &AllocationSchedule {
        &self.schedule
    }

    /// Quantity level `level` should hold given the current live size.
    pub fn ideal_qty(&self, position: &Position, level: usize) -> Decimal {
        let percent = self.schedule.percent_for(level, position.targets.len());
        position.current_qty * percent / Decimal::ONE_HUNDRED
    }

    /// Outstanding quantity for `level`, capped by headroom and rounded down
    /// to [`QTY_SCALE`] places. Zero or negative means nothing to submit.
    pub fn remaining_for(&self, position: &Position, level: usize) -> Decimal {
        let allocated = position
            .allocated_qty_per_level
            .get(level)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let wanted = self.ideal_qty(position, level) - allocated;
        wanted
            .min(position.headroom())
            .round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero)
    }

    /// Limit price for a take-profit at `target`.
    ///
    /// Long exits sell slightly above the target, short exits buy slightly
    /// below it.
    pub fn limit_price(&self, side: Side, target: Price) -> Price {
        let factor = match side {
            Side::Long => Decimal::ONE + self.limit_offset,
            Side::Short => Decimal::ONE - self.limit_offset,
        };
        Price::new((target.as_decimal() * factor).normalize()).unwrap_or(target)
    }

    /// Decide the next ladder step for `position`.
    pub fn plan(&self, position: &Position) -> LadderStep {
        let level = position.next_level_index;
        let Some(target) = position.targets.get(level).copied() else {
            return LadderStep::Exhausted;
        };

        let remaining = self.remaining_for(position, level);
        match Quantity::new(remaining) {
            Ok(quantity) => LadderStep::Submit(TakeProfitOrder {
                level,
                quantity,
                trigger_price: target,
                limit_price: self.limit_price(position.side, target),
            }),
            Err(_) => LadderStep::Skip { level },
        }
    }

    /// Record an accepted (or duplicate-rejected) submission and advance.
    pub fn apply_submission(position: &mut Position, level: usize, quantity: Decimal) {
        if let Some(slot) = position.allocated_qty_per_level.get_mut(level) {
            *slot += quantity;
        }
        Self::advance(position, level);
    }

    /// Move the pointer past `level`. Never moves it backwards.
    pub fn advance(position: &mut Position, level: usize) {
        position.next_level_index = position.next_level_index.max(level + 1);
    }

    /// Record a market close of `quantity` that fulfilled `level`.
    ///
    /// The live size shrinks immediately; allocations are clamped so the
    /// headroom invariant survives the decrement.
    pub fn apply_market_exit(position: &mut Position, level: usize, quantity: Decimal) {
        position.current_qty = (position.current_qty - quantity).max(Decimal::ZERO);
        Self::apply_submission(position, level, quantity);
        position.clamp_allocations();
    }
}

impl Default for LadderEngine {
    fn default() -> Self {
        Self {
            schedule: AllocationSchedule::standard(),
            limit_offset: default_limit_offset(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rung_domain::{PositionStatus, Symbol};
    use rust_decimal_macros::dec;

    fn open_position(side: Side, qty: Decimal) -> Position {
        let targets = [dec!(100), dec!(110), dec!(120), dec!(130), dec!(140), dec!(150)]
            .into_iter()
            .map(|p| Price::new(p).unwrap())
            .collect();
        let mut position = Position::new(
            Symbol::from_pair("BTCUSDT").unwrap(),
            side,
            targets,
            Some(Price::new(dec!(95)).unwrap()),
            qty,
        );
        position.status = PositionStatus::Open;
        position.current_qty = qty;
        position
    }

    /// Run the ladder to exhaustion, accepting every submission.
    fn drain(engine: &LadderEngine, position: &mut Position) -> Vec<TakeProfitOrder> {
        let mut submitted = Vec::new();
        loop {
            match engine.plan(position) {
                LadderStep::Exhausted => break,
                LadderStep::Skip { level } => LadderEngine::advance(position, level),
                LadderStep::Submit(order) => {
                    LadderEngine::apply_submission(
                        position,
                        order.level,
                        order.quantity.as_decimal(),
                    );
                    submitted.push(order);
                },
            }
        }
        submitted
    }

    #[test]
    fn test_first_level_long() {
        let engine = LadderEngine::default();
        let position = open_position(Side::Long, dec!(10));

        match engine.plan(&position) {
            LadderStep::Submit(order) => {
                assert_eq!(order.level, 0);
                assert_eq!(order.quantity.as_decimal(), dec!(3));
                assert_eq!(order.trigger_price.as_decimal(), dec!(100));
                assert_eq!(order.limit_price.as_decimal(), dec!(100.1));
            },
            other => panic!("Expected submission, got {:?}", other),
        }
    }

    #[test]
    fn test_short_limit_price_is_below_target() {
        let engine = LadderEngine::default();
        let target = Price::new(dec!(100)).unwrap();
        assert_eq!(engine.limit_price(Side::Short, target).as_decimal(), dec!(99.9));
    }

    #[test]
    fn test_full_ladder_allocates_entire_quantity() {
        let engine = LadderEngine::default();
        let mut position = open_position(Side::Long, dec!(10));

        let submitted = drain(&engine, &mut position);
        let quantities: Vec<Decimal> =
            submitted.iter().map(|o| o.quantity.as_decimal()).collect();

        assert_eq!(quantities, vec![dec!(3), dec!(3), dec!(2), dec!(1), dec!(0.5), dec!(0.5)]);
        assert_eq!(position.allocated_total(), dec!(10));
        assert_eq!(position.next_level_index, 6);
    }

    #[test]
    fn test_ladder_is_idempotent_for_unchanged_qty() {
        let engine = LadderEngine::default();
        let mut position = open_position(Side::Long, dec!(10));

        drain(&engine, &mut position);
        let snapshot = position.clone();

        assert_eq!(engine.plan(&position), LadderStep::Exhausted);
        assert!(drain(&engine, &mut position).is_empty());
        assert_eq!(position, snapshot);
    }

    #[test]
    fn test_already_allocated_level_is_skipped() {
        let engine = LadderEngine::default();
        let mut position = open_position(Side::Long, dec!(10));
        position.allocated_qty_per_level[0] = dec!(3);

        assert_eq!(engine.plan(&position), LadderStep::Skip { level: 0 });
    }

    #[test]
    fn test_remaining_capped_by_headroom() {
        let engine = LadderEngine::default();
        let mut position = open_position(Side::Long, dec!(10));
        // Quantity committed elsewhere leaves only 1 unit uncommitted
        position.allocated_qty_per_level[3] = dec!(9);

        assert_eq!(engine.remaining_for(&position, 0), dec!(1));
    }

    #[test]
    fn test_quantities_round_down() {
        let engine = LadderEngine::default();
        let position = open_position(Side::Long, dec!(0.3333337));

        // 30% = 0.10000011 -> 0.1
        assert_eq!(engine.remaining_for(&position, 0), dec!(0.1));
    }

    #[test]
    fn test_allocation_invariant_across_quantities() {
        let engine = LadderEngine::default();
        for qty in [dec!(0.000007), dec!(1), dec!(3.3), dec!(17.123456789), dec!(1000)] {
            let mut position = open_position(Side::Short, qty);
            drain(&engine, &mut position);
            assert!(
                position.allocated_total() <= position.current_qty,
                "allocated {} exceeds live {}",
                position.allocated_total(),
                position.current_qty
            );
        }
    }

    #[test]
    fn test_tiny_position_skips_every_level() {
        let engine = LadderEngine::default();
        let mut position = open_position(Side::Long, dec!(0.000001));

        assert!(drain(&engine, &mut position).is_empty());
        assert_eq!(position.next_level_index, 6);
    }

    #[test]
    fn test_market_exit_shrinks_position() {
        let mut position = open_position(Side::Long, dec!(10));

        LadderEngine::apply_market_exit(&mut position, 0, dec!(3));

        assert_eq!(position.current_qty, dec!(7));
        assert_eq!(position.next_level_index, 1);
        assert!(position.allocated_total() <= position.current_qty);
    }

    #[test]
    fn test_rejects_out_of_range_offset() {
        assert!(LadderEngine::new(AllocationSchedule::standard(), dec!(1)).is_err());
        assert!(LadderEngine::new(AllocationSchedule::standard(), dec!(-0.01)).is_err());
        assert!(LadderEngine::new(AllocationSchedule::standard(), dec!(0.002)).is_ok());
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let mut position = open_position(Side::Long, dec!(10));
        position.next_level_index = 4;
        LadderEngine::advance(&mut position, 1);
        assert_eq!(position.next_level_index, 4);
    }
}
