//! Price-trigger evaluation for the streaming monitor.

use rust_decimal::Decimal;

use rung_domain::{Position, Price, Quantity};

use crate::ladder::LadderEngine;

/// Exit the monitor should execute for a price tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Stop crossed: close everything
    StopLoss { quantity: Quantity, stop: Price },
    /// Next target crossed: close that level's outstanding share
    TakeProfit { level: usize, quantity: Quantity, target: Price },
}

impl Trigger {
    pub fn quantity(&self) -> Quantity {
        match self {
            Trigger::StopLoss { quantity, .. } | Trigger::TakeProfit { quantity, .. } => *quantity,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Trigger::StopLoss { .. } => "SL",
            Trigger::TakeProfit { .. } => "TP",
        }
    }
}

/// Evaluate a last-price tick against an open position.
///
/// The stop is checked first; a tick that crosses both only closes once.
/// Take-profit fires only while the current level still has unallocated
/// quantity, so a level already resting on the exchange is left to it.
pub fn evaluate_tick(position: &Position, price: Price, ladder: &LadderEngine) -> Option<Trigger> {
    if !position.is_open() || position.current_qty <= Decimal::ZERO {
        return None;
    }
    let last = price.as_decimal();

    if let Some(stop) = position.stop_loss {
        if position.side.reached_adversely(last, stop.as_decimal()) {
            let quantity = Quantity::new(position.current_qty).ok()?;
            return Some(Trigger::StopLoss { quantity, stop });
        }
    }

    let level = position.next_level_index;
    let target = position.next_target()?;
    if !position.side.reached_favorably(last, target.as_decimal()) {
        return None;
    }
    let quantity = Quantity::new(ladder.remaining_for(position, level)).ok()?;
    Some(Trigger::TakeProfit { level, quantity, target })
}
