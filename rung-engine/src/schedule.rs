//! Take-profit allocation schedule.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Share of the live quantity assigned to each ladder level, in percent.
///
/// Levels past the end of the schedule split whatever the schedule leaves
/// unassigned (`100 - Σ schedule`, never negative) evenly between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSchedule {
    percents: Vec<Decimal>,
}

impl AllocationSchedule {
    /// Create a schedule from per-level percentages.
    ///
    /// # Errors
    /// `InvalidSchedule` if any entry is negative or the total exceeds 100.
    pub fn new(percents: Vec<Decimal>) -> EngineResult<Self> {
        if let Some(bad) = percents.iter().find(|p| **p < Decimal::ZERO) {
            return Err(EngineError::InvalidSchedule(format!("negative share {}", bad)));
        }
        let total: Decimal = percents.iter().copied().sum();
        if total > Decimal::ONE_HUNDRED {
            return Err(EngineError::InvalidSchedule(format!("shares sum to {}%", total)));
        }
        Ok(Self { percents })
    }

    /// 30/30/20/10/5/5
    pub fn standard() -> Self {
        Self {
            percents: [30, 30, 20, 10, 5, 5].into_iter().map(Decimal::from).collect(),
        }
    }

    /// Parse a comma separated list such as `"30,30,20,10,5,5"`.
    ///
    /// # Errors
    /// `InvalidSchedule` on unparsable entries or an invalid total.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let percents = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                Decimal::from_str(s)
                    .map_err(|_| EngineError::InvalidSchedule(format!("not a number: {}", s)))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Self::new(percents)
    }

    pub fn len(&self) -> usize {
        self.percents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.percents.is_empty()
    }

    /// Percentage for `level` in a ladder of `total_levels` targets.
    pub fn percent_for(&self, level: usize, total_levels: usize) -> Decimal {
        if let Some(share) = self.percents.get(level) {
            return *share;
        }
        if level >= total_levels {
            return Decimal::ZERO;
        }
        let overflow_levels = total_levels.saturating_sub(self.percents.len());
        if overflow_levels == 0 {
            return Decimal::ZERO;
        }
        let assigned: Decimal = self.percents.iter().copied().sum();
        let remainder = (Decimal::ONE_HUNDRED - assigned).max(Decimal::ZERO);
        remainder / Decimal::from(overflow_levels as u64)
    }
}

impl Default for AllocationSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_standard_schedule() {
        let schedule = AllocationSchedule::standard();
        assert_eq!(schedule.len(), 6);
        assert_eq!(schedule.percent_for(0, 6), dec!(30));
        assert_eq!(schedule.percent_for(5, 6), dec!(5));
    }

    #[test]
    fn test_overflow_levels_share_remainder() {
        let schedule = AllocationSchedule::new(vec![dec!(40), dec!(20)]).unwrap();
        // 40% unassigned, split over levels 2..5
        assert_eq!(schedule.percent_for(2, 6), dec!(10));
        assert_eq!(schedule.percent_for(5, 6), dec!(10));
        assert_eq!(schedule.percent_for(6, 6), Decimal::ZERO);
    }

    #[test]
    fn test_overflow_levels_get_nothing_when_schedule_is_full() {
        let schedule = AllocationSchedule::standard();
        assert_eq!(schedule.percent_for(6, 8), Decimal::ZERO);
        assert_eq!(schedule.percent_for(7, 8), Decimal::ZERO);
    }

    #[test]
    fn test_parse() {
        let schedule = AllocationSchedule::parse("30, 30,20,10,5,5").unwrap();
        assert_eq!(schedule, AllocationSchedule::standard());

        assert!(AllocationSchedule::parse("50,60").is_err());
        assert!(AllocationSchedule::parse("10,abc").is_err());
        assert!(AllocationSchedule::parse("-5").is_err());
    }
}
