//! Sequence Allocator
//!
//! Two independent counters persisted in every table file header. The
//! primary counter hands out row identifiers and never moves backwards on
//! its own; the secondary counter is free-form and advanced by callers.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Primary counter value of a fresh table; the first id handed out is 0
pub const PRIMARY_START: i64 = -1;

/// Secondary counter value of a fresh table
pub const SECONDARY_START: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequences {
    pub primary: i64,
    pub secondary: i64,
}

impl Sequences {
    pub const fn initial() -> Self {
        Sequences {
            primary: PRIMARY_START,
            secondary: SECONDARY_START,
        }
    }

    /// Increment the primary counter and return the new value
    pub fn next_primary(&mut self) -> Result<i64> {
        self.primary = self
            .primary
            .checked_add(1)
            .ok_or_else(|| StoreError::OutOfRange("primary sequence exhausted".to_string()))?;
        Ok(self.primary)
    }

    /// Add a signed delta to the secondary counter and return the new value
    pub fn advance_secondary(&mut self, delta: i64) -> Result<i64> {
        self.secondary = self.secondary.checked_add(delta).ok_or_else(|| {
            StoreError::OutOfRange(format!(
                "secondary sequence {} cannot advance by {}",
                self.secondary, delta
            ))
        })?;
        Ok(self.secondary)
    }

    /// Overwrite both counters
    pub fn reset(&mut self, primary: i64, secondary: i64) {
        self.primary = primary;
        self.secondary = secondary;
    }

    /// Raise the primary counter to cover an explicitly chosen id
    pub fn observe(&mut self, id: i64) {
        if id > self.primary {
            self.primary = id;
        }
    }
}

impl Default for Sequences {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_id_is_zero() {
        let mut seq = Sequences::initial();
        assert_eq!(seq.next_primary().unwrap(), 0);
        assert_eq!(seq.next_primary().unwrap(), 1);
        assert_eq!(seq.primary, 1);
    }

    #[test]
    fn test_reset_then_next() {
        let mut seq = Sequences::initial();
        seq.reset(368745, -3287);
        assert_eq!(seq.next_primary().unwrap(), 368746);
        assert_eq!(seq.advance_secondary(1).unwrap(), -3286);
    }

    #[test]
    fn test_overflow_is_out_of_range() {
        let mut seq = Sequences::initial();
        seq.reset(i64::MAX, i64::MIN);
        assert!(seq.next_primary().unwrap_err().is_out_of_range());
        assert!(seq.advance_secondary(-1).unwrap_err().is_out_of_range());
        assert_eq!(seq.primary, i64::MAX);
    }

    #[test]
    fn test_observe_only_raises() {
        let mut seq = Sequences::initial();
        seq.observe(10);
        assert_eq!(seq.primary, 10);
        seq.observe(3);
        assert_eq!(seq.primary, 10);
        assert_eq!(seq.next_primary().unwrap(), 11);
    }

    proptest! {
        #[test]
        fn prop_primary_is_strictly_increasing(n in 1usize..500) {
            let mut seq = Sequences::initial();
            let ids: Vec<i64> = (0..n).map(|_| seq.next_primary().unwrap()).collect();
            prop_assert_eq!(ids, (0..n as i64).collect::<Vec<_>>());
            prop_assert_eq!(seq.primary, n as i64 - 1);
        }
    }
}
