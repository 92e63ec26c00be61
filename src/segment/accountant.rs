//! Byte accounting against a fixed segment budget.

use crate::error::{PilumError, Result};

/// Tracks bytes consumed by buffered rows.
///
/// `consumed` never exceeds `budget`: [`MemoryAccountant::charge`] refuses any
/// charge that would cross it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAccountant {
    budget: usize,
    consumed: usize,
}

impl MemoryAccountant {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            consumed: 0,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn remaining(&self) -> usize {
        self.budget - self.consumed
    }

    /// True when not even one row of `row_bytes` fits.
    pub fn is_full(&self, row_bytes: usize) -> bool {
        self.remaining() < row_bytes
    }

    /// Whole rows of `row_bytes` that fit in the remaining budget (floor).
    pub fn admissible_rows(&self, row_bytes: usize) -> usize {
        if row_bytes == 0 {
            return 0;
        }
        self.remaining() / row_bytes
    }

    pub fn charge(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.remaining() {
            return Err(PilumError::invalid_operation(format!(
                "charge of {bytes} bytes exceeds remaining budget {}",
                self.remaining()
            )));
        }
        self.consumed += bytes;
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        self.consumed = self.consumed.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_admission() {
        let accountant = MemoryAccountant::new(1000);
        assert_eq!(accountant.admissible_rows(512), 1);
        assert_eq!(accountant.admissible_rows(333), 3);
        assert_eq!(accountant.admissible_rows(1001), 0);
        assert_eq!(accountant.admissible_rows(0), 0);
    }

    #[test]
    fn test_charge_and_release() {
        let mut accountant = MemoryAccountant::new(1000);
        accountant.charge(512).unwrap();
        assert_eq!(accountant.remaining(), 488);
        assert!(accountant.is_full(512));
        assert!(!accountant.is_full(488));

        assert!(accountant.charge(489).is_err());
        assert_eq!(accountant.consumed(), 512);

        accountant.release(512);
        assert_eq!(accountant.consumed(), 0);
        accountant.release(1);
        assert_eq!(accountant.consumed(), 0);
    }

    #[test]
    fn test_budget_never_exceeded() {
        let mut accountant = MemoryAccountant::new(1000);
        for row in [1usize, 7, 64, 512, 999, 1000] {
            let rows = accountant.admissible_rows(row);
            accountant.charge(rows * row).unwrap();
            assert!(accountant.consumed() <= accountant.budget());
            accountant.release(accountant.consumed());
        }
    }
}
