//! # Slot Banks
//!
//! Allocation of hardware debug-register slots.
//!
//! CPUs expose a small, fixed number of debug registers per kind (four on
//! x86-64: DR0-DR3; between two and sixteen on ARM64). Execution breakpoints
//! and data watchpoints are programmed through separate register sets, so each
//! kind gets its own [`SlotBank`] with its own limit.

use std::collections::BTreeSet;

/// Fixed-size bank of hardware slots
///
/// Slots are handed out lowest-first: [`SlotBank::first_free`] always returns
/// the smallest index not currently claimed, so a released slot is the next
/// one reused.
///
/// ```rust
/// use holdfast_core::stoppoints::SlotBank;
///
/// let mut bank = SlotBank::new(2);
/// assert_eq!(bank.first_free(), Some(0));
/// bank.claim(0);
/// bank.claim(1);
/// assert_eq!(bank.first_free(), None);
/// bank.release(0);
/// assert_eq!(bank.first_free(), Some(0));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBank
{
    limit: usize,
    used: BTreeSet<usize>,
}

impl SlotBank
{
    /// Create an empty bank with `limit` slots.
    #[must_use]
    pub fn new(limit: usize) -> Self
    {
        Self {
            limit,
            used: BTreeSet::new(),
        }
    }

    /// Number of slots the hardware exposes.
    #[must_use]
    pub fn limit(&self) -> usize
    {
        self.limit
    }

    /// Number of slots currently claimed.
    #[must_use]
    pub fn in_use(&self) -> usize
    {
        self.used.len()
    }

    /// Smallest unclaimed slot, or `None` when the bank is full.
    #[must_use]
    pub fn first_free(&self) -> Option<usize>
    {
        (0..self.limit).find(|slot| !self.used.contains(slot))
    }

    /// Mark `slot` as in use.
    pub fn claim(&mut self, slot: usize)
    {
        self.used.insert(slot);
    }

    /// Return `slot` to the bank. Releasing an unclaimed slot is a no-op.
    pub fn release(&mut self, slot: usize)
    {
        self.used.remove(&slot);
    }

    /// Release every slot.
    pub fn reset(&mut self)
    {
        self.used.clear();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_first_free_fills_gaps()
    {
        let mut bank = SlotBank::new(4);
        bank.claim(0);
        bank.claim(2);
        assert_eq!(bank.first_free(), Some(1));
        bank.claim(1);
        assert_eq!(bank.first_free(), Some(3));
        assert_eq!(bank.in_use(), 3);
    }

    #[test]
    fn test_zero_sized_bank_is_always_full()
    {
        let bank = SlotBank::new(0);
        assert_eq!(bank.first_free(), None);
    }
}
