//! RAM budget for resident blocks.
//!
//! The budget is a soft ceiling: reservations fail once the ceiling is
//! reached and the caller is expected to evict clean, unreferenced blocks
//! and retry. A sticky floor (about 5 % of the budget) is never reclaimed
//! by eviction pressure, which keeps a hot core of blocks resident and the
//! steady-state allocation churn low.

use std::sync::Mutex;

/// Byte-accounting for RAM-resident blocks.
pub struct RamBudget {
    capacity: u64,
    sticky: u64,
    used: Mutex<u64>,
}

impl RamBudget {
    /// Creates a budget with a sticky floor of one twentieth of the
    /// capacity.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            sticky: capacity / 20,
            used: Mutex::new(0),
        }
    }

    /// Total budget in bytes.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes the eviction pass must leave resident.
    #[must_use]
    pub const fn sticky_bytes(&self) -> u64 {
        self.sticky
    }

    /// Bytes currently accounted.
    #[must_use]
    pub fn used(&self) -> u64 {
        *self.used.lock().expect("ram budget lock poisoned")
    }

    /// Tries to reserve `bytes`; fails when the ceiling would be crossed.
    #[must_use]
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut used = self.used.lock().expect("ram budget lock poisoned");
        if *used + bytes > self.capacity {
            return false;
        }
        *used += bytes;
        true
    }

    /// Returns `bytes` to the budget.
    pub fn release(&self, bytes: u64) {
        let mut used = self.used.lock().expect("ram budget lock poisoned");
        *used = used.saturating_sub(bytes);
    }

    /// True when an eviction pass is allowed to drop a block: eviction
    /// stops at the sticky floor.
    #[must_use]
    pub fn may_evict(&self, bytes: u64) -> bool {
        let used = self.used.lock().expect("ram budget lock poisoned");
        used.saturating_sub(bytes) >= self.sticky || *used > self.capacity
    }

    /// True when prefetching should pause: less than one `block` of head
    /// room remains.
    #[must_use]
    pub fn is_tight(&self, block: u64) -> bool {
        let used = self.used.lock().expect("ram budget lock poisoned");
        *used + block > self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_up_to_capacity() {
        let budget = RamBudget::new(100);
        assert!(budget.try_reserve(60));
        assert!(budget.try_reserve(40));
        assert!(!budget.try_reserve(1));
        assert_eq!(budget.used(), 100);
    }

    #[test]
    fn release_returns_headroom() {
        let budget = RamBudget::new(100);
        assert!(budget.try_reserve(100));
        budget.release(30);
        assert!(budget.try_reserve(30));
        assert!(!budget.try_reserve(1));
    }

    #[test]
    fn sticky_floor_blocks_eviction() {
        let budget = RamBudget::new(100); // sticky = 5
        assert!(budget.try_reserve(10));
        assert!(budget.may_evict(5));
        // Dropping below the sticky floor is refused.
        budget.release(4);
        assert!(!budget.may_evict(5));
    }

    #[test]
    fn tightness_signals_prefetch_pause() {
        let budget = RamBudget::new(100);
        assert!(!budget.is_tight(50));
        assert!(budget.try_reserve(80));
        assert!(budget.is_tight(50));
        assert!(!budget.is_tight(20));
    }

    #[test]
    fn release_never_underflows() {
        let budget = RamBudget::new(10);
        budget.release(100);
        assert_eq!(budget.used(), 0);
    }
}
