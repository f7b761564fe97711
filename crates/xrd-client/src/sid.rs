//! Per-channel stream-id allocation.
//!
//! A SID is either attached to exactly one in-flight request, parked in the
//! timed-out set, or on the free list. A timed-out SID must not be reused
//! until its response arrived or was discarded, otherwise a late reply
//! could complete the wrong request.

use std::collections::VecDeque;
use std::sync::Mutex;

use rustc_hash::FxHashSet;
use xrd_core::{Code, Status, XrdResult};

struct Pools {
    free: VecDeque<u16>,
    timed_out: FxHashSet<u16>,
    ceiling: u16,
}

/// Allocates and recycles the 16-bit request tags of one channel.
pub struct SidManager {
    pools: Mutex<Pools>,
}

impl SidManager {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(Pools {
                free: VecDeque::new(),
                timed_out: FxHashSet::default(),
                ceiling: 0,
            }),
        }
    }

    /// Allocates a SID, preferring the free list and growing the ceiling
    /// only on exhaustion. At most 65,534 SIDs can be live at once.
    pub fn allocate_sid(&self) -> XrdResult<[u8; 2]> {
        let mut pools = self.pools.lock().expect("sid manager lock poisoned");
        let sid = if let Some(sid) = pools.free.pop_front() {
            sid
        } else if pools.ceiling < u16::MAX - 1 {
            pools.ceiling += 1;
            pools.ceiling
        } else {
            return Err(Status::error(Code::NoSpace));
        };
        Ok(sid.to_be_bytes())
    }

    /// Returns a SID to the free list.
    pub fn release_sid(&self, sid: [u8; 2]) {
        let value = u16::from_be_bytes(sid);
        let mut pools = self.pools.lock().expect("sid manager lock poisoned");
        pools.timed_out.remove(&value);
        pools.free.push_back(value);
    }

    /// Quarantines the SID of a request that timed out.
    pub fn time_out_sid(&self, sid: [u8; 2]) {
        let value = u16::from_be_bytes(sid);
        let mut pools = self.pools.lock().expect("sid manager lock poisoned");
        pools.timed_out.insert(value);
    }

    /// True when the SID sits in the timed-out set.
    #[must_use]
    pub fn is_timed_out(&self, sid: [u8; 2]) -> bool {
        let value = u16::from_be_bytes(sid);
        self.pools
            .lock()
            .expect("sid manager lock poisoned")
            .timed_out
            .contains(&value)
    }

    /// Releases a timed-out SID back to the free list.
    pub fn release_timed_out(&self, sid: [u8; 2]) {
        let value = u16::from_be_bytes(sid);
        let mut pools = self.pools.lock().expect("sid manager lock poisoned");
        if pools.timed_out.remove(&value) {
            pools.free.push_back(value);
        }
    }

    /// Releases every timed-out SID, e.g. after a forced disconnect.
    pub fn release_all_timed_out(&self) {
        let mut pools = self.pools.lock().expect("sid manager lock poisoned");
        let drained: Vec<u16> = pools.timed_out.drain().collect();
        pools.free.extend(drained);
    }

    /// Number of SIDs currently quarantined.
    #[must_use]
    pub fn timed_out_count(&self) -> usize {
        self.pools
            .lock()
            .expect("sid manager lock poisoned")
            .timed_out
            .len()
    }

    /// Number of SIDs attached to in-flight requests.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        let pools = self.pools.lock().expect("sid manager lock poisoned");
        pools.ceiling as usize - pools.free.len() - pools.timed_out.len()
    }
}

impl Default for SidManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique() {
        let manager = SidManager::new();
        let a = manager.allocate_sid().unwrap();
        let b = manager.allocate_sid().unwrap();
        let c = manager.allocate_sid().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(manager.allocated_count(), 3);
    }

    #[test]
    fn released_sid_is_reused_before_the_ceiling_grows() {
        let manager = SidManager::new();
        let first = manager.allocate_sid().unwrap();
        let _second = manager.allocate_sid().unwrap();
        manager.release_sid(first);
        let reused = manager.allocate_sid().unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let manager = SidManager::new();
        // 65,534 allocations succeed; the next one must fail.
        for _ in 0..u16::MAX - 1 {
            manager.allocate_sid().unwrap();
        }
        let err = manager.allocate_sid().unwrap_err();
        assert_eq!(err.code(), Code::NoSpace);

        // One release makes exactly one allocation possible again, and it
        // hands back the just-released value.
        manager.release_sid(42u16.to_be_bytes());
        assert_eq!(manager.allocate_sid().unwrap(), 42u16.to_be_bytes());
        assert_eq!(
            manager.allocate_sid().unwrap_err().code(),
            Code::NoSpace
        );
    }

    #[test]
    fn timed_out_sid_is_not_reusable_until_released() {
        let manager = SidManager::new();
        let sid = manager.allocate_sid().unwrap();
        manager.time_out_sid(sid);
        assert!(manager.is_timed_out(sid));
        assert_eq!(manager.timed_out_count(), 1);

        // Allocation skips the quarantined value.
        let next = manager.allocate_sid().unwrap();
        assert_ne!(next, sid);

        manager.release_timed_out(sid);
        assert!(!manager.is_timed_out(sid));
        assert_eq!(manager.allocate_sid().unwrap(), sid);
    }

    #[test]
    fn release_also_clears_quarantine() {
        let manager = SidManager::new();
        let sid = manager.allocate_sid().unwrap();
        manager.time_out_sid(sid);
        manager.release_sid(sid);
        assert!(!manager.is_timed_out(sid));
    }

    #[test]
    fn release_all_timed_out_drains_the_set() {
        let manager = SidManager::new();
        let a = manager.allocate_sid().unwrap();
        let b = manager.allocate_sid().unwrap();
        manager.time_out_sid(a);
        manager.time_out_sid(b);
        manager.release_all_timed_out();
        assert_eq!(manager.timed_out_count(), 0);
        assert_eq!(manager.allocated_count(), 0);
    }

    #[test]
    fn pools_stay_pairwise_disjoint() {
        let manager = SidManager::new();
        let mut live = Vec::new();
        for _ in 0..100 {
            live.push(manager.allocate_sid().unwrap());
        }
        for sid in live.iter().take(30) {
            manager.time_out_sid(*sid);
        }
        for sid in live.iter().skip(30).take(30) {
            manager.release_sid(*sid);
        }
        // live: 40, timed out: 30, free: 30, ceiling: 100
        assert_eq!(manager.timed_out_count(), 30);
        assert_eq!(manager.allocated_count(), 40);
    }
}
