#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `xrd_throttle` is a process-wide fair-share gate. Identities hash into
//! a fixed array of 1024 slots; unrelated identities may collide and then
//! share a slot, which is an accepted simplification of the scheme. Each
//! slot carries a primary and a secondary share of the per-interval byte
//! and operation budgets. A dedicated thread re-deals the budget every
//! interval: the primary share is refilled to `rate * interval /
//! active_users` and whatever was left of the old primary becomes the
//! secondary share, available for other slots to steal.
//!
//! [`ThrottleManager::apply`] consumes primary, then secondary, then
//! steals other slots' secondary, and finally blocks on a condvar that is
//! broadcast at every refill. Per-entity open-file and connection caps are
//! enforced under a small mutex and fail fast with a descriptive error
//! instead of blocking.

pub mod config;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::{debug, trace};

pub use config::{LoadShed, ThrottleConfig};

/// Number of fair-share slots.
pub const SLOT_COUNT: usize = 1024;

/// Failures reported by the throttle.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ThrottleError {
    /// A per-entity cap was reached.
    #[error("{entity}: {what} limit of {limit} reached")]
    LimitHit {
        /// The entity that hit its cap.
        entity: String,
        /// Which cap: `open files` or `connections`.
        what: &'static str,
        /// The configured ceiling.
        limit: u32,
    },
}

#[derive(Clone, Copy, Default)]
struct Slot {
    primary_bytes: u64,
    secondary_bytes: u64,
    primary_ops: u64,
    secondary_ops: u64,
    active: bool,
    granted_this_interval: bool,
}

#[derive(Default)]
struct EntityCaps {
    open_files: u32,
    connections: u32,
}

struct Gate {
    slots: Mutex<[Slot; SLOT_COUNT]>,
    refill: Condvar,
    waited: AtomicBool,
    shedding: AtomicBool,
    shed_counter: AtomicU64,
    concurrency: Mutex<u32>,
    concurrency_free: Condvar,
    stop: AtomicBool,
}

/// The process-wide fair-share gate.
pub struct ThrottleManager {
    config: ThrottleConfig,
    gate: Arc<Gate>,
    entities: Mutex<FxHashMap<String, EntityCaps>>,
    runner: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThrottleManager {
    /// Creates a stopped manager.
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            gate: Arc::new(Gate {
                slots: Mutex::new([Slot::default(); SLOT_COUNT]),
                refill: Condvar::new(),
                waited: AtomicBool::new(false),
                shedding: AtomicBool::new(false),
                shed_counter: AtomicU64::new(0),
                concurrency: Mutex::new(0),
                concurrency_free: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            entities: Mutex::new(FxHashMap::default()),
            runner: Mutex::new(None),
        }
    }

    /// Starts the refill thread. Idempotent.
    pub fn start(&self) {
        let mut runner = self.runner.lock().expect("throttle lock poisoned");
        if runner.is_some() {
            return;
        }
        let gate = Arc::clone(&self.gate);
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("xrd-throttle".to_owned())
            .spawn(move || {
                while !gate.stop.load(Ordering::SeqCst) {
                    thread::sleep(config.interval);
                    refill(&gate, &config);
                }
            })
            .expect("spawning the throttle refill thread");
        *runner = Some(handle);
        debug!(interval = ?self.config.interval, "throttle started");
    }

    /// Stops the refill thread.
    pub fn stop(&self) {
        self.gate.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.runner.lock().expect("throttle lock poisoned").take() {
            let _ = handle.join();
        }
        // Unblock anyone still parked in apply().
        self.gate.refill.notify_all();
    }

    fn slot_index(identity: &str) -> usize {
        let mut hasher = FxHasher::default();
        identity.hash(&mut hasher);
        (hasher.finish() as usize) % SLOT_COUNT
    }

    /// Charges `bytes` and `ops` against the identity's fair share,
    /// blocking until the budget allows it.
    pub fn apply(&self, mut bytes: u64, mut ops: u64, identity: &str) {
        if self.config.bytes_per_second.is_none() {
            bytes = 0;
        }
        if self.config.ops_per_second.is_none() {
            ops = 0;
        }
        if bytes == 0 && ops == 0 {
            return;
        }

        let index = Self::slot_index(identity);
        let mut slots = self.gate.slots.lock().expect("throttle lock poisoned");
        loop {
            {
                let slot = &mut slots[index];
                slot.active = true;
                if !slot.granted_this_interval {
                    // Bootstrap grant so a fresh identity is not stalled a
                    // whole interval.
                    slot.granted_this_interval = true;
                    slot.primary_bytes += self.config.byte_grant(1);
                    slot.primary_ops += self.config.op_grant(1);
                }
                take(&mut slot.primary_bytes, &mut bytes);
                take(&mut slot.secondary_bytes, &mut bytes);
                take(&mut slot.primary_ops, &mut ops);
                take(&mut slot.secondary_ops, &mut ops);
            }

            if bytes > 0 || ops > 0 {
                // Steal unused secondary shares from the other slots.
                for other in 0..SLOT_COUNT {
                    if other == index {
                        continue;
                    }
                    take(&mut slots[other].secondary_bytes, &mut bytes);
                    take(&mut slots[other].secondary_ops, &mut ops);
                    if bytes == 0 && ops == 0 {
                        break;
                    }
                }
            }

            if bytes == 0 && ops == 0 {
                return;
            }

            trace!(identity, bytes, ops, "throttled, waiting for refill");
            self.gate.waited.store(true, Ordering::SeqCst);
            if self.gate.stop.load(Ordering::SeqCst) {
                return;
            }
            slots = self
                .gate
                .refill
                .wait(slots)
                .expect("throttle lock poisoned");
        }
    }

    /// Blocks until a concurrency slot is free, then claims it. A no-op
    /// when no concurrency limit is configured.
    pub fn acquire_concurrency(&self) {
        let Some(limit) = self.config.concurrency_limit else {
            return;
        };
        let mut active = self.gate.concurrency.lock().expect("throttle lock poisoned");
        while *active >= limit {
            active = self
                .gate
                .concurrency_free
                .wait(active)
                .expect("throttle lock poisoned");
        }
        *active += 1;
    }

    /// Releases a concurrency slot claimed by
    /// [`ThrottleManager::acquire_concurrency`].
    pub fn release_concurrency(&self) {
        if self.config.concurrency_limit.is_none() {
            return;
        }
        let mut active = self.gate.concurrency.lock().expect("throttle lock poisoned");
        *active = active.saturating_sub(1);
        drop(active);
        self.gate.concurrency_free.notify_one();
    }

    /// Decides whether a new request should be redirected to the backup
    /// host. Sheds the configured percentage of requests, but only while
    /// the throttle was actually hit during the last interval.
    #[must_use]
    pub fn shed_target(&self) -> Option<&LoadShed> {
        let shed = self.config.loadshed.as_ref()?;
        if !self.gate.shedding.load(Ordering::SeqCst) {
            return None;
        }
        let ticket = self.gate.shed_counter.fetch_add(1, Ordering::SeqCst);
        (ticket % 100 < u64::from(shed.frequency)).then_some(shed)
    }

    /// Registers an open file for `entity`; fails fast at the cap.
    pub fn note_open_file(&self, entity: &str) -> Result<(), ThrottleError> {
        let mut entities = self.entities.lock().expect("throttle lock poisoned");
        let caps = entities.entry(entity.to_owned()).or_default();
        if let Some(limit) = self.config.max_open_files {
            if caps.open_files >= limit {
                return Err(ThrottleError::LimitHit {
                    entity: entity.to_owned(),
                    what: "open files",
                    limit,
                });
            }
        }
        caps.open_files += 1;
        Ok(())
    }

    /// Releases an open file registered for `entity`.
    pub fn note_close_file(&self, entity: &str) {
        let mut entities = self.entities.lock().expect("throttle lock poisoned");
        if let Some(caps) = entities.get_mut(entity) {
            caps.open_files = caps.open_files.saturating_sub(1);
        }
    }

    /// Registers a connection for `entity`; fails fast at the cap.
    pub fn note_open_connection(&self, entity: &str) -> Result<(), ThrottleError> {
        let mut entities = self.entities.lock().expect("throttle lock poisoned");
        let caps = entities.entry(entity.to_owned()).or_default();
        if let Some(limit) = self.config.max_connections {
            if caps.connections >= limit {
                return Err(ThrottleError::LimitHit {
                    entity: entity.to_owned(),
                    what: "connections",
                    limit,
                });
            }
        }
        caps.connections += 1;
        Ok(())
    }

    /// Releases a connection registered for `entity`.
    pub fn note_close_connection(&self, entity: &str) {
        let mut entities = self.entities.lock().expect("throttle lock poisoned");
        if let Some(caps) = entities.get_mut(entity) {
            caps.connections = caps.connections.saturating_sub(1);
        }
    }
}

impl Drop for ThrottleManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn take(share: &mut u64, want: &mut u64) {
    let taken = (*share).min(*want);
    *share -= taken;
    *want -= taken;
}

/// One interval boundary: re-deal primary shares, demote leftovers to
/// secondary, wake the waiters.
fn refill(gate: &Gate, config: &ThrottleConfig) {
    let mut slots = gate.slots.lock().expect("throttle lock poisoned");
    let active_users = slots.iter().filter(|slot| slot.active).count().max(1);

    let byte_grant = config.byte_grant(active_users);
    let op_grant = config.op_grant(active_users);

    for slot in slots.iter_mut() {
        if slot.active {
            slot.secondary_bytes = slot.primary_bytes;
            slot.secondary_ops = slot.primary_ops;
            slot.primary_bytes = byte_grant;
            slot.primary_ops = op_grant;
        } else {
            slot.primary_bytes = 0;
            slot.secondary_bytes = 0;
            slot.primary_ops = 0;
            slot.secondary_ops = 0;
        }
        slot.active = false;
        slot.granted_this_interval = slot.primary_bytes > 0 || slot.primary_ops > 0;
    }
    drop(slots);

    let hit = gate.waited.swap(false, Ordering::SeqCst);
    gate.shedding.store(hit, Ordering::SeqCst);
    gate.refill.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn manager(bps: u64, interval_ms: u64) -> ThrottleManager {
        let config = ThrottleConfig {
            bytes_per_second: Some(bps),
            interval: Duration::from_millis(interval_ms),
            ..ThrottleConfig::default()
        };
        let manager = ThrottleManager::new(config);
        manager.start();
        manager
    }

    #[test]
    fn unlimited_manager_never_blocks() {
        let manager = ThrottleManager::new(ThrottleConfig::default());
        let start = Instant::now();
        for _ in 0..1000 {
            manager.apply(1 << 30, 100, "anyone");
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn burst_within_the_grant_passes_immediately() {
        let manager = manager(1_000_000, 1000);
        let start = Instant::now();
        manager.apply(500_000, 0, "alice");
        manager.apply(500_000, 0, "alice");
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "bootstrap grant should admit the first interval's worth"
        );
        manager.stop();
    }

    #[test]
    fn sustained_overload_is_paced_by_the_refill() {
        // 100 KB per 50 ms interval => a 300 KB backlog needs >= 2 refills.
        let config = ThrottleConfig {
            bytes_per_second: Some(2_000_000),
            interval: Duration::from_millis(50),
            ..ThrottleConfig::default()
        };
        let manager = ThrottleManager::new(config);
        manager.start();

        let start = Instant::now();
        for _ in 0..4 {
            manager.apply(100_000, 0, "bob");
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(50),
            "overload must wait for at least one refill, took {elapsed:?}"
        );
        manager.stop();
    }

    #[test]
    fn ops_budget_is_enforced_independently() {
        let config = ThrottleConfig {
            ops_per_second: Some(10),
            interval: Duration::from_millis(50),
            ..ThrottleConfig::default()
        };
        let manager = ThrottleManager::new(config);
        manager.start();

        let start = Instant::now();
        // Grant is 10 ops per second => ~0.5 per 50 ms interval, floored
        // with a minimum of one; 4 ops need several refills.
        for _ in 0..4 {
            manager.apply(0, 1, "carol");
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        manager.stop();
    }

    #[test]
    fn distinct_identities_use_distinct_slots() {
        assert_ne!(
            ThrottleManager::slot_index("user-a"),
            ThrottleManager::slot_index("user-b"),
        );
        assert_eq!(
            ThrottleManager::slot_index("user-a"),
            ThrottleManager::slot_index("user-a"),
        );
    }

    #[test]
    fn open_file_cap_fails_fast_with_description() {
        let config = ThrottleConfig {
            max_open_files: Some(2),
            ..ThrottleConfig::default()
        };
        let manager = ThrottleManager::new(config);

        manager.note_open_file("dn=alice").unwrap();
        manager.note_open_file("dn=alice").unwrap();
        let err = manager.note_open_file("dn=alice").unwrap_err();
        assert_eq!(
            err.to_string(),
            "dn=alice: open files limit of 2 reached"
        );

        // Another entity has its own budget.
        manager.note_open_file("dn=bob").unwrap();

        manager.note_close_file("dn=alice");
        manager.note_open_file("dn=alice").unwrap();
    }

    #[test]
    fn connection_cap_is_independent_of_files() {
        let config = ThrottleConfig {
            max_open_files: Some(1),
            max_connections: Some(1),
            ..ThrottleConfig::default()
        };
        let manager = ThrottleManager::new(config);
        manager.note_open_file("x").unwrap();
        manager.note_open_connection("x").unwrap();
        assert!(manager.note_open_connection("x").is_err());
        manager.note_close_connection("x");
        manager.note_open_connection("x").unwrap();
    }

    #[test]
    fn concurrency_guard_bounds_parallelism() {
        let config = ThrottleConfig {
            concurrency_limit: Some(2),
            ..ThrottleConfig::default()
        };
        let manager = Arc::new(ThrottleManager::new(config));

        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    manager.acquire_concurrency();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                    manager.release_concurrency();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn shedding_requires_recent_pressure() {
        // Grant is 5000 bytes per 50 ms interval.
        let config = ThrottleConfig {
            bytes_per_second: Some(100_000),
            interval: Duration::from_millis(50),
            loadshed: Some(LoadShed {
                host: "backup.example:1094".to_owned(),
                frequency: 100,
            }),
            ..ThrottleConfig::default()
        };
        let manager = ThrottleManager::new(config);
        manager.start();

        // No pressure yet: no shedding.
        assert!(manager.shed_target().is_none());

        // Overdraw the budget so apply() has to wait for refills; the
        // refill that observes the wait marks the throttle hot.
        manager.apply(12_000, 0, "dave");
        let shed = manager.shed_target();
        assert_eq!(
            shed.map(|s| s.host.as_str()),
            Some("backup.example:1094")
        );
        manager.stop();
    }
}
