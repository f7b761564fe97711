//! Bounded-parallelism fan-out helper.
//!
//! Built for scatter operations that issue `total` requests but keep at
//! most `quota` of them in flight: the issuing loop calls
//! [`RequestSync::wait_for_quota`] before each send, completion handlers
//! call [`RequestSync::task_done`], and the issuer parks in
//! [`RequestSync::wait_for_all`] at the end.

use std::sync::{Condvar, Mutex};

struct Counters {
    in_flight: u32,
    quota: u32,
    remaining: u32,
    failures: u32,
}

/// Total-count plus parallel-quota synchronizer for one fan-out call.
pub struct RequestSync {
    counters: Mutex<Counters>,
    quota_free: Condvar,
    all_done: Condvar,
}

impl RequestSync {
    /// Creates a synchronizer for `total` tasks with `quota` running in
    /// parallel. A zero total releases [`RequestSync::wait_for_all`]
    /// immediately.
    #[must_use]
    pub fn new(total: u32, quota: u32) -> Self {
        Self {
            counters: Mutex::new(Counters {
                in_flight: 0,
                quota: quota.max(1),
                remaining: total,
                failures: 0,
            }),
            quota_free: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    /// Blocks until fewer than `quota` tasks are in flight, then claims a
    /// slot.
    pub fn wait_for_quota(&self) {
        let mut counters = self.counters.lock().expect("request sync lock poisoned");
        while counters.in_flight >= counters.quota {
            counters = self
                .quota_free
                .wait(counters)
                .expect("request sync lock poisoned");
        }
        counters.in_flight += 1;
    }

    /// Reports one task finished, releasing its quota slot.
    pub fn task_done(&self, success: bool) {
        let mut counters = self.counters.lock().expect("request sync lock poisoned");
        if !success {
            counters.failures += 1;
        }
        counters.in_flight = counters.in_flight.saturating_sub(1);
        counters.remaining = counters.remaining.saturating_sub(1);
        let finished = counters.remaining == 0;
        drop(counters);
        self.quota_free.notify_one();
        if finished {
            self.all_done.notify_all();
        }
    }

    /// Blocks until all `total` tasks have reported done.
    pub fn wait_for_all(&self) {
        let mut counters = self.counters.lock().expect("request sync lock poisoned");
        while counters.remaining > 0 {
            counters = self
                .all_done
                .wait(counters)
                .expect("request sync lock poisoned");
        }
    }

    /// Number of tasks that reported `success = false` so far.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.counters
            .lock()
            .expect("request sync lock poisoned")
            .failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn zero_total_releases_immediately() {
        let sync = RequestSync::new(0, 4);
        sync.wait_for_all();
        assert_eq!(sync.failure_count(), 0);
    }

    #[test]
    fn wait_for_all_returns_after_exactly_total_completions() {
        let sync = Arc::new(RequestSync::new(10, 3));
        let workers: Vec<_> = (0..10)
            .map(|i| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || {
                    sync.wait_for_quota();
                    thread::sleep(Duration::from_millis(5));
                    sync.task_done(i % 4 != 0);
                })
            })
            .collect();

        sync.wait_for_all();
        for worker in workers {
            worker.join().unwrap();
        }
        // i in {0, 4, 8} report failure.
        assert_eq!(sync.failure_count(), 3);
    }

    #[test]
    fn quota_bounds_concurrency() {
        let sync = Arc::new(RequestSync::new(20, 4));
        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let workers: Vec<_> = (0..20)
            .map(|_| {
                let sync = Arc::clone(&sync);
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    sync.wait_for_quota();
                    let running = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(running, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    current.fetch_sub(1, Ordering::SeqCst);
                    sync.task_done(true);
                })
            })
            .collect();

        sync.wait_for_all();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(sync.failure_count(), 0);
    }

    #[test]
    fn failure_count_is_monotone() {
        let sync = RequestSync::new(3, 1);
        sync.wait_for_quota();
        sync.task_done(false);
        assert_eq!(sync.failure_count(), 1);
        sync.wait_for_quota();
        sync.task_done(true);
        assert_eq!(sync.failure_count(), 1);
        sync.wait_for_quota();
        sync.task_done(false);
        assert_eq!(sync.failure_count(), 2);
        sync.wait_for_all();
    }
}
