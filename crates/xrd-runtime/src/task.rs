//! Monotonic timer wheel.
//!
//! One runner thread executes due tasks in deadline order at a fixed
//! resolution. Tasks serialize with each other, so they must stay short;
//! anything that can block belongs on the [`crate::JobManager`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// A schedulable unit of housekeeping.
pub trait Task: Send + Sync {
    /// Runs the task. Returning `Some(next)` re-arms it at `next`;
    /// returning `None` retires it.
    fn run(&self, now: Instant) -> Option<Instant>;

    /// Name used in trace output.
    fn name(&self) -> &str {
        "anonymous"
    }
}

struct State {
    // Keyed by (deadline, insertion sequence) so equal deadlines keep
    // insertion order.
    tasks: BTreeMap<(Instant, u64), Arc<dyn Task>>,
    to_unregister: Vec<Arc<dyn Task>>,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    running: AtomicBool,
    seq: AtomicU64,
    resolution: Duration,
}

/// Runs short tasks at requested times on a dedicated thread.
pub struct TaskManager {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TaskManager {
    /// Creates a stopped manager with the given runner resolution.
    #[must_use]
    pub fn new(resolution: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tasks: BTreeMap::new(),
                    to_unregister: Vec::new(),
                }),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                resolution,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Creates a manager with the default 1 s resolution.
    #[must_use]
    pub fn with_default_resolution() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Starts the runner thread. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("xrd-tasks".to_owned())
            .spawn(move || run_tasks(&shared))
            .expect("spawning the task runner thread");
        *self.thread.lock().expect("task manager lock poisoned") = Some(handle);
        debug!("task manager started");
    }

    /// Stops the runner, waiting for a task in flight to finish.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self
            .thread
            .lock()
            .expect("task manager lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
        debug!("task manager stopped");
    }

    /// Schedules `task` to run at `when`.
    pub fn register_task(&self, task: Arc<dyn Task>, when: Instant) {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock().expect("task manager lock poisoned");
        trace!(task = task.name(), "task registered");
        state.tasks.insert((when, seq), task);
        drop(state);
        self.shared.wakeup.notify_all();
    }

    /// Queues `task` for removal. The removal is applied by the runner
    /// between task executions, so the task may run once more before it
    /// disappears.
    pub fn unregister_task(&self, task: &Arc<dyn Task>) {
        let mut state = self.shared.state.lock().expect("task manager lock poisoned");
        state.to_unregister.push(Arc::clone(task));
        drop(state);
        self.shared.wakeup.notify_all();
    }

    /// Number of scheduled tasks, for diagnostics.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("task manager lock poisoned")
            .tasks
            .len()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_tasks(shared: &Shared) {
    while shared.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        let mut due: Vec<Arc<dyn Task>> = Vec::new();

        {
            let mut state = shared.state.lock().expect("task manager lock poisoned");

            // Apply queued removals first so an unregistered task cannot be
            // picked up as due.
            let removals = std::mem::take(&mut state.to_unregister);
            if !removals.is_empty() {
                state
                    .tasks
                    .retain(|_, task| !removals.iter().any(|dead| Arc::ptr_eq(dead, task)));
            }

            let still_pending = state.tasks.split_off(&(now, u64::MAX));
            let due_map = std::mem::replace(&mut state.tasks, still_pending);
            due.extend(due_map.into_values());
        }

        for task in due {
            trace!(task = task.name(), "running task");
            if let Some(next) = task.run(now) {
                let seq = shared.seq.fetch_add(1, Ordering::Relaxed);
                shared
                    .state
                    .lock()
                    .expect("task manager lock poisoned")
                    .tasks
                    .insert((next, seq), task);
            }
        }

        let state = shared.state.lock().expect("task manager lock poisoned");
        let _unused = shared
            .wakeup
            .wait_timeout(state, shared.resolution)
            .expect("task manager lock poisoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        runs: AtomicUsize,
        reschedule: Option<Duration>,
    }

    impl Counting {
        fn once() -> Self {
            Self {
                runs: AtomicUsize::new(0),
                reschedule: None,
            }
        }

        fn every(interval: Duration) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                reschedule: Some(interval),
            }
        }
    }

    impl Task for Counting {
        fn run(&self, now: Instant) -> Option<Instant> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.reschedule.map(|interval| now + interval)
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn wait_for(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn one_shot_task_runs_once_and_retires() {
        let manager = TaskManager::new(Duration::from_millis(20));
        manager.start();

        let task = Arc::new(Counting::once());
        manager.register_task(task.clone(), Instant::now());

        assert!(wait_for(Duration::from_secs(2), || {
            task.runs.load(Ordering::SeqCst) == 1
        }));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.task_count(), 0);
        manager.stop();
    }

    #[test]
    fn rearming_task_runs_repeatedly() {
        let manager = TaskManager::new(Duration::from_millis(10));
        manager.start();

        let task = Arc::new(Counting::every(Duration::from_millis(20)));
        manager.register_task(task.clone(), Instant::now());

        assert!(wait_for(Duration::from_secs(3), || {
            task.runs.load(Ordering::SeqCst) >= 3
        }));
        manager.stop();
    }

    #[test]
    fn future_task_does_not_run_early() {
        let manager = TaskManager::new(Duration::from_millis(10));
        manager.start();

        let task = Arc::new(Counting::once());
        manager.register_task(task.clone(), Instant::now() + Duration::from_millis(300));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        assert!(wait_for(Duration::from_secs(2), || {
            task.runs.load(Ordering::SeqCst) == 1
        }));
        manager.stop();
    }

    #[test]
    fn unregister_prevents_future_runs() {
        let manager = TaskManager::new(Duration::from_millis(10));
        manager.start();

        let counting = Arc::new(Counting::every(Duration::from_millis(10)));
        let task: Arc<dyn Task> = counting.clone();
        manager.register_task(Arc::clone(&task), Instant::now() + Duration::from_millis(200));
        manager.unregister_task(&task);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(counting.runs.load(Ordering::SeqCst), 0);
        assert_eq!(manager.task_count(), 0);
        manager.stop();
    }

    #[test]
    fn equal_deadlines_preserve_registration_order() {
        let manager = TaskManager::new(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Ordered {
            id: usize,
            order: Arc<Mutex<Vec<usize>>>,
        }
        impl Task for Ordered {
            fn run(&self, _now: Instant) -> Option<Instant> {
                self.order.lock().unwrap().push(self.id);
                None
            }
        }

        let when = Instant::now();
        for id in 0..4 {
            manager.register_task(
                Arc::new(Ordered {
                    id,
                    order: Arc::clone(&order),
                }),
                when,
            );
        }
        manager.start();

        assert!(wait_for(Duration::from_secs(2), || {
            order.lock().unwrap().len() == 4
        }));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        manager.stop();
    }
}
