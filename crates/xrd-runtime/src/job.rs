//! Bounded worker pool.
//!
//! Response handlers and other work that may block must not run on the
//! reactor thread; the stream queues them here. Jobs are independent: the
//! pool makes no ordering promise between them.

use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::debug;

/// A unit of work executed on a pool thread.
pub trait Job: Send {
    /// Consumes and runs the job.
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send> Job for F {
    fn run(self: Box<Self>) {
        (*self)();
    }
}

enum Envelope {
    Work(Box<dyn Job>),
    Shutdown,
}

/// Fixed-size pool executing short CPU jobs off the reactor thread.
pub struct JobManager {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    workers: usize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl JobManager {
    /// Creates a stopped pool with `workers` threads.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            workers: workers.max(1),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Creates a pool with the default three workers.
    #[must_use]
    pub fn with_default_workers() -> Self {
        Self::new(3)
    }

    /// Starts the worker threads. Idempotent.
    pub fn start(&self) {
        let mut threads = self.threads.lock().expect("job manager lock poisoned");
        if !threads.is_empty() {
            return;
        }
        for index in 0..self.workers {
            let rx = self.rx.clone();
            let handle = thread::Builder::new()
                .name(format!("xrd-job-{index}"))
                .spawn(move || {
                    while let Ok(envelope) = rx.recv() {
                        match envelope {
                            Envelope::Work(job) => job.run(),
                            Envelope::Shutdown => break,
                        }
                    }
                })
                .expect("spawning a job worker thread");
            threads.push(handle);
        }
        debug!(workers = self.workers, "job manager started");
    }

    /// Queues a job; returns immediately.
    pub fn queue_job(&self, job: Box<dyn Job>) {
        // The channel is unbounded and its receiver lives in self, so the
        // send can only fail after the process started tearing down.
        let _ = self.tx.send(Envelope::Work(job));
    }

    /// Convenience wrapper queueing a closure.
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) {
        self.queue_job(Box::new(job));
    }

    /// Stops the pool after the queued jobs in front of the shutdown
    /// markers have run.
    pub fn stop(&self) {
        let mut threads = self.threads.lock().expect("job manager lock poisoned");
        if threads.is_empty() {
            return;
        }
        for _ in 0..threads.len() {
            let _ = self.tx.send(Envelope::Shutdown);
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        debug!("job manager stopped");
    }

    /// Number of configured workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop();
    }
}
