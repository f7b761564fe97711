//! Non-blocking socket reactor.
//!
//! One loop thread multiplexes every socket in the process. Sockets are
//! identified by raw file descriptor; ownership stays with the caller and
//! only the descriptor is registered with the OS selector. Each direction
//! carries an independent inactivity timeout: when it elapses without a
//! readiness event the matching timeout callback fires on the loop thread.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use xrd_core::{Code, Status, XrdResult};

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Floor for the loop's poll timeout; also the timeout sweep resolution.
const RESOLUTION: Duration = Duration::from_secs(1);

/// Callbacks a registered socket receives from the reactor thread.
///
/// All methods run on the loop thread and must not block.
pub trait SocketEventHandler: Send + Sync {
    /// The socket became readable.
    fn on_readable(&self);
    /// The socket became writable.
    fn on_writable(&self);
    /// No read readiness arrived within the configured read timeout.
    fn on_read_timeout(&self);
    /// No write readiness arrived within the configured write timeout.
    fn on_write_timeout(&self);
    /// The peer closed or the socket errored at the OS level.
    fn on_hangup(&self);
}

struct Registration {
    handler: Arc<dyn SocketEventHandler>,
    registered: bool,
    read_enabled: bool,
    write_enabled: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl Registration {
    fn interests(&self) -> Option<Interest> {
        match (self.read_enabled, self.write_enabled) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.read_deadline, self.write_deadline) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }
}

struct Shared {
    sockets: Mutex<FxHashMap<RawFd, Registration>>,
    running: AtomicBool,
}

/// The process-wide socket reactor.
pub struct Poller {
    shared: Arc<Shared>,
    poll: Mutex<Option<Poll>>,
    waker: Mutex<Option<Arc<Waker>>>,
    registry: Mutex<Option<mio::Registry>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Poller {
    /// Creates a stopped reactor.
    pub fn new() -> XrdResult<Self> {
        let poller = Self {
            shared: Arc::new(Shared {
                sockets: Mutex::new(FxHashMap::default()),
                running: AtomicBool::new(false),
            }),
            poll: Mutex::new(None),
            waker: Mutex::new(None),
            registry: Mutex::new(None),
            thread: Mutex::new(None),
        };
        poller.initialize()?;
        Ok(poller)
    }

    fn initialize(&self) -> XrdResult<()> {
        let poll = Poll::new().map_err(Status::from)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(Status::from)?;
        let registry = poll.registry().try_clone().map_err(Status::from)?;
        *self.poll.lock().expect("poller lock poisoned") = Some(poll);
        *self.waker.lock().expect("poller lock poisoned") = Some(Arc::new(waker));
        *self.registry.lock().expect("poller lock poisoned") = Some(registry);
        Ok(())
    }

    /// Starts the loop thread. Idempotent.
    pub fn start(&self) -> XrdResult<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let poll = self
            .poll
            .lock()
            .expect("poller lock poisoned")
            .take()
            .ok_or_else(|| Status::error(Code::InternalError))?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("xrd-poller".to_owned())
            .spawn(move || run_loop(poll, &shared))
            .map_err(Status::from)?;
        *self.thread.lock().expect("poller lock poisoned") = Some(handle);
        debug!("poller started");
        Ok(())
    }

    /// Stops the loop thread and returns once it has exited.
    pub fn stop(&self) -> XrdResult<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.wake();
        if let Some(handle) = self.thread.lock().expect("poller lock poisoned").take() {
            let _ = handle.join();
        }
        // The old selector died with the loop thread; registrations on it
        // are gone. Re-arm so the reactor can be started again.
        for entry in self
            .shared
            .sockets
            .lock()
            .expect("poller lock poisoned")
            .values_mut()
        {
            entry.registered = false;
        }
        self.initialize()?;
        debug!("poller stopped");
        Ok(())
    }

    /// True while the loop thread is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Re-initializes the reactor in a fork child: sockets inherited from
    /// the parent are forgotten, nothing is re-armed.
    pub fn after_fork(&self) -> XrdResult<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        *self.thread.lock().expect("poller lock poisoned") = None;
        self.shared
            .sockets
            .lock()
            .expect("poller lock poisoned")
            .clear();
        self.initialize()
    }

    /// Registers a socket with its event handler. Events stay disabled
    /// until enabled per direction.
    pub fn add_socket(&self, fd: RawFd, handler: Arc<dyn SocketEventHandler>) -> XrdResult<()> {
        let mut sockets = self.shared.sockets.lock().expect("poller lock poisoned");
        if sockets.contains_key(&fd) {
            return Err(Status::error(Code::InvalidArgs));
        }
        sockets.insert(
            fd,
            Registration {
                handler,
                registered: false,
                read_enabled: false,
                write_enabled: false,
                read_timeout: None,
                write_timeout: None,
                read_deadline: None,
                write_deadline: None,
            },
        );
        trace!(fd, "socket added to poller");
        Ok(())
    }

    /// Removes a socket, disabling any pending notifications.
    pub fn remove_socket(&self, fd: RawFd) -> XrdResult<()> {
        let mut sockets = self.shared.sockets.lock().expect("poller lock poisoned");
        let entry = sockets
            .remove(&fd)
            .ok_or_else(|| Status::error(Code::InvalidArgs))?;
        if entry.registered {
            if let Some(registry) = self.registry.lock().expect("poller lock poisoned").as_ref() {
                if let Err(err) = registry.deregister(&mut SourceFd(&fd)) {
                    warn!(fd, %err, "deregister failed");
                }
            }
        }
        drop(sockets);
        self.wake();
        trace!(fd, "socket removed from poller");
        Ok(())
    }

    /// True when the descriptor is known to the reactor.
    #[must_use]
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.shared
            .sockets
            .lock()
            .expect("poller lock poisoned")
            .contains_key(&fd)
    }

    /// Enables or disables read-readiness notification, with an optional
    /// inactivity timeout.
    pub fn enable_read_notification(
        &self,
        fd: RawFd,
        enable: bool,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.update(fd, |entry| {
            entry.read_enabled = enable;
            entry.read_timeout = if enable { timeout } else { None };
            entry.read_deadline = if enable {
                timeout.map(|t| Instant::now() + t)
            } else {
                None
            };
        })
    }

    /// Enables or disables write-readiness notification, with an optional
    /// inactivity timeout.
    pub fn enable_write_notification(
        &self,
        fd: RawFd,
        enable: bool,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.update(fd, |entry| {
            entry.write_enabled = enable;
            entry.write_timeout = if enable { timeout } else { None };
            entry.write_deadline = if enable {
                timeout.map(|t| Instant::now() + t)
            } else {
                None
            };
        })
    }

    fn update(&self, fd: RawFd, mutate: impl FnOnce(&mut Registration)) -> XrdResult<()> {
        let mut sockets = self.shared.sockets.lock().expect("poller lock poisoned");
        let entry = sockets
            .get_mut(&fd)
            .ok_or_else(|| Status::error(Code::InvalidArgs))?;
        mutate(entry);

        let registry_guard = self.registry.lock().expect("poller lock poisoned");
        let registry = registry_guard
            .as_ref()
            .ok_or_else(|| Status::error(Code::InternalError))?;
        let token = Token(fd as usize);
        match (entry.registered, entry.interests()) {
            (false, Some(interests)) => {
                registry
                    .register(&mut SourceFd(&fd), token, interests)
                    .map_err(Status::from)?;
                entry.registered = true;
            }
            (true, Some(interests)) => {
                registry
                    .reregister(&mut SourceFd(&fd), token, interests)
                    .map_err(Status::from)?;
            }
            (true, None) => {
                registry
                    .deregister(&mut SourceFd(&fd))
                    .map_err(Status::from)?;
                entry.registered = false;
            }
            (false, None) => {}
        }
        drop(registry_guard);
        drop(sockets);
        self.wake();
        Ok(())
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().expect("poller lock poisoned").as_ref() {
            if let Err(err) = waker.wake() {
                warn!(%err, "poller wake failed");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

enum Fired {
    Readable,
    Writable,
    ReadTimeout,
    WriteTimeout,
    Hangup,
}

fn run_loop(mut poll: Poll, shared: &Shared) {
    let mut events = Events::with_capacity(256);
    while shared.running.load(Ordering::SeqCst) {
        let timeout = next_poll_timeout(shared);
        if let Err(err) = poll.poll(&mut events, Some(timeout)) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!(%err, "poll failed, reactor exiting");
            break;
        }

        let now = Instant::now();
        let mut pending: Vec<(Arc<dyn SocketEventHandler>, Fired)> = Vec::new();

        {
            let mut sockets = shared.sockets.lock().expect("poller lock poisoned");
            for event in &events {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let fd = event.token().0 as RawFd;
                let Some(entry) = sockets.get_mut(&fd) else {
                    continue;
                };
                if event.is_error() {
                    pending.push((Arc::clone(&entry.handler), Fired::Hangup));
                    continue;
                }
                if (event.is_readable() || event.is_read_closed()) && entry.read_enabled {
                    entry.read_deadline = entry.read_timeout.map(|t| now + t);
                    pending.push((Arc::clone(&entry.handler), Fired::Readable));
                }
                if event.is_writable() && entry.write_enabled {
                    entry.write_deadline = entry.write_timeout.map(|t| now + t);
                    pending.push((Arc::clone(&entry.handler), Fired::Writable));
                }
            }

            // Inactivity sweep. Deadlines are pushed forward after firing so
            // a stuck handler does not refire every wake-up.
            for entry in sockets.values_mut() {
                if let Some(deadline) = entry.read_deadline {
                    if entry.read_enabled && deadline <= now {
                        entry.read_deadline = entry.read_timeout.map(|t| now + t);
                        pending.push((Arc::clone(&entry.handler), Fired::ReadTimeout));
                    }
                }
                if let Some(deadline) = entry.write_deadline {
                    if entry.write_enabled && deadline <= now {
                        entry.write_deadline = entry.write_timeout.map(|t| now + t);
                        pending.push((Arc::clone(&entry.handler), Fired::WriteTimeout));
                    }
                }
            }
        }

        for (handler, fired) in pending {
            match fired {
                Fired::Readable => handler.on_readable(),
                Fired::Writable => handler.on_writable(),
                Fired::ReadTimeout => handler.on_read_timeout(),
                Fired::WriteTimeout => handler.on_write_timeout(),
                Fired::Hangup => handler.on_hangup(),
            }
        }
    }
}

fn next_poll_timeout(shared: &Shared) -> Duration {
    let now = Instant::now();
    let sockets = shared.sockets.lock().expect("poller lock poisoned");
    sockets
        .values()
        .filter_map(Registration::next_deadline)
        .map(|deadline| deadline.saturating_duration_since(now))
        .min()
        .map_or(RESOLUTION, |until| until.min(RESOLUTION))
}
