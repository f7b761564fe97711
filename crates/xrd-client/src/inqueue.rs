//! Queue of arrived, still-unclaimed responses.
//!
//! Responses that match no in-flight request (server notifications,
//! `waitresp` completions) park here until a filter claims them. Waiting is
//! either synchronous ([`InQueue::receive`]) or through a single-shot
//! listener ([`InQueue::add_listener`]). Orphans are dropped after a bounded
//! retention time, checked on channel ticks.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use xrd_core::{Code, Status, XrdResult};
use xrd_protocol::Message;

use crate::handlers::{MessageFilter, ResponseHandler};

/// Default ceiling on parked messages.
const DEFAULT_CAPACITY: usize = 256;

struct Listener {
    filter: Arc<dyn MessageFilter>,
    handler: Arc<dyn ResponseHandler>,
    expires: Instant,
}

struct Inner {
    messages: VecDeque<(Message, Instant)>,
    listeners: Vec<Listener>,
}

/// Bounded, ordered store of unclaimed incoming messages.
pub struct InQueue {
    inner: Mutex<Inner>,
    arrived: Condvar,
    capacity: usize,
    orphan_ttl: Duration,
}

impl InQueue {
    /// Creates a queue with the given retention time for orphans.
    #[must_use]
    pub fn new(orphan_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                listeners: Vec::new(),
            }),
            arrived: Condvar::new(),
            capacity: DEFAULT_CAPACITY,
            orphan_ttl,
        }
    }

    /// Adds an arrived message. A matching listener consumes it
    /// immediately; otherwise it is retained for a bounded time. When the
    /// queue is full the oldest orphan is dropped.
    pub fn add_message(&self, msg: Message) {
        let mut inner = self.inner.lock().expect("in-queue lock poisoned");

        if let Some(idx) = inner.listeners.iter().position(|l| l.filter.matches(&msg)) {
            let listener = inner.listeners.swap_remove(idx);
            drop(inner);
            listener.handler.handle_response(Status::OK, Some(msg));
            return;
        }

        if inner.messages.len() >= self.capacity {
            if let Some((dropped, _)) = inner.messages.pop_front() {
                debug!(
                    description = dropped.description(),
                    "in-queue full, dropping oldest orphan"
                );
            }
        }
        trace!(description = msg.description(), "message parked in in-queue");
        inner.messages.push_back((msg, Instant::now()));
        drop(inner);
        self.arrived.notify_all();
    }

    /// Registers a single-shot listener completed with the first matching
    /// message, or with `OperationExpired` at `expires`.
    pub fn add_listener(
        &self,
        filter: Arc<dyn MessageFilter>,
        handler: Arc<dyn ResponseHandler>,
        expires: Instant,
    ) {
        let mut inner = self.inner.lock().expect("in-queue lock poisoned");
        // A parked message may already satisfy the listener.
        if let Some(idx) = inner.messages.iter().position(|(msg, _)| filter.matches(msg)) {
            let (msg, _) = inner.messages.remove(idx).expect("index just found");
            drop(inner);
            handler.handle_response(Status::OK, Some(msg));
            return;
        }
        inner.listeners.push(Listener {
            filter,
            handler,
            expires,
        });
    }

    /// Removes a previously registered listener by handler identity.
    pub fn remove_listener(&self, handler: &Arc<dyn ResponseHandler>) {
        let mut inner = self.inner.lock().expect("in-queue lock poisoned");
        inner
            .listeners
            .retain(|l| !Arc::ptr_eq(&l.handler, handler));
    }

    /// Blocks until a message matching `filter` arrives or `timeout`
    /// elapses.
    pub fn receive(&self, filter: &dyn MessageFilter, timeout: Duration) -> XrdResult<Message> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("in-queue lock poisoned");
        loop {
            if let Some(idx) = inner.messages.iter().position(|(msg, _)| filter.matches(msg)) {
                let (msg, _) = inner.messages.remove(idx).expect("index just found");
                return Ok(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::error(Code::OperationExpired));
            }
            let (guard, _timeout) = self
                .arrived
                .wait_timeout(inner, deadline - now)
                .expect("in-queue lock poisoned");
            inner = guard;
        }
    }

    /// Drops orphans past their retention time and expires stale
    /// listeners. Called from the channel tick.
    pub fn expire(&self, now: Instant) {
        let mut expired_listeners = Vec::new();
        {
            let mut inner = self.inner.lock().expect("in-queue lock poisoned");
            let ttl = self.orphan_ttl;
            inner.messages.retain(|(_, arrived)| now.duration_since(*arrived) < ttl);

            let mut index = 0;
            while index < inner.listeners.len() {
                if inner.listeners[index].expires <= now {
                    expired_listeners.push(inner.listeners.swap_remove(index));
                } else {
                    index += 1;
                }
            }
        }
        for listener in expired_listeners {
            listener
                .handler
                .handle_response(Status::error(Code::OperationExpired), None);
        }
    }

    /// Number of parked messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("in-queue lock poisoned").messages.len()
    }

    /// True when nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::SidFilter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use xrd_protocol::requests;

    struct Recording {
        calls: AtomicUsize,
        last: Mutex<Option<Status>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            })
        }
    }

    impl ResponseHandler for Recording {
        fn handle_response(&self, status: Status, _response: Option<Message>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(status);
        }
    }

    fn tagged(sid: [u8; 2]) -> Message {
        let mut msg = requests::ping();
        msg.set_sid(sid);
        msg
    }

    #[test]
    fn receive_returns_matching_message() {
        let queue = InQueue::new(Duration::from_secs(60));
        queue.add_message(tagged([1, 1]));
        queue.add_message(tagged([2, 2]));

        let msg = queue
            .receive(&SidFilter([2, 2]), Duration::from_millis(100))
            .expect("match available");
        assert_eq!(msg.sid(), Some([2, 2]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn receive_times_out_without_match() {
        let queue = InQueue::new(Duration::from_secs(60));
        queue.add_message(tagged([1, 1]));
        let err = queue
            .receive(&SidFilter([9, 9]), Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.code(), Code::OperationExpired);
    }

    #[test]
    fn receive_wakes_on_late_arrival() {
        let queue = Arc::new(InQueue::new(Duration::from_secs(60)));
        let waiter = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            waiter.receive(&SidFilter([5, 5]), Duration::from_secs(5))
        });
        thread::sleep(Duration::from_millis(50));
        queue.add_message(tagged([5, 5]));
        let msg = handle.join().unwrap().expect("message delivered");
        assert_eq!(msg.sid(), Some([5, 5]));
    }

    #[test]
    fn listener_consumes_matching_arrival() {
        let queue = InQueue::new(Duration::from_secs(60));
        let handler = Recording::new();
        queue.add_listener(
            Arc::new(SidFilter([3, 3])),
            handler.clone(),
            Instant::now() + Duration::from_secs(10),
        );
        queue.add_message(tagged([3, 3]));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn listener_sees_already_parked_message() {
        let queue = InQueue::new(Duration::from_secs(60));
        queue.add_message(tagged([4, 4]));
        let handler = Recording::new();
        queue.add_listener(
            Arc::new(SidFilter([4, 4])),
            handler.clone(),
            Instant::now() + Duration::from_secs(10),
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_listener_completes_with_operation_expired() {
        let queue = InQueue::new(Duration::from_secs(60));
        let handler = Recording::new();
        queue.add_listener(
            Arc::new(SidFilter([6, 6])),
            handler.clone(),
            Instant::now(),
        );
        queue.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            handler.last.lock().unwrap().unwrap().code(),
            Code::OperationExpired
        );
    }

    #[test]
    fn orphans_age_out() {
        let queue = InQueue::new(Duration::from_millis(10));
        queue.add_message(tagged([7, 7]));
        queue.expire(Instant::now() + Duration::from_secs(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn removed_listener_never_fires() {
        let queue = InQueue::new(Duration::from_secs(60));
        let handler = Recording::new();
        let as_handler: Arc<dyn ResponseHandler> = handler.clone();
        queue.add_listener(
            Arc::new(SidFilter([8, 8])),
            handler.clone(),
            Instant::now() + Duration::from_secs(10),
        );
        queue.remove_listener(&as_handler);
        queue.add_message(tagged([8, 8]));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);
    }
}
