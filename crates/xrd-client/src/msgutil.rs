//! Send parameters and the sync-over-async bridge.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use xrd_core::{Code, Status};
use xrd_protocol::Message;

use crate::handlers::ResponseHandler;

/// Per-request routing and expiry parameters.
#[derive(Clone, Copy, Debug)]
pub struct MessageSendParams {
    /// Absolute time after which the request completes with
    /// `OperationExpired`.
    pub expires: Instant,
    /// When set, a physical disconnection fails the request instead of
    /// allowing a stateless retry.
    pub stateful: bool,
    /// Follow server redirects transparently.
    pub follow_redirects: bool,
    /// Remaining redirect hops before the request fails with `Redirect`.
    pub redirect_budget: u8,
}

impl MessageSendParams {
    /// Parameters expiring after `timeout`, stateless, following redirects
    /// with the given hop budget.
    #[must_use]
    pub fn with_timeout(timeout: Duration, redirect_budget: u8) -> Self {
        Self {
            expires: Instant::now() + timeout,
            stateful: false,
            follow_redirects: true,
            redirect_budget,
        }
    }

    /// Marks the request stateful.
    #[must_use]
    pub const fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }

    /// Disables transparent redirect following.
    #[must_use]
    pub const fn without_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }
}

/// Semaphore-backed continuation turning an async operation synchronous.
///
/// The caller registers the handler, then parks in
/// [`SyncResponseHandler::wait`] until the transport fires it.
pub struct SyncResponseHandler {
    slot: Mutex<Option<(Status, Option<Message>)>>,
    fired: Condvar,
}

impl SyncResponseHandler {
    /// Creates an unfired handler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            fired: Condvar::new(),
        }
    }

    /// Blocks until the handler fires, returning the outcome.
    pub fn wait(&self) -> (Status, Option<Message>) {
        let mut slot = self.slot.lock().expect("sync handler lock poisoned");
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self.fired.wait(slot).expect("sync handler lock poisoned");
        }
    }

    /// Blocks until the handler fires or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> (Status, Option<Message>) {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().expect("sync handler lock poisoned");
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return (Status::error(Code::OperationExpired), None);
            }
            let (guard, _result) = self
                .fired
                .wait_timeout(slot, deadline - now)
                .expect("sync handler lock poisoned");
            slot = guard;
        }
    }
}

impl Default for SyncResponseHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseHandler for SyncResponseHandler {
    fn handle_response(&self, status: Status, response: Option<Message>) {
        let mut slot = self.slot.lock().expect("sync handler lock poisoned");
        *slot = Some((status, response));
        drop(slot);
        self.fired.notify_all();
    }
}
