//! Handler capability traits.
//!
//! Each seam in the pipeline is a small named trait rather than a class
//! hierarchy: response correlation, in-queue filtering, and channel
//! life-cycle observation. Implementations must be cheap to clone behind
//! `Arc` and safe to invoke from pool threads.

use xrd_core::Status;
use xrd_protocol::Message;

/// Receives the outcome of one request.
pub trait ResponseHandler: Send + Sync {
    /// Called exactly once with the final status and, on success, the
    /// response frame.
    fn handle_response(&self, status: Status, response: Option<Message>);

    /// Called when the request bytes have fully left the socket. Optional.
    fn on_sent(&self) {}
}

/// Predicate selecting messages out of the in-queue.
pub trait MessageFilter: Send + Sync {
    /// True when the message satisfies the filter.
    fn matches(&self, msg: &Message) -> bool;
}

/// Matches any message whose stream id equals the given one.
#[derive(Clone, Copy, Debug)]
pub struct SidFilter(pub [u8; 2]);

impl MessageFilter for SidFilter {
    fn matches(&self, msg: &Message) -> bool {
        msg.sid() == Some(self.0)
    }
}

/// Channel life-cycle transitions observable by the upper layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    /// The stream reached the connected state.
    Connected,
    /// The stream lost its connection and may reconnect.
    Broken,
    /// A reconnect attempt is under way.
    Reconnecting,
    /// The stream failed terminally; only a forced reconnect revives it.
    Fatal,
}

/// Observes channel life-cycle transitions.
pub trait ChannelEventHandler: Send + Sync {
    /// Called on every transition. Returning `false` removes the handler.
    fn on_event(&self, event: ChannelEvent) -> bool;
}
