//! Channel: the per-endpoint front door.
//!
//! A channel bundles everything scoped to one `host:port`: the stream and
//! its sub-streams, the SID allocator, the in-queue, and the transport's
//! state bag. It also owns the tick task that drives per-request expiry and
//! idle teardown.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::trace;
use xrd_core::{AnyBag, Env, Url, XrdResult, env::keys};
use xrd_protocol::Message;
use xrd_runtime::{JobManager, Poller, Task, TaskManager};

use crate::handlers::{ChannelEventHandler, MessageFilter, ResponseHandler};
use crate::inqueue::InQueue;
use crate::msgutil::MessageSendParams;
use crate::sid::SidManager;
use crate::stream::{RedirectSink, Stream, StreamContext};
use crate::transport::{TransportCodec, TransportQuery};

/// One endpoint's connection bundle.
pub struct Channel {
    url: Url,
    stream: Arc<Stream>,
    sid_manager: Arc<SidManager>,
    in_queue: Arc<InQueue>,
    channel_data: Arc<AnyBag>,
    transport: Arc<dyn TransportCodec>,
    task_manager: Arc<TaskManager>,
    tick_task: Mutex<Option<Arc<dyn Task>>>,
}

impl Channel {
    /// Creates the channel and schedules its tick task.
    pub fn new(
        url: Url,
        transport: Arc<dyn TransportCodec>,
        poller: Arc<Poller>,
        task_manager: Arc<TaskManager>,
        job_manager: Arc<JobManager>,
        env: Arc<Env>,
    ) -> Arc<Self> {
        let orphan_ttl = Duration::from_secs(env.get_int(keys::ORPHAN_TTL).unwrap_or(60).max(1) as u64);
        let tick_interval =
            Duration::from_secs(env.get_int(keys::TICK_INTERVAL).unwrap_or(15).max(1) as u64);

        let sid_manager = Arc::new(SidManager::new());
        let in_queue = Arc::new(InQueue::new(orphan_ttl));
        let channel_data = Arc::new(AnyBag::new());

        let stream = Stream::new(StreamContext {
            url: url.clone(),
            transport: Arc::clone(&transport),
            poller,
            task_manager: Arc::clone(&task_manager),
            job_manager,
            sid_manager: Arc::clone(&sid_manager),
            in_queue: Arc::clone(&in_queue),
            channel_data: Arc::clone(&channel_data),
            env,
        });

        let channel = Arc::new(Self {
            url,
            stream,
            sid_manager,
            in_queue,
            channel_data,
            transport,
            task_manager: Arc::clone(&task_manager),
            tick_task: Mutex::new(None),
        });

        let task: Arc<dyn Task> = Arc::new(TickTask {
            channel: Arc::downgrade(&channel),
            interval: tick_interval,
        });
        task_manager.register_task(Arc::clone(&task), Instant::now() + tick_interval);
        *channel.tick_task.lock().expect("channel lock poisoned") = Some(task);

        trace!(url = %channel.url, "channel created");
        channel
    }

    /// Endpoint URL the channel serves.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Queues a message for sending.
    pub fn send(
        &self,
        msg: Message,
        handler: Arc<dyn ResponseHandler>,
        params: MessageSendParams,
    ) -> XrdResult<()> {
        self.stream.send(msg, handler, params)
    }

    /// Blocks until an unclaimed incoming message matches `filter`.
    pub fn receive(&self, filter: &dyn MessageFilter, timeout: Duration) -> XrdResult<Message> {
        self.in_queue.receive(filter, timeout)
    }

    /// Registers a single-shot listener for unclaimed incoming messages.
    pub fn add_listener(
        &self,
        filter: Arc<dyn MessageFilter>,
        handler: Arc<dyn ResponseHandler>,
        expires: Instant,
    ) {
        self.in_queue.add_listener(filter, handler, expires);
    }

    /// Removes a listener registered with [`Channel::add_listener`].
    pub fn remove_listener(&self, handler: &Arc<dyn ResponseHandler>) {
        self.in_queue.remove_listener(handler);
    }

    /// Queries the transport about this channel's negotiated session.
    #[must_use]
    pub fn query_transport(&self, what: TransportQuery) -> Option<String> {
        self.transport.query(what, &self.channel_data)
    }

    /// Registers a channel-event observer.
    pub fn register_event_handler(&self, handler: Arc<dyn ChannelEventHandler>) {
        self.stream.register_event_handler(handler);
    }

    /// Removes a channel-event observer.
    pub fn remove_event_handler(&self, handler: &Arc<dyn ChannelEventHandler>) {
        self.stream.remove_event_handler(handler);
    }

    /// Installs the on-connect callback.
    pub fn set_on_connect(&self, job: Arc<dyn Fn() + Send + Sync>) {
        self.stream.set_on_connect(job);
    }

    /// Wires the redirect sink into the stream.
    pub(crate) fn set_redirect_sink(&self, sink: Weak<dyn RedirectSink>) {
        self.stream.set_redirect_sink(sink);
    }

    /// Wipes all sub-streams. Pending stateful requests fail with
    /// `StreamDisconnect`; stateless ones are re-queued on reconnect.
    pub fn force_disconnect(&self) {
        self.stream.force_disconnect();
    }

    /// Forced disconnect followed by an immediate reconnect attempt.
    pub fn force_reconnect(&self) {
        self.stream.force_reconnect();
    }

    /// Number of connected sub-streams.
    #[must_use]
    pub fn connected_substreams(&self) -> usize {
        self.stream.connected_substreams()
    }

    /// Number of SIDs quarantined after request timeouts.
    #[must_use]
    pub fn timed_out_sids(&self) -> usize {
        self.sid_manager.timed_out_count()
    }

    /// Runs one housekeeping pass. Normally invoked by the tick task.
    pub fn tick(&self, now: Instant) {
        self.stream.tick(now);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.tick_task.lock().expect("channel lock poisoned").take() {
            self.task_manager.unregister_task(&task);
        }
        self.stream.force_disconnect();
    }
}

/// Re-arming task forwarding clock events to the channel.
struct TickTask {
    channel: Weak<Channel>,
    interval: Duration,
}

impl Task for TickTask {
    fn run(&self, now: Instant) -> Option<Instant> {
        let channel = self.channel.upgrade()?;
        channel.tick(now);
        Some(now + self.interval)
    }

    fn name(&self) -> &str {
        "channel-tick"
    }
}
