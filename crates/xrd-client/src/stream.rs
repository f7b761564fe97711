//! Stream: the per-endpoint connection state machine.
//!
//! A stream drives one or more sub-streams (TCP connections) to a single
//! endpoint. Each sub-stream walks `Idle -> Connecting -> Handshake ->
//! Ready`; user frames only flow once the transport has marked the
//! sub-stream ready. Sends are FIFO within one sub-stream; responses are
//! correlated stream-wide by SID. Redirects short-circuit here and re-enter
//! the post master at the new endpoint.
//!
//! All socket callbacks run on the reactor thread. The stream collects the
//! user-visible consequences of a callback (completions, events, redirect
//! re-submissions) while holding its lock and performs them after releasing
//! it, with completions pushed onto the job pool.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};
use xrd_core::{AnyBag, Code, Env, Status, Url, XrdResult, env::keys};
use xrd_protocol::frame::{FrameProgress, FrameReader, write_message};
use xrd_protocol::{Message, ResponseStatus, ServerResponse, responses};
use xrd_runtime::{JobManager, Poller, SocketEventHandler, Task, TaskManager};

use crate::handlers::{ChannelEvent, ChannelEventHandler, ResponseHandler};
use crate::inqueue::InQueue;
use crate::msgutil::MessageSendParams;
use crate::resolver::{self, FamilyPreference};
use crate::sid::SidManager;
use crate::transport::{HandshakeStep, TransportCodec};

/// Where redirected requests are re-submitted. Implemented by the post
/// master; the stream holds only a weak reference to break the ownership
/// cycle.
pub trait RedirectSink: Send + Sync {
    /// Re-submits `msg` to `url` with the same handler and parameters.
    fn resubmit(
        &self,
        url: &Url,
        msg: Message,
        handler: Arc<dyn ResponseHandler>,
        params: MessageSendParams,
    ) -> XrdResult<()>;
}

/// Everything a stream needs from its surroundings.
pub struct StreamContext {
    /// Endpoint this stream talks to.
    pub url: Url,
    /// Scheme transport.
    pub transport: Arc<dyn TransportCodec>,
    /// Shared reactor.
    pub poller: Arc<Poller>,
    /// Shared timer wheel.
    pub task_manager: Arc<TaskManager>,
    /// Shared worker pool for handler dispatch.
    pub job_manager: Arc<JobManager>,
    /// Per-channel SID allocator.
    pub sid_manager: Arc<SidManager>,
    /// Per-channel unclaimed-message queue.
    pub in_queue: Arc<InQueue>,
    /// Per-channel transport state bag.
    pub channel_data: Arc<AnyBag>,
    /// Process defaults.
    pub env: Arc<Env>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StreamStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SubPhase {
    Idle,
    Connecting,
    Handshake,
    Ready,
}

struct OutboundRequest {
    msg: Message,
    handler: Arc<dyn ResponseHandler>,
    params: MessageSendParams,
}

struct InFlight {
    request: Message,
    handler: Arc<dyn ResponseHandler>,
    params: MessageSendParams,
    partial: Option<Vec<u8>>,
    /// Remaining expiry budget while the server holds the request in
    /// `waitresp`; the clock resumes when the async response arrives.
    paused: Option<Duration>,
}

struct SubStream {
    socket: Option<TcpStream>,
    fd: Option<RawFd>,
    phase: SubPhase,
    handshake_out: Option<Message>,
    sending: Option<OutboundRequest>,
    out_queue: VecDeque<OutboundRequest>,
    reader: FrameReader,
}

impl SubStream {
    fn idle() -> Self {
        Self {
            socket: None,
            fd: None,
            phase: SubPhase::Idle,
            handshake_out: None,
            sending: None,
            out_queue: VecDeque::new(),
            reader: FrameReader::new(),
        }
    }
}

struct StreamState {
    status: StreamStatus,
    substreams: Vec<SubStream>,
    addresses: Vec<SocketAddr>,
    addr_cursor: usize,
    error_window_start: Option<Instant>,
    in_flight: FxHashMap<u16, InFlight>,
    pending: VecDeque<OutboundRequest>,
    last_activity: Instant,
    rr_cursor: usize,
}

/// Deferred side effect collected under the state lock, performed after it
/// is released.
enum Action {
    Complete {
        handler: Arc<dyn ResponseHandler>,
        status: Status,
        response: Option<Message>,
    },
    Sent(Arc<dyn ResponseHandler>),
    Event(ChannelEvent),
    Redirect {
        url: Url,
        msg: Message,
        handler: Arc<dyn ResponseHandler>,
        params: MessageSendParams,
    },
    Park(Message),
}

/// Logical connection to one endpoint.
pub struct Stream {
    ctx: StreamContext,
    state: Mutex<StreamState>,
    redirect_sink: Mutex<Option<Weak<dyn RedirectSink>>>,
    event_handlers: Mutex<Vec<Arc<dyn ChannelEventHandler>>>,
    on_connect: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

struct SubStreamHandler {
    stream: Weak<Stream>,
    substream: usize,
}

impl SocketEventHandler for SubStreamHandler {
    fn on_readable(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.handle_readable(self.substream);
        }
    }

    fn on_writable(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.handle_writable(self.substream);
        }
    }

    fn on_read_timeout(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.handle_read_timeout(self.substream);
        }
    }

    fn on_write_timeout(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.handle_write_timeout(self.substream);
        }
    }

    fn on_hangup(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.handle_error(self.substream, Status::error(Code::StreamDisconnect));
        }
    }
}

impl Stream {
    /// Creates a disconnected stream.
    pub fn new(ctx: StreamContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(StreamState {
                status: StreamStatus::Disconnected,
                substreams: vec![SubStream::idle()],
                addresses: Vec::new(),
                addr_cursor: 0,
                error_window_start: None,
                in_flight: FxHashMap::default(),
                pending: VecDeque::new(),
                last_activity: Instant::now(),
                rr_cursor: 0,
            }),
            redirect_sink: Mutex::new(None),
            event_handlers: Mutex::new(Vec::new()),
            on_connect: Mutex::new(None),
        })
    }

    /// Wires the post master back-pointer used for redirect re-submission.
    pub fn set_redirect_sink(&self, sink: Weak<dyn RedirectSink>) {
        *self.redirect_sink.lock().expect("stream lock poisoned") = Some(sink);
    }

    /// Registers a channel-event observer.
    pub fn register_event_handler(&self, handler: Arc<dyn ChannelEventHandler>) {
        self.event_handlers
            .lock()
            .expect("stream lock poisoned")
            .push(handler);
    }

    /// Removes a channel-event observer by identity.
    pub fn remove_event_handler(&self, handler: &Arc<dyn ChannelEventHandler>) {
        self.event_handlers
            .lock()
            .expect("stream lock poisoned")
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Installs a callback run (on the job pool) every time the stream
    /// reaches the connected state.
    pub fn set_on_connect(&self, job: Arc<dyn Fn() + Send + Sync>) {
        *self.on_connect.lock().expect("stream lock poisoned") = Some(job);
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.ctx.url
    }

    /// Number of sub-streams currently ready for traffic.
    #[must_use]
    pub fn connected_substreams(&self) -> usize {
        let state = self.state.lock().expect("stream lock poisoned");
        state
            .substreams
            .iter()
            .filter(|sub| sub.phase == SubPhase::Ready)
            .count()
    }

    /// Queues a request. Non-blocking: connection establishment, handshake,
    /// and transmission all happen on the reactor thread.
    pub fn send(
        self: &Arc<Self>,
        mut msg: Message,
        handler: Arc<dyn ResponseHandler>,
        params: MessageSendParams,
    ) -> XrdResult<()> {
        let sid = self.ctx.sid_manager.allocate_sid()?;
        msg.set_sid(sid);
        msg.rewind();
        self.ctx.transport.set_description(&mut msg);
        match self.enqueue(OutboundRequest {
            msg,
            handler,
            params,
        }) {
            Ok(()) => Ok(()),
            Err((status, _out)) => {
                self.ctx.sid_manager.release_sid(sid);
                Err(status)
            }
        }
    }

    fn enqueue(self: &Arc<Self>, out: OutboundRequest) -> Result<(), (Status, OutboundRequest)> {
        let mut actions = Vec::new();
        let result = {
            let mut state = self.state.lock().expect("stream lock poisoned");
            match state.status {
                StreamStatus::Connected => {
                    self.queue_on_substream(&mut state, out);
                    Ok(())
                }
                StreamStatus::Connecting => {
                    state.pending.push_back(out);
                    Ok(())
                }
                StreamStatus::Disconnected => {
                    state.pending.push_back(out);
                    self.start_connect(&mut state, &mut actions);
                    Ok(())
                }
                StreamStatus::Error => {
                    let window = self.connection_window();
                    let elapsed = state
                        .error_window_start
                        .is_none_or(|start| start.elapsed() >= window);
                    if elapsed {
                        // One reconnect attempt once the window has passed.
                        state.error_window_start = None;
                        state.status = StreamStatus::Disconnected;
                        state.pending.push_back(out);
                        actions.push(Action::Event(ChannelEvent::Reconnecting));
                        self.start_connect(&mut state, &mut actions);
                        Ok(())
                    } else {
                        Err((Status::error(Code::StreamBroken), out))
                    }
                }
            }
        };
        self.perform(actions);
        result
    }

    fn connection_window(&self) -> Duration {
        let secs = self
            .ctx
            .env
            .get_int(keys::CONNECTION_WINDOW)
            .unwrap_or(120)
            .max(0) as u64;
        Duration::from_secs(secs)
    }

    fn stream_timeout(&self) -> Duration {
        let secs = self
            .ctx
            .env
            .get_int(keys::STREAM_TIMEOUT)
            .unwrap_or(60)
            .max(1) as u64;
        Duration::from_secs(secs)
    }

    /// Picks a ready sub-stream round-robin and queues the request on it.
    fn queue_on_substream(self: &Arc<Self>, state: &mut StreamState, out: OutboundRequest) {
        let ready: Vec<usize> = state
            .substreams
            .iter()
            .enumerate()
            .filter(|(_, sub)| sub.phase == SubPhase::Ready)
            .map(|(idx, _)| idx)
            .collect();
        if ready.is_empty() {
            state.pending.push_back(out);
            return;
        }
        let pick = ready[state.rr_cursor % ready.len()];
        state.rr_cursor = state.rr_cursor.wrapping_add(1);
        let sub = &mut state.substreams[pick];
        sub.out_queue.push_back(out);
        if let Some(fd) = sub.fd {
            let _ = self
                .ctx
                .poller
                .enable_write_notification(fd, true, Some(self.stream_timeout()));
        }
    }

    /// Resolves the endpoint and starts a non-blocking connect on
    /// sub-stream 0. Terminal failures enter the error window and fail the
    /// waiting requests; the method itself never propagates an error.
    fn start_connect(self: &Arc<Self>, state: &mut StreamState, actions: &mut Vec<Action>) {
        if state.addresses.is_empty() || state.addr_cursor >= state.addresses.len() {
            match resolver::resolve(&self.ctx.url, FamilyPreference::SystemOrder) {
                Ok(addresses) => {
                    state.addresses = addresses;
                    state.addr_cursor = 0;
                }
                Err(status) => {
                    warn!(url = %self.ctx.url, %status, "endpoint resolution failed");
                    self.enter_error_window(state, status, actions);
                    return;
                }
            }
        }
        state.status = StreamStatus::Connecting;
        state.substreams = vec![SubStream::idle()];
        self.connect_substream(state, 0, actions);
    }

    fn connect_substream(
        self: &Arc<Self>,
        state: &mut StreamState,
        idx: usize,
        actions: &mut Vec<Action>,
    ) {
        let addr = state.addresses[state.addr_cursor];
        debug!(url = %self.ctx.url, %addr, substream = idx, "connecting");

        let socket = match open_socket(addr) {
            Ok(socket) => socket,
            Err(status) => {
                self.handle_connect_failure(state, idx, status, actions);
                return;
            }
        };
        let fd = socket.as_raw_fd();

        while state.substreams.len() <= idx {
            state.substreams.push(SubStream::idle());
        }
        let sub = &mut state.substreams[idx];
        sub.socket = Some(socket);
        sub.fd = Some(fd);
        sub.phase = SubPhase::Connecting;
        sub.reader = FrameReader::new();
        sub.handshake_out = None;

        let handler: Arc<dyn SocketEventHandler> = Arc::new(SubStreamHandler {
            stream: Arc::downgrade(self),
            substream: idx,
        });
        let registered = self
            .ctx
            .poller
            .add_socket(fd, handler)
            .and_then(|()| {
                self.ctx
                    .poller
                    .enable_write_notification(fd, true, Some(self.stream_timeout()))
            });
        if let Err(status) = registered {
            self.handle_connect_failure(state, idx, status, actions);
        }
    }

    fn handle_connect_failure(
        self: &Arc<Self>,
        state: &mut StreamState,
        idx: usize,
        status: Status,
        actions: &mut Vec<Action>,
    ) {
        warn!(url = %self.ctx.url, substream = idx, %status, "connect attempt failed");
        self.teardown_substream(state, idx);
        if idx > 0 {
            // Extra sub-streams are an optimization; sub-stream 0 carries
            // the session and drives address iteration.
            return;
        }
        state.addr_cursor += 1;
        if state.addr_cursor < state.addresses.len() {
            self.connect_substream(state, idx, actions);
            return;
        }
        // Address list exhausted: enter the error window and fail
        // everything that was waiting for this connection.
        self.enter_error_window(state, status, actions);
    }

    fn enter_error_window(
        &self,
        state: &mut StreamState,
        status: Status,
        actions: &mut Vec<Action>,
    ) {
        state.status = StreamStatus::Error;
        state.error_window_start = Some(Instant::now());
        self.fail_all(state, status, actions);
        actions.push(Action::Event(ChannelEvent::Broken));
    }

    fn fail_all(&self, state: &mut StreamState, status: Status, actions: &mut Vec<Action>) {
        for out in state.pending.drain(..) {
            if let Some(sid) = out.msg.sid() {
                self.ctx.sid_manager.release_sid(sid);
            }
            actions.push(Action::Complete {
                handler: out.handler,
                status,
                response: None,
            });
        }
        for sub in &mut state.substreams {
            for out in sub.sending.take().into_iter().chain(sub.out_queue.drain(..)) {
                if let Some(sid) = out.msg.sid() {
                    self.ctx.sid_manager.release_sid(sid);
                }
                actions.push(Action::Complete {
                    handler: out.handler,
                    status,
                    response: None,
                });
            }
        }
        for (sid, entry) in state.in_flight.drain() {
            self.ctx.sid_manager.release_sid(sid.to_be_bytes());
            actions.push(Action::Complete {
                handler: entry.handler,
                status,
                response: None,
            });
        }
    }

    fn teardown_substream(&self, state: &mut StreamState, idx: usize) {
        if let Some(sub) = state.substreams.get_mut(idx) {
            if let Some(fd) = sub.fd.take() {
                let _ = self.ctx.poller.remove_socket(fd);
            }
            sub.socket = None;
            sub.phase = SubPhase::Idle;
            sub.handshake_out = None;
            sub.reader = FrameReader::new();
        }
    }

    // ------------------------------------------------------------------
    // Reactor callbacks
    // ------------------------------------------------------------------

    fn handle_writable(self: &Arc<Self>, idx: usize) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().expect("stream lock poisoned");
            if state.substreams.get(idx).is_none() {
                return;
            }

            if state.substreams[idx].phase == SubPhase::Connecting {
                let error = state.substreams[idx]
                    .socket
                    .as_ref()
                    .and_then(|sock| sock.take_error().ok().flatten());
                if let Some(err) = error {
                    let status = Status::from(err);
                    self.handle_connect_failure(&mut state, idx, status, &mut actions);
                    drop(state);
                    self.perform(actions);
                    return;
                }
                state.substreams[idx].phase = SubPhase::Handshake;
                state.last_activity = Instant::now();
                match self
                    .ctx
                    .transport
                    .handshake_start(&self.ctx.channel_data, idx)
                {
                    HandshakeStep::Send(msg) => {
                        state.substreams[idx].handshake_out = Some(msg);
                    }
                    HandshakeStep::Done => {
                        self.mark_ready(&mut state, idx, &mut actions);
                    }
                }
                if let Some(fd) = state.substreams[idx].fd {
                    let _ = self.ctx.poller.enable_read_notification(
                        fd,
                        true,
                        Some(self.stream_timeout()),
                    );
                }
            }

            self.drain_writes(&mut state, idx, &mut actions);
        }
        self.perform(actions);
    }

    /// Writes handshake or user frames until the socket pushes back.
    fn drain_writes(self: &Arc<Self>, state: &mut StreamState, idx: usize, actions: &mut Vec<Action>) {
        loop {
            let sub = &mut state.substreams[idx];
            let Some(socket) = sub.socket.as_ref() else {
                return;
            };

            if let Some(hs) = sub.handshake_out.as_mut() {
                let mut sink = socket;
                match write_message(hs, &mut sink) {
                    Ok(true) => {
                        sub.handshake_out = None;
                        // Reply pending; nothing else may be written yet.
                        self.set_write_interest(sub, false);
                        return;
                    }
                    Ok(false) => return,
                    Err(err) => {
                        let status = Status::from(err);
                        self.fail_substream(state, idx, status, actions);
                        return;
                    }
                }
            }

            if sub.phase != SubPhase::Ready {
                self.set_write_interest(sub, false);
                return;
            }

            if sub.sending.is_none() {
                match sub.out_queue.pop_front() {
                    Some(next) => sub.sending = Some(next),
                    None => {
                        self.set_write_interest(sub, false);
                        return;
                    }
                }
            }

            let out = sub.sending.as_mut().expect("sending set above");
            let mut sink = socket;
            match write_message(&mut out.msg, &mut sink) {
                Ok(true) => {
                    let out = sub.sending.take().expect("sending set above");
                    let sid_bytes = out.msg.sid().unwrap_or([0, 0]);
                    let sid = u16::from_be_bytes(sid_bytes);
                    trace!(
                        url = %self.ctx.url,
                        sid,
                        description = out.msg.description(),
                        "request sent"
                    );
                    actions.push(Action::Sent(Arc::clone(&out.handler)));
                    let mut request = out.msg;
                    request.rewind();
                    state.in_flight.insert(
                        sid,
                        InFlight {
                            request,
                            handler: out.handler,
                            params: out.params,
                            partial: None,
                            paused: None,
                        },
                    );
                    state.last_activity = Instant::now();
                }
                Ok(false) => return,
                Err(err) => {
                    let status = Status::from(err);
                    self.fail_substream(state, idx, status, actions);
                    return;
                }
            }
        }
    }

    fn set_write_interest(&self, sub: &SubStream, on: bool) {
        if let Some(fd) = sub.fd {
            let timeout = on.then(|| self.stream_timeout());
            let _ = self.ctx.poller.enable_write_notification(fd, on, timeout);
        }
    }

    fn handle_readable(self: &Arc<Self>, idx: usize) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().expect("stream lock poisoned");
            loop {
                let Some(sub) = state.substreams.get_mut(idx) else {
                    break;
                };
                let Some(socket) = sub.socket.as_ref() else {
                    break;
                };
                let mut source: &TcpStream = socket;
                match sub.reader.read_from(&mut source) {
                    Ok(FrameProgress::Complete) => {
                        let msg = sub.reader.take().expect("frame complete");
                        state.last_activity = Instant::now();
                        if state.substreams[idx].phase == SubPhase::Handshake {
                            self.advance_handshake(&mut state, idx, &msg, &mut actions);
                        } else {
                            self.dispatch_response(&mut state, msg, &mut actions);
                        }
                    }
                    Ok(FrameProgress::NeedMore) => break,
                    Err(err) => {
                        let status = Status::from(err);
                        self.fail_substream(&mut state, idx, status, &mut actions);
                        break;
                    }
                }
            }
        }
        self.perform(actions);
    }

    fn advance_handshake(
        self: &Arc<Self>,
        state: &mut StreamState,
        idx: usize,
        reply: &Message,
        actions: &mut Vec<Action>,
    ) {
        match self
            .ctx
            .transport
            .handshake_advance(&self.ctx.channel_data, idx, reply)
        {
            Ok(HandshakeStep::Send(msg)) => {
                state.substreams[idx].handshake_out = Some(msg);
                self.drain_writes(state, idx, actions);
                if state.substreams[idx].handshake_out.is_some() {
                    self.set_write_interest(&state.substreams[idx], true);
                }
            }
            Ok(HandshakeStep::Done) => {
                self.mark_ready(state, idx, actions);
            }
            Err(status) => {
                warn!(url = %self.ctx.url, %status, "handshake failed");
                self.fail_substream(state, idx, Status::fatal(Code::HandshakeFailed), actions);
                if status.is_fatal() {
                    state.status = StreamStatus::Error;
                    state.error_window_start = Some(Instant::now());
                    actions.push(Action::Event(ChannelEvent::Fatal));
                }
            }
        }
    }

    fn mark_ready(self: &Arc<Self>, state: &mut StreamState, idx: usize, actions: &mut Vec<Action>) {
        state.substreams[idx].phase = SubPhase::Ready;
        debug!(url = %self.ctx.url, substream = idx, "substream ready");

        if state.status != StreamStatus::Connected {
            state.status = StreamStatus::Connected;
            state.error_window_start = None;
            actions.push(Action::Event(ChannelEvent::Connected));

            // The transport decides how wide this channel runs.
            let want = self
                .ctx
                .transport
                .multiplex_substreams(&self.ctx.channel_data)
                .max(1);
            for extra in state.substreams.len()..want {
                self.connect_substream(state, extra, actions);
            }
        }

        // Flush requests that waited for the connection.
        while let Some(out) = state.pending.pop_front() {
            self.queue_on_substream(state, out);
        }
        self.drain_writes(state, idx, actions);
    }

    fn dispatch_response(
        self: &Arc<Self>,
        state: &mut StreamState,
        msg: Message,
        actions: &mut Vec<Action>,
    ) {
        let sid_bytes = msg.sid().unwrap_or([0, 0]);
        let sid = u16::from_be_bytes(sid_bytes);

        if self.ctx.sid_manager.is_timed_out(sid_bytes) {
            let is_final = !matches!(msg.response_status(), Some(ResponseStatus::OkSoFar));
            trace!(sid, "late response for timed-out request dropped");
            if is_final {
                self.ctx.sid_manager.release_timed_out(sid_bytes);
            }
            return;
        }

        if !state.in_flight.contains_key(&sid) {
            actions.push(Action::Park(msg));
            return;
        }

        match msg.response_status() {
            Some(ResponseStatus::OkSoFar) => {
                let entry = state.in_flight.get_mut(&sid).expect("checked above");
                entry
                    .partial
                    .get_or_insert_with(Vec::new)
                    .extend_from_slice(msg.response_payload());
            }
            Some(ResponseStatus::WaitResp) => {
                let entry = state.in_flight.get_mut(&sid).expect("checked above");
                let now = Instant::now();
                entry.paused = Some(entry.params.expires.saturating_duration_since(now));
                trace!(sid, "request parked in waitresp");
            }
            Some(ResponseStatus::Wait) => {
                let delay = responses::parse_wait(msg.response_payload()).unwrap_or(1);
                let entry = state.in_flight.remove(&sid).expect("checked above");
                trace!(sid, delay, "server asked to wait");
                let task: Arc<dyn Task> = Arc::new(ResendTask {
                    stream: Arc::downgrade(self),
                    slot: Mutex::new(Some(OutboundRequest {
                        msg: entry.request,
                        handler: entry.handler,
                        params: entry.params,
                    })),
                });
                self.ctx
                    .task_manager
                    .register_task(task, Instant::now() + Duration::from_secs(u64::from(delay)));
            }
            Some(ResponseStatus::Redirect) => {
                let entry = state.in_flight.remove(&sid).expect("checked above");
                self.ctx.sid_manager.release_sid(sid_bytes);
                self.handle_redirect(entry, &msg, actions);
            }
            _ => {
                let mut entry = state.in_flight.remove(&sid).expect("checked above");
                self.ctx.sid_manager.release_sid(sid_bytes);
                let status = ServerResponse::parse(&msg)
                    .map(|resp| resp.to_status())
                    .unwrap_or_else(|_| Status::error(Code::InternalError));
                let response = match entry.partial.take() {
                    Some(mut accumulated) => {
                        accumulated.extend_from_slice(msg.response_payload());
                        let dlen = accumulated.len() as u32;
                        let mut combined = Vec::with_capacity(
                            xrd_protocol::wire::RESPONSE_HEADER_LEN + accumulated.len(),
                        );
                        combined.extend_from_slice(
                            &msg.as_slice()[..xrd_protocol::wire::RESPONSE_HEADER_LEN],
                        );
                        combined.extend_from_slice(&accumulated);
                        let mut combined = Message::from_vec(combined);
                        xrd_protocol::wire::put_u32(combined.as_mut_slice(), 4, dlen);
                        combined
                    }
                    None => msg,
                };
                actions.push(Action::Complete {
                    handler: entry.handler,
                    status,
                    response: Some(response),
                });
            }
        }
    }

    fn handle_redirect(&self, entry: InFlight, msg: &Message, actions: &mut Vec<Action>) {
        let redirect = match responses::parse_redirect(msg.response_payload()) {
            Ok(redirect) => redirect,
            Err(err) => {
                warn!(url = %self.ctx.url, %err, "malformed redirect body");
                actions.push(Action::Complete {
                    handler: entry.handler,
                    status: Status::error(Code::ServerError),
                    response: None,
                });
                return;
            }
        };

        let mut params = entry.params;
        if !params.follow_redirects || params.redirect_budget == 0 {
            // The caller asked to see redirects; hand the body over so it
            // can drive its own recovery.
            actions.push(Action::Complete {
                handler: entry.handler,
                status: Status::error(Code::Redirect),
                response: Some(msg.clone()),
            });
            return;
        }
        params.redirect_budget -= 1;

        let port = if redirect.port > 0 {
            redirect.port as u16
        } else {
            xrd_core::url::DEFAULT_PORT
        };
        let target = format!(
            "{}://{}:{}{}",
            self.ctx.url.scheme(),
            redirect.host,
            port,
            self.ctx.url.path()
        );
        let url = match Url::parse(&target) {
            Ok(url) => url,
            Err(err) => {
                warn!(%err, "redirect target does not parse");
                actions.push(Action::Complete {
                    handler: entry.handler,
                    status: Status::error(Code::ServerError),
                    response: None,
                });
                return;
            }
        };

        debug!(from = %self.ctx.url, to = %url, "following redirect");
        let mut msg = entry.request;
        msg.set_sid([0, 0]);
        msg.rewind();
        actions.push(Action::Redirect {
            url,
            msg,
            handler: entry.handler,
            params,
        });
    }

    /// A sub-stream failed mid-connection. Stateful in-flight requests
    /// fail; stateless ones and everything still queued are re-queued for
    /// the reconnect.
    fn fail_substream(
        self: &Arc<Self>,
        state: &mut StreamState,
        idx: usize,
        status: Status,
        actions: &mut Vec<Action>,
    ) {
        debug!(url = %self.ctx.url, substream = idx, %status, "substream failed");

        let mut requeue: Vec<OutboundRequest> = Vec::new();
        for i in 0..state.substreams.len() {
            let sub = &mut state.substreams[i];
            for out in sub.sending.take().into_iter().chain(sub.out_queue.drain(..)) {
                requeue.push(out);
            }
            self.teardown_substream(state, i);
        }
        state.substreams = vec![SubStream::idle()];

        let sids: Vec<u16> = state.in_flight.keys().copied().collect();
        for sid in sids {
            let entry = state.in_flight.remove(&sid).expect("key just listed");
            self.ctx.sid_manager.release_sid(sid.to_be_bytes());
            if entry.params.stateful {
                actions.push(Action::Complete {
                    handler: entry.handler,
                    status: Status::error(Code::StreamDisconnect),
                    response: None,
                });
            } else {
                let mut msg = entry.request;
                msg.rewind();
                requeue.push(OutboundRequest {
                    msg,
                    handler: entry.handler,
                    params: entry.params,
                });
            }
        }

        for out in requeue {
            if out.params.stateful {
                if let Some(sid) = out.msg.sid() {
                    self.ctx.sid_manager.release_sid(sid);
                }
                actions.push(Action::Complete {
                    handler: out.handler,
                    status: Status::error(Code::StreamDisconnect),
                    response: None,
                });
            } else {
                state.pending.push_back(out);
            }
        }

        actions.push(Action::Event(ChannelEvent::Broken));

        if status.is_fatal() {
            state.status = StreamStatus::Error;
            state.error_window_start = Some(Instant::now());
            let pending_failure = status;
            self.fail_all(state, pending_failure, actions);
            return;
        }

        state.status = StreamStatus::Disconnected;
        if !state.pending.is_empty() {
            actions.push(Action::Event(ChannelEvent::Reconnecting));
            self.start_connect(state, actions);
        }
    }

    fn handle_error(self: &Arc<Self>, idx: usize, status: Status) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().expect("stream lock poisoned");
            let connecting = state
                .substreams
                .get(idx)
                .is_some_and(|sub| sub.phase == SubPhase::Connecting);
            if connecting {
                // Errors before the connection exists walk the address
                // list instead of triggering a reconnect cycle.
                self.handle_connect_failure(&mut state, idx, status, &mut actions);
            } else {
                self.fail_substream(&mut state, idx, status, &mut actions);
            }
        }
        self.perform(actions);
    }

    fn handle_read_timeout(self: &Arc<Self>, idx: usize) {
        // Inactivity with nothing outstanding is not an error; with
        // requests in flight it surfaces as per-request expiry.
        let has_in_flight = {
            let state = self.state.lock().expect("stream lock poisoned");
            !state.in_flight.is_empty()
        };
        trace!(url = %self.ctx.url, substream = idx, has_in_flight, "read timeout");
        if has_in_flight {
            self.tick(Instant::now());
        }
    }

    fn handle_write_timeout(self: &Arc<Self>, idx: usize) {
        let stuck = {
            let state = self.state.lock().expect("stream lock poisoned");
            state
                .substreams
                .get(idx)
                .is_some_and(|sub| sub.sending.is_some() || sub.handshake_out.is_some()
                    || sub.phase == SubPhase::Connecting)
        };
        if stuck {
            self.handle_error(idx, Status::error(Code::SocketTimeout));
        }
    }

    /// Periodic housekeeping: per-request expiries, queued-request
    /// expiries, idle teardown, orphan cleanup.
    pub fn tick(self: &Arc<Self>, now: Instant) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().expect("stream lock poisoned");

            let expired: Vec<u16> = state
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.paused.is_none() && entry.params.expires <= now)
                .map(|(sid, _)| *sid)
                .collect();
            for sid in expired {
                let entry = state.in_flight.remove(&sid).expect("key just listed");
                let sid_bytes = sid.to_be_bytes();
                // The response may still arrive; quarantine the SID until
                // it does.
                self.ctx.sid_manager.time_out_sid(sid_bytes);
                debug!(url = %self.ctx.url, sid, "request expired");
                actions.push(Action::Complete {
                    handler: entry.handler,
                    status: Status::error(Code::OperationExpired),
                    response: None,
                });
            }

            let mut still_pending = VecDeque::new();
            while let Some(out) = state.pending.pop_front() {
                if out.params.expires <= now {
                    if let Some(sid) = out.msg.sid() {
                        self.ctx.sid_manager.release_sid(sid);
                    }
                    actions.push(Action::Complete {
                        handler: out.handler,
                        status: Status::error(Code::OperationExpired),
                        response: None,
                    });
                } else {
                    still_pending.push_back(out);
                }
            }
            state.pending = still_pending;

            let idle_for = now.duration_since(state.last_activity);
            if state.status == StreamStatus::Connected
                && state.in_flight.is_empty()
                && state.pending.is_empty()
                && self
                    .ctx
                    .transport
                    .is_stream_ttl_expired(&self.ctx.channel_data, idle_for)
            {
                debug!(url = %self.ctx.url, "idle stream torn down");
                for i in 0..state.substreams.len() {
                    self.teardown_substream(&mut state, i);
                }
                state.substreams = vec![SubStream::idle()];
                state.status = StreamStatus::Disconnected;
                actions.push(Action::Event(ChannelEvent::Broken));
            }
        }
        self.ctx.in_queue.expire(now);
        self.perform(actions);
    }

    /// Tears the stream down. Stateful pending requests fail with
    /// `StreamDisconnect`; stateless ones stay queued for the next
    /// connection.
    pub fn force_disconnect(self: &Arc<Self>) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().expect("stream lock poisoned");
            let mut keep = VecDeque::new();

            let mut all_waiting: Vec<OutboundRequest> = state.pending.drain(..).collect();
            for sub in &mut state.substreams {
                all_waiting.extend(sub.sending.take());
                all_waiting.extend(sub.out_queue.drain(..));
            }
            for (sid, entry) in state.in_flight.drain() {
                self.ctx.sid_manager.release_sid(sid.to_be_bytes());
                actions.push(Action::Complete {
                    handler: entry.handler,
                    status: Status::error(Code::StreamDisconnect),
                    response: None,
                });
            }
            for out in all_waiting {
                if out.params.stateful {
                    if let Some(sid) = out.msg.sid() {
                        self.ctx.sid_manager.release_sid(sid);
                    }
                    actions.push(Action::Complete {
                        handler: out.handler,
                        status: Status::error(Code::StreamDisconnect),
                        response: None,
                    });
                } else {
                    keep.push_back(out);
                }
            }
            state.pending = keep;

            for i in 0..state.substreams.len() {
                self.teardown_substream(&mut state, i);
            }
            state.substreams = vec![SubStream::idle()];
            state.status = StreamStatus::Disconnected;
            state.error_window_start = None;
            self.ctx.sid_manager.release_all_timed_out();
            actions.push(Action::Event(ChannelEvent::Broken));
        }
        self.perform(actions);
    }

    /// Forces a disconnect followed by an immediate reconnect attempt when
    /// work is queued.
    pub fn force_reconnect(self: &Arc<Self>) {
        self.force_disconnect();
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().expect("stream lock poisoned");
            if !state.pending.is_empty() {
                actions.push(Action::Event(ChannelEvent::Reconnecting));
                self.start_connect(&mut state, &mut actions);
            }
        }
        self.perform(actions);
    }

    // ------------------------------------------------------------------
    // Deferred side effects
    // ------------------------------------------------------------------

    fn perform(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Complete {
                    handler,
                    status,
                    response,
                } => {
                    self.ctx
                        .job_manager
                        .queue(move || handler.handle_response(status, response));
                }
                Action::Sent(handler) => {
                    self.ctx.job_manager.queue(move || handler.on_sent());
                }
                Action::Event(event) => self.notify_event(event),
                Action::Redirect {
                    url,
                    msg,
                    handler,
                    params,
                } => {
                    let sink = self
                        .redirect_sink
                        .lock()
                        .expect("stream lock poisoned")
                        .clone();
                    let resolved = sink.and_then(|weak| weak.upgrade());
                    match resolved {
                        Some(sink) => {
                            if let Err(status) =
                                sink.resubmit(&url, msg, Arc::clone(&handler), params)
                            {
                                self.ctx
                                    .job_manager
                                    .queue(move || handler.handle_response(status, None));
                            }
                        }
                        None => {
                            self.ctx.job_manager.queue(move || {
                                handler
                                    .handle_response(Status::error(Code::Redirect), None);
                            });
                        }
                    }
                }
                Action::Park(msg) => self.ctx.in_queue.add_message(msg),
            }
        }
    }

    fn notify_event(self: &Arc<Self>, event: ChannelEvent) {
        let handlers: Vec<Arc<dyn ChannelEventHandler>> = self
            .event_handlers
            .lock()
            .expect("stream lock poisoned")
            .clone();
        let mut drop_list = Vec::new();
        for handler in &handlers {
            if !handler.on_event(event) {
                drop_list.push(Arc::clone(handler));
            }
        }
        if !drop_list.is_empty() {
            let mut registered = self.event_handlers.lock().expect("stream lock poisoned");
            registered.retain(|h| !drop_list.iter().any(|dead| Arc::ptr_eq(h, dead)));
        }

        if event == ChannelEvent::Connected {
            let job = self.on_connect.lock().expect("stream lock poisoned").clone();
            if let Some(job) = job {
                self.ctx.job_manager.queue(move || job());
            }
        }
    }
}

/// Task re-submitting a request after a server `wait`.
struct ResendTask {
    stream: Weak<Stream>,
    slot: Mutex<Option<OutboundRequest>>,
}

impl Task for ResendTask {
    fn run(&self, _now: Instant) -> Option<Instant> {
        if let Some(stream) = self.stream.upgrade() {
            if let Some(mut out) = self.slot.lock().expect("resend task lock poisoned").take() {
                out.msg.rewind();
                if let Err((status, out)) = stream.enqueue(out) {
                    warn!(%status, "wait-deferred request could not be re-queued");
                    if let Some(sid) = out.msg.sid() {
                        stream.ctx.sid_manager.release_sid(sid);
                    }
                    stream
                        .ctx
                        .job_manager
                        .queue(move || out.handler.handle_response(status, None));
                }
            }
        }
        None
    }

    fn name(&self) -> &str {
        "resend-after-wait"
    }
}

fn open_socket(addr: SocketAddr) -> XrdResult<TcpStream> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Status::from)?;
    socket.set_nonblocking(true).map_err(Status::from)?;
    socket.set_tcp_nodelay(true).map_err(Status::from)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) => return Err(Status::from(err)),
    }
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substream_starts_idle() {
        let sub = SubStream::idle();
        assert_eq!(sub.phase, SubPhase::Idle);
        assert!(sub.socket.is_none());
        assert!(sub.out_queue.is_empty());
    }

    #[test]
    fn open_socket_rejects_unroutable_fast_or_defers() {
        // Non-blocking connect either fails immediately or reports
        // in-progress; both are handled. Port 1 on localhost is almost
        // certainly closed, but the failure surfaces on write-readiness,
        // not here.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = open_socket(addr);
        // Either outcome is acceptable at this layer.
        if let Ok(sock) = result {
            drop(sock);
        }
    }
}
