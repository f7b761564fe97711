//! Stateful open-file handling.
//!
//! Layers open/read/write/close semantics over the post master. The
//! handler remembers three URLs: the virtual URL the user opened, the data
//! server that actually answered, and the load balancer used for recovery.
//! Open follows redirects itself (rather than letting the stream do it) so
//! the final data server is known; stateful data operations pin the data
//! server and never follow redirects silently.
//!
//! Recovery: a disconnection, a stale session, or a redirect on an
//! in-progress request parks the affected operations on the recovery
//! queue, re-opens the file, splices the fresh file handle into each
//! parked request, and re-issues them. Read-only opens may recover
//! anywhere the load balancer points; writable opens only at the same data
//! server, so acknowledged bytes cannot be lost silently.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use xrd_core::{Code, Env, Status, Url, XrdResult, env::keys};
use xrd_protocol::requests::{self, OpenFlags, ReadChunk};
use xrd_protocol::{Message, responses};

use crate::handlers::ResponseHandler;
use crate::msgutil::{MessageSendParams, SyncResponseHandler};
use crate::postmaster::PostMaster;
use crate::transport::TransportQuery;

/// Query classes used by `fcntl` and `visa`.
const QUERY_VISA: u16 = 8;
const QUERY_OPAQUE_FILE: u16 = 64;

/// State of a file handled by [`FileStateHandler`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileStatus {
    /// Not open.
    Closed,
    /// `open` is on the wire.
    OpenInProgress,
    /// Open and usable.
    Opened,
    /// Re-opening after a recoverable error.
    Recovering,
    /// `close` is on the wire.
    CloseInProgress,
    /// A non-recoverable failure occurred.
    Error,
}

/// Monitoring counters emitted at close.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileMetrics {
    /// Bytes delivered by plain reads.
    pub bytes_read: u64,
    /// Bytes delivered by vector reads.
    pub bytes_vread: u64,
    /// Bytes accepted by writes.
    pub bytes_written: u64,
    /// Number of plain reads.
    pub read_count: u64,
    /// Number of vector reads.
    pub vread_count: u64,
    /// Segments across all vector reads.
    pub vread_segments: u64,
    /// Adjacent vector-read segments coalesced before hitting the wire.
    pub merged_chunks: u64,
    /// Number of writes.
    pub write_count: u64,
}

struct QueuedOp {
    msg: Message,
    handler: Arc<dyn ResponseHandler>,
    kind: OpKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OpKind {
    Read,
    VectorRead { segments: u64, merges: u64 },
    Write { bytes: u64 },
    Stat,
    Other,
}

struct FileState {
    status: FileStatus,
    ever_opened: bool,
    virtual_url: Option<Url>,
    data_server: Option<Url>,
    load_balancer: Option<Url>,
    fhandle: Option<[u8; 4]>,
    open_flags: OpenFlags,
    open_mode: u16,
    session_id: Option<String>,
    redirects_left: u8,
    to_be_recovered: Vec<QueuedOp>,
    pending_close: Option<(Arc<dyn ResponseHandler>, Option<Duration>)>,
    metrics: FileMetrics,
    opened_at: Option<Instant>,
    cached_stat: Option<responses::StatInfo>,
}

/// Stateful handler for one open file.
pub struct FileStateHandler {
    postmaster: Arc<PostMaster>,
    env: Arc<Env>,
    state: Mutex<FileState>,
    self_ref: Weak<FileStateHandler>,
}

impl FileStateHandler {
    /// Creates a closed handler bound to the given post master.
    pub fn new(postmaster: Arc<PostMaster>, env: Arc<Env>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            postmaster,
            env,
            state: Mutex::new(FileState {
                status: FileStatus::Closed,
                ever_opened: false,
                virtual_url: None,
                data_server: None,
                load_balancer: None,
                fhandle: None,
                open_flags: OpenFlags::READ,
                open_mode: 0,
                session_id: None,
                redirects_left: 16,
                to_be_recovered: Vec::new(),
                pending_close: None,
                metrics: FileMetrics::default(),
                opened_at: None,
                cached_stat: None,
            }),
            self_ref: self_ref.clone(),
        })
    }

    fn default_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| {
            Duration::from_secs(
                self.env.get_int(keys::REQUEST_TIMEOUT).unwrap_or(1800).max(1) as u64,
            )
        })
    }

    fn redirect_limit(&self) -> u8 {
        self.env.get_int(keys::REDIRECT_LIMIT).unwrap_or(16).clamp(1, 255) as u8
    }

    /// Current state.
    #[must_use]
    pub fn status(&self) -> FileStatus {
        self.state.lock().expect("file state lock poisoned").status
    }

    /// True when the file is open and usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status() == FileStatus::Opened
    }

    /// The data server currently holding the open file.
    #[must_use]
    pub fn data_server(&self) -> Option<Url> {
        self.state
            .lock()
            .expect("file state lock poisoned")
            .data_server
            .clone()
    }

    /// The load balancer used for read-only recovery.
    #[must_use]
    pub fn load_balancer(&self) -> Option<Url> {
        self.state
            .lock()
            .expect("file state lock poisoned")
            .load_balancer
            .clone()
    }

    /// Session identity the file was opened under, as hex.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("file state lock poisoned")
            .session_id
            .clone()
    }

    /// Snapshot of the monitoring counters.
    #[must_use]
    pub fn metrics(&self) -> FileMetrics {
        self.state.lock().expect("file state lock poisoned").metrics
    }

    /// Stat information captured at open or by the last `stat` call.
    #[must_use]
    pub fn cached_stat(&self) -> Option<responses::StatInfo> {
        self.state
            .lock()
            .expect("file state lock poisoned")
            .cached_stat
            .clone()
    }

    // ------------------------------------------------------------------
    // Open / close
    // ------------------------------------------------------------------

    /// Opens the file at `url` asynchronously.
    pub fn open(
        &self,
        url: &str,
        flags: OpenFlags,
        mode: u16,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        let url = Url::parse(url).map_err(|_| Status::error(Code::InvalidArgs))?;
        {
            let mut state = self.state.lock().expect("file state lock poisoned");
            if state.status != FileStatus::Closed && state.status != FileStatus::Error {
                return Err(Status::error(Code::InvalidArgs));
            }
            state.status = FileStatus::OpenInProgress;
            state.virtual_url = Some(url.clone());
            state.load_balancer = Some(url.clone());
            state.open_flags = flags;
            state.open_mode = mode;
            state.redirects_left = self.redirect_limit();
        }
        self.issue_open(&url, handler, self.default_timeout(timeout), false)
    }

    fn issue_open(
        &self,
        target: &Url,
        handler: Arc<dyn ResponseHandler>,
        timeout: Duration,
        recovering: bool,
    ) -> XrdResult<()> {
        let (flags, mode) = {
            let state = self.state.lock().expect("file state lock poisoned");
            (state.open_flags, state.open_mode)
        };
        let msg = requests::open(target.path(), flags, mode);
        let wrapper = Arc::new(OpenHandler {
            file: self.self_ref.clone(),
            user: handler,
            target: target.clone(),
            timeout,
            recovering,
        });
        let params = MessageSendParams {
            expires: Instant::now() + timeout,
            stateful: true,
            follow_redirects: false,
            redirect_budget: 0,
        };
        self.postmaster.send(target, msg, wrapper, params)
    }

    /// Synchronous open.
    pub fn open_sync(
        &self,
        url: &str,
        flags: OpenFlags,
        mode: u16,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        let handler = Arc::new(SyncResponseHandler::new());
        self.open(url, flags, mode, handler.clone(), timeout)?;
        let (status, _) = handler.wait();
        status.into_result()
    }

    /// Closes the file asynchronously. Idempotent for an already-closed
    /// file that was open before; a close issued while the open is still
    /// on the wire defers until the open settles; fails with `FileClosed`
    /// when the file was never opened.
    pub fn close(
        &self,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        let (target, fhandle) = {
            let mut state = self.state.lock().expect("file state lock poisoned");
            match state.status {
                FileStatus::Opened => {}
                FileStatus::Closed if state.ever_opened => {
                    drop(state);
                    self.postmaster
                        .job_manager()
                        .queue(move || handler.handle_response(Status::OK, None));
                    return Ok(());
                }
                FileStatus::OpenInProgress => {
                    if state.pending_close.is_some() {
                        return Err(Status::error(Code::InvalidArgs));
                    }
                    state.pending_close = Some((handler, timeout));
                    return Ok(());
                }
                _ => return Err(Status::error(Code::FileClosed)),
            }
            state.status = FileStatus::CloseInProgress;
            (
                state.data_server.clone().ok_or_else(|| Status::error(Code::InternalError))?,
                state.fhandle.ok_or_else(|| Status::error(Code::InternalError))?,
            )
        };

        let msg = requests::close(fhandle);
        let wrapper = Arc::new(CloseHandler {
            file: self.self_ref.clone(),
            user: handler,
        });
        let params = MessageSendParams {
            expires: Instant::now() + self.default_timeout(timeout),
            stateful: true,
            follow_redirects: false,
            redirect_budget: 0,
        };
        self.postmaster.send(&target, msg, wrapper, params)
    }

    /// Synchronous close.
    pub fn close_sync(&self, timeout: Option<Duration>) -> XrdResult<()> {
        let handler = Arc::new(SyncResponseHandler::new());
        self.close(handler.clone(), timeout)?;
        let (status, _) = handler.wait();
        status.into_result()
    }

    // ------------------------------------------------------------------
    // Data operations
    // ------------------------------------------------------------------

    /// Reads `size` bytes at `offset` asynchronously. The response payload
    /// carries the data.
    pub fn read(
        &self,
        offset: u64,
        size: u32,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.issue_stateful(
            |fhandle| requests::read(fhandle, offset, size),
            OpKind::Read,
            handler,
            timeout,
        )
    }

    /// Synchronous read, returning the delivered bytes.
    pub fn read_sync(
        &self,
        offset: u64,
        size: u32,
        timeout: Option<Duration>,
    ) -> XrdResult<Vec<u8>> {
        let handler = Arc::new(SyncResponseHandler::new());
        self.read(offset, size, handler.clone(), timeout)?;
        let (status, response) = handler.wait();
        status.into_result()?;
        Ok(response.map(|msg| msg.response_payload().to_vec()).unwrap_or_default())
    }

    /// Writes `data` at `offset` asynchronously.
    pub fn write(
        &self,
        offset: u64,
        data: &[u8],
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        let bytes = data.len() as u64;
        self.issue_stateful(
            |fhandle| requests::write(fhandle, offset, data),
            OpKind::Write { bytes },
            handler,
            timeout,
        )
    }

    /// Synchronous write.
    pub fn write_sync(&self, offset: u64, data: &[u8], timeout: Option<Duration>) -> XrdResult<()> {
        let handler = Arc::new(SyncResponseHandler::new());
        self.write(offset, data, handler.clone(), timeout)?;
        let (status, _) = handler.wait();
        status.into_result()
    }

    /// Reads scattered chunks in one round trip. Adjacent chunks are
    /// coalesced into single segments before the request is built.
    pub fn vector_read(
        &self,
        chunks: &[ReadChunk],
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        let segments = chunks.len() as u64;
        let coalesced = coalesce_chunks(chunks);
        let merges = segments - coalesced.len() as u64;
        self.issue_stateful(
            |fhandle| requests::readv(fhandle, &coalesced),
            OpKind::VectorRead { segments, merges },
            handler,
            timeout,
        )
    }

    /// Commits pending server-side writes.
    pub fn sync(
        &self,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.issue_stateful(requests::sync, OpKind::Other, handler, timeout)
    }

    /// Truncates the open file to `size`.
    pub fn truncate(
        &self,
        size: u64,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.issue_stateful(
            |fhandle| requests::truncate_handle(fhandle, size),
            OpKind::Other,
            handler,
            timeout,
        )
    }

    /// Stats the open file. `force` bypasses the cached result.
    pub fn stat(
        &self,
        force: bool,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        if !force {
            let cached = self
                .state
                .lock()
                .expect("file state lock poisoned")
                .cached_stat
                .clone();
            if cached.is_some() {
                self.postmaster
                    .job_manager()
                    .queue(move || handler.handle_response(Status::OK, None));
                return Ok(());
            }
        }
        self.issue_stateful(requests::stat_handle, OpKind::Stat, handler, timeout)
    }

    /// Performs a server-defined control operation on the open file.
    pub fn fcntl(
        &self,
        arg: &[u8],
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.issue_stateful(
            |fhandle| requests::query(QUERY_OPAQUE_FILE, Some(fhandle), arg),
            OpKind::Other,
            handler,
            timeout,
        )
    }

    /// Obtains an access token for the open file.
    pub fn visa(
        &self,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.issue_stateful(
            |fhandle| requests::query(QUERY_VISA, Some(fhandle), &[]),
            OpKind::Other,
            handler,
            timeout,
        )
    }

    fn issue_stateful(
        &self,
        build: impl FnOnce([u8; 4]) -> Message,
        kind: OpKind,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        let (target, fhandle) = {
            let mut state = self.state.lock().expect("file state lock poisoned");
            match state.status {
                FileStatus::Opened => (
                    state
                        .data_server
                        .clone()
                        .ok_or_else(|| Status::error(Code::InternalError))?,
                    state.fhandle.ok_or_else(|| Status::error(Code::InternalError))?,
                ),
                FileStatus::Recovering => {
                    // Park the operation; it is re-issued once the re-open
                    // lands.
                    let msg = build(state.fhandle.unwrap_or_default());
                    state.to_be_recovered.push(QueuedOp { msg, handler, kind });
                    return Ok(());
                }
                FileStatus::Closed | FileStatus::Error => {
                    return Err(Status::error(Code::FileClosed));
                }
                _ => return Err(Status::error(Code::InvalidArgs)),
            }
        };

        let msg = build(fhandle);
        self.send_stateful(&target, msg, kind, handler, self.default_timeout(timeout))
    }

    fn send_stateful(
        &self,
        target: &Url,
        msg: Message,
        kind: OpKind,
        handler: Arc<dyn ResponseHandler>,
        timeout: Duration,
    ) -> XrdResult<()> {
        let wrapper = Arc::new(StatefulHandler {
            file: self.self_ref.clone(),
            user: handler,
            request: msg.clone(),
            kind,
        });
        let params = MessageSendParams {
            expires: Instant::now() + timeout,
            stateful: true,
            follow_redirects: false,
            redirect_budget: 0,
        };
        self.postmaster.send(target, msg, wrapper, params)
    }

    // ------------------------------------------------------------------
    // Completion plumbing
    // ------------------------------------------------------------------

    fn on_open_response(
        &self,
        status: Status,
        response: Option<Message>,
        user: &Arc<dyn ResponseHandler>,
        target: &Url,
        timeout: Duration,
        recovering: bool,
    ) {
        if status.code() == Code::Redirect {
            // Follow the redirect ourselves so the final host is recorded.
            let redirect = response
                .as_ref()
                .and_then(|msg| responses::parse_redirect(msg.response_payload()).ok());
            let can_hop = {
                let mut state = self.state.lock().expect("file state lock poisoned");
                if state.redirects_left == 0 {
                    false
                } else {
                    state.redirects_left -= 1;
                    true
                }
            };
            if let (Some(redirect), true) = (redirect, can_hop) {
                let port = if redirect.port > 0 {
                    redirect.port as u16
                } else {
                    xrd_core::url::DEFAULT_PORT
                };
                let path = {
                    let state = self.state.lock().expect("file state lock poisoned");
                    state
                        .virtual_url
                        .as_ref()
                        .map(|u| u.path().to_owned())
                        .unwrap_or_default()
                };
                let next = format!("{}://{}:{}{}", target.scheme(), redirect.host, port, path);
                match Url::parse(&next) {
                    Ok(next_url) => {
                        debug!(from = %target, to = %next_url, "open redirected");
                        if let Err(err) =
                            self.issue_open(&next_url, Arc::clone(user), timeout, recovering)
                        {
                            self.fail_open(err, user, recovering);
                        }
                        return;
                    }
                    Err(parse_err) => {
                        warn!(%parse_err, "redirect target does not parse");
                    }
                }
            }
            self.fail_open(Status::error(Code::FileOpenFailed), user, recovering);
            return;
        }

        if status.is_error() {
            let reported = if status.code() == Code::ServerError
                || status.code() == Code::NotFound
                || status.code() == Code::AuthFailed
            {
                Status::error(Code::FileOpenFailed).with_errno(status.errno())
            } else {
                status
            };
            self.fail_open(reported, user, recovering);
            return;
        }

        let Some(body) = response
            .as_ref()
            .and_then(|msg| responses::parse_open(msg.response_payload()).ok())
        else {
            self.fail_open(Status::error(Code::FileOpenFailed), user, recovering);
            return;
        };

        let session = self
            .postmaster
            .query_transport(target, TransportQuery::SessionId);

        let (reissue, pending_close) = {
            let mut state = self.state.lock().expect("file state lock poisoned");
            state.status = FileStatus::Opened;
            state.ever_opened = true;
            state.data_server = Some(target.clone());
            state.fhandle = Some(body.fhandle);
            state.session_id = session;
            state.cached_stat = body.stat.clone();
            if state.opened_at.is_none() {
                state.opened_at = Some(Instant::now());
            }
            (
                std::mem::take(&mut state.to_be_recovered),
                state.pending_close.take(),
            )
        };
        debug!(url = %target, recovering, "file opened");

        // Re-issue everything that waited for recovery, with the fresh
        // handle spliced in.
        for op in reissue {
            let QueuedOp { mut msg, handler, kind } = op;
            requests::rewrite_file_handle(&mut msg, body.fhandle);
            msg.rewind();
            let timeout = self.default_timeout(None);
            if let Err(err) = self.send_stateful(target, msg, kind, Arc::clone(&handler), timeout) {
                self.postmaster
                    .job_manager()
                    .queue(move || handler.handle_response(err, None));
            }
        }

        let user = Arc::clone(user);
        self.postmaster
            .job_manager()
            .queue(move || user.handle_response(Status::OK, None));

        // A close issued while the open was still on the wire runs now.
        if let Some((close_handler, close_timeout)) = pending_close {
            let fallback = Arc::clone(&close_handler);
            if let Err(err) = self.close(close_handler, close_timeout) {
                self.postmaster
                    .job_manager()
                    .queue(move || fallback.handle_response(err, None));
            }
        }
    }

    fn fail_open(&self, status: Status, user: &Arc<dyn ResponseHandler>, recovering: bool) {
        let (parked, pending_close) = {
            let mut state = self.state.lock().expect("file state lock poisoned");
            state.status = FileStatus::Error;
            (
                std::mem::take(&mut state.to_be_recovered),
                state.pending_close.take(),
            )
        };
        warn!(%status, recovering, "open failed");
        for op in parked {
            let QueuedOp { handler, .. } = op;
            let failure = status;
            self.postmaster
                .job_manager()
                .queue(move || handler.handle_response(failure, None));
        }
        if let Some((close_handler, _timeout)) = pending_close {
            self.postmaster
                .job_manager()
                .queue(move || close_handler.handle_response(status, None));
        }
        let user = Arc::clone(user);
        self.postmaster
            .job_manager()
            .queue(move || user.handle_response(status, None));
    }

    fn on_stateful_response(
        &self,
        status: Status,
        response: Option<Message>,
        user: Arc<dyn ResponseHandler>,
        request: Message,
        kind: OpKind,
    ) {
        if status.is_ok() {
            let mut state = self.state.lock().expect("file state lock poisoned");
            match kind {
                OpKind::Read => {
                    state.metrics.read_count += 1;
                    state.metrics.bytes_read += response
                        .as_ref()
                        .map(|msg| msg.response_payload().len() as u64)
                        .unwrap_or(0);
                }
                OpKind::VectorRead { segments, merges } => {
                    state.metrics.vread_count += 1;
                    state.metrics.vread_segments += segments;
                    state.metrics.merged_chunks += merges;
                    state.metrics.bytes_vread += response
                        .as_ref()
                        .map(|msg| msg.response_payload().len() as u64)
                        .unwrap_or(0);
                }
                OpKind::Write { bytes } => {
                    state.metrics.write_count += 1;
                    state.metrics.bytes_written += bytes;
                }
                OpKind::Stat => {
                    state.cached_stat = response
                        .as_ref()
                        .and_then(|msg| responses::parse_stat(msg.response_payload()).ok());
                }
                OpKind::Other => {}
            }
            drop(state);
            self.postmaster
                .job_manager()
                .queue(move || user.handle_response(status, response));
            return;
        }

        if self.should_recover(status) {
            self.queue_for_recovery(request, user, kind);
            return;
        }

        self.postmaster
            .job_manager()
            .queue(move || user.handle_response(status, response));
    }

    fn should_recover(&self, status: Status) -> bool {
        if status.is_fatal() {
            return false;
        }
        matches!(
            status.code(),
            Code::StreamDisconnect | Code::InvalidSession | Code::Redirect | Code::StreamBroken
        )
    }

    fn queue_for_recovery(
        &self,
        request: Message,
        handler: Arc<dyn ResponseHandler>,
        kind: OpKind,
    ) {
        let begin = {
            let mut state = self.state.lock().expect("file state lock poisoned");
            state.to_be_recovered.push(QueuedOp {
                msg: request,
                handler,
                kind,
            });
            if state.status == FileStatus::Opened {
                state.status = FileStatus::Recovering;
                true
            } else {
                false
            }
        };
        if begin {
            self.begin_recovery();
        }
    }

    fn begin_recovery(&self) {
        let (target, timeout) = {
            let state = self.state.lock().expect("file state lock poisoned");
            // Writable opens only recover at the same data server so that
            // acknowledged appends are not silently lost elsewhere.
            let target = if state.open_flags.is_writable() {
                state.data_server.clone()
            } else {
                state.load_balancer.clone().or_else(|| state.data_server.clone())
            };
            (target, self.default_timeout(None))
        };

        let Some(target) = target else {
            self.abort_recovery(Status::error(Code::InternalError));
            return;
        };

        info!(url = %target, "recovering open file");
        let noop: Arc<dyn ResponseHandler> = Arc::new(RecoveryNotice);
        if let Err(err) = self.issue_open(&target, noop, timeout, true) {
            self.abort_recovery(err);
        }
    }

    fn abort_recovery(&self, status: Status) {
        let parked = {
            let mut state = self.state.lock().expect("file state lock poisoned");
            state.status = FileStatus::Error;
            std::mem::take(&mut state.to_be_recovered)
        };
        for op in parked {
            let QueuedOp { handler, .. } = op;
            self.postmaster
                .job_manager()
                .queue(move || handler.handle_response(status, None));
        }
    }

    fn on_close_response(&self, status: Status, user: Arc<dyn ResponseHandler>) {
        let (metrics, open_duration) = {
            let mut state = self.state.lock().expect("file state lock poisoned");
            state.status = FileStatus::Closed;
            state.fhandle = None;
            (
                state.metrics,
                state.opened_at.map(|at| at.elapsed()),
            )
        };
        info!(
            open_seconds = open_duration.map_or(0, |d| d.as_secs()),
            bytes_read = metrics.bytes_read,
            bytes_vread = metrics.bytes_vread,
            bytes_written = metrics.bytes_written,
            reads = metrics.read_count,
            vreads = metrics.vread_count,
            vread_segments = metrics.vread_segments,
            merged_chunks = metrics.merged_chunks,
            writes = metrics.write_count,
            close_status = %status,
            "file closed"
        );
        self.postmaster
            .job_manager()
            .queue(move || user.handle_response(status, None));
    }
}

/// Merges chunks whose byte ranges touch into single segments, keeping
/// list order. A merge is skipped when the combined length would not fit
/// the wire's 32-bit segment length.
fn coalesce_chunks(chunks: &[ReadChunk]) -> Vec<ReadChunk> {
    let mut out: Vec<ReadChunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if let Some(last) = out.last_mut() {
            let contiguous = last.offset + u64::from(last.length) == chunk.offset;
            let combined = u64::from(last.length) + u64::from(chunk.length);
            if contiguous && combined <= u64::from(u32::MAX) {
                last.length = combined as u32;
                continue;
            }
        }
        out.push(*chunk);
    }
    out
}

/// Wrapper completing an `open` exchange.
struct OpenHandler {
    file: Weak<FileStateHandler>,
    user: Arc<dyn ResponseHandler>,
    target: Url,
    timeout: Duration,
    recovering: bool,
}

impl ResponseHandler for OpenHandler {
    fn handle_response(&self, status: Status, response: Option<Message>) {
        if let Some(file) = self.file.upgrade() {
            file.on_open_response(
                status,
                response,
                &self.user,
                &self.target,
                self.timeout,
                self.recovering,
            );
        }
    }
}

/// Wrapper completing a stateful data operation.
struct StatefulHandler {
    file: Weak<FileStateHandler>,
    user: Arc<dyn ResponseHandler>,
    request: Message,
    kind: OpKind,
}

impl ResponseHandler for StatefulHandler {
    fn handle_response(&self, status: Status, response: Option<Message>) {
        if let Some(file) = self.file.upgrade() {
            file.on_stateful_response(
                status,
                response,
                Arc::clone(&self.user),
                self.request.clone(),
                self.kind,
            );
        }
    }
}

/// Wrapper completing a `close` exchange.
struct CloseHandler {
    file: Weak<FileStateHandler>,
    user: Arc<dyn ResponseHandler>,
}

impl ResponseHandler for CloseHandler {
    fn handle_response(&self, status: Status, _response: Option<Message>) {
        if let Some(file) = self.file.upgrade() {
            file.on_close_response(status, Arc::clone(&self.user));
        }
    }
}

/// Placeholder user handler for recovery re-opens; the parked operations
/// carry the real user handlers.
struct RecoveryNotice;

impl ResponseHandler for RecoveryNotice {
    fn handle_response(&self, status: Status, _response: Option<Message>) {
        if status.is_error() {
            warn!(%status, "recovery open completed with failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, length: u32) -> ReadChunk {
        ReadChunk { offset, length }
    }

    #[test]
    fn metrics_start_at_zero() {
        let metrics = FileMetrics::default();
        assert_eq!(metrics.bytes_read, 0);
        assert_eq!(metrics.merged_chunks, 0);
        assert_eq!(metrics.write_count, 0);
    }

    #[test]
    fn op_kind_carries_accounting_payload() {
        let kind = OpKind::Write { bytes: 512 };
        assert!(matches!(kind, OpKind::Write { bytes: 512 }));
        let kind = OpKind::VectorRead {
            segments: 8,
            merges: 3,
        };
        assert!(matches!(
            kind,
            OpKind::VectorRead {
                segments: 8,
                merges: 3
            }
        ));
    }

    #[test]
    fn adjacent_chunks_coalesce_into_one_segment() {
        let merged = coalesce_chunks(&[chunk(0, 100), chunk(100, 100), chunk(200, 50)]);
        assert_eq!(merged, vec![chunk(0, 250)]);
    }

    #[test]
    fn gaps_keep_segments_apart() {
        let merged = coalesce_chunks(&[chunk(0, 100), chunk(200, 100), chunk(300, 100)]);
        assert_eq!(merged, vec![chunk(0, 100), chunk(200, 200)]);
    }

    #[test]
    fn out_of_order_chunks_are_not_reordered() {
        let chunks = [chunk(500, 10), chunk(0, 10), chunk(10, 10)];
        let merged = coalesce_chunks(&chunks);
        assert_eq!(merged, vec![chunk(500, 10), chunk(0, 20)]);
    }

    #[test]
    fn merge_never_overflows_the_segment_length() {
        let merged = coalesce_chunks(&[chunk(0, u32::MAX), chunk(u64::from(u32::MAX), 16)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn empty_chunk_list_stays_empty() {
        assert!(coalesce_chunks(&[]).is_empty());
    }
}
