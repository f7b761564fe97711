//! Stateless filesystem operations against a manager or data server.
//!
//! Unlike file I/O these carry no session-bound handle, so server
//! redirects are followed transparently by the stream and a `wait`
//! response simply re-arms the request. Every operation exists in an async
//! form taking a handler and a sync form built on
//! [`SyncResponseHandler`].

use std::sync::Arc;
use std::time::Duration;

use xrd_core::{Code, Env, Status, Url, XrdResult, env::keys};
use xrd_protocol::requests;
use xrd_protocol::responses::{
    self, LocateEntry, StatInfo, StatVfsInfo,
};
use xrd_protocol::{Message, wire};

use crate::handlers::ResponseHandler;
use crate::msgutil::{MessageSendParams, SyncResponseHandler};
use crate::postmaster::PostMaster;

/// Stateless operations rooted at one endpoint.
pub struct FileSystem {
    postmaster: Arc<PostMaster>,
    url: Url,
    env: Arc<Env>,
}

impl FileSystem {
    /// Creates a filesystem façade for `url`.
    pub fn new(postmaster: Arc<PostMaster>, url: Url, env: Arc<Env>) -> Self {
        Self {
            postmaster,
            url,
            env,
        }
    }

    /// Endpoint the operations are sent to.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn params(&self, timeout: Option<Duration>) -> MessageSendParams {
        let timeout = timeout.unwrap_or_else(|| {
            Duration::from_secs(
                self.env.get_int(keys::REQUEST_TIMEOUT).unwrap_or(1800).max(1) as u64,
            )
        });
        let hops = self.env.get_int(keys::REDIRECT_LIMIT).unwrap_or(16).clamp(1, 255) as u8;
        MessageSendParams::with_timeout(timeout, hops)
    }

    fn submit(
        &self,
        msg: Message,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.postmaster.send(&self.url, msg, handler, self.params(timeout))
    }

    fn submit_sync(&self, msg: Message, timeout: Option<Duration>) -> XrdResult<Message> {
        let handler = Arc::new(SyncResponseHandler::new());
        self.submit(msg, handler.clone(), timeout)?;
        let (status, response) = handler.wait();
        status.into_result()?;
        response.ok_or_else(|| Status::error(Code::InternalError))
    }

    /// Locates replicas of `path` on the federation.
    pub fn locate(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::locate(path, 0), handler, timeout)
    }

    /// Synchronous [`FileSystem::locate`].
    pub fn locate_sync(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> XrdResult<Vec<LocateEntry>> {
        let response = self.submit_sync(requests::locate(path, 0), timeout)?;
        responses::parse_locate(response.response_payload())
            .map_err(|_| Status::error(Code::ServerError))
    }

    /// Renames `source` to `dest`.
    pub fn mv(
        &self,
        source: &str,
        dest: &str,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::mv(source, dest), handler, timeout)
    }

    /// Synchronous [`FileSystem::mv`].
    pub fn mv_sync(&self, source: &str, dest: &str, timeout: Option<Duration>) -> XrdResult<()> {
        self.submit_sync(requests::mv(source, dest), timeout).map(|_| ())
    }

    /// Removes the file at `path`.
    pub fn rm(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::rm(path), handler, timeout)
    }

    /// Synchronous [`FileSystem::rm`].
    pub fn rm_sync(&self, path: &str, timeout: Option<Duration>) -> XrdResult<()> {
        self.submit_sync(requests::rm(path), timeout).map(|_| ())
    }

    /// Creates the directory at `path`.
    pub fn mkdir(
        &self,
        path: &str,
        make_parents: bool,
        mode: u16,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::mkdir(path, make_parents, mode), handler, timeout)
    }

    /// Synchronous [`FileSystem::mkdir`].
    pub fn mkdir_sync(
        &self,
        path: &str,
        make_parents: bool,
        mode: u16,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit_sync(requests::mkdir(path, make_parents, mode), timeout)
            .map(|_| ())
    }

    /// Removes the directory at `path`.
    pub fn rmdir(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::rmdir(path), handler, timeout)
    }

    /// Synchronous [`FileSystem::rmdir`].
    pub fn rmdir_sync(&self, path: &str, timeout: Option<Duration>) -> XrdResult<()> {
        self.submit_sync(requests::rmdir(path), timeout).map(|_| ())
    }

    /// Changes the access mode of `path`.
    pub fn chmod(
        &self,
        path: &str,
        mode: u16,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::chmod(path, mode), handler, timeout)
    }

    /// Synchronous [`FileSystem::chmod`].
    pub fn chmod_sync(&self, path: &str, mode: u16, timeout: Option<Duration>) -> XrdResult<()> {
        self.submit_sync(requests::chmod(path, mode), timeout).map(|_| ())
    }

    /// Probes the endpoint for liveness.
    pub fn ping(
        &self,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::ping(), handler, timeout)
    }

    /// Synchronous [`FileSystem::ping`].
    pub fn ping_sync(&self, timeout: Option<Duration>) -> XrdResult<()> {
        self.submit_sync(requests::ping(), timeout).map(|_| ())
    }

    /// Stats `path`.
    pub fn stat(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::stat_path(path), handler, timeout)
    }

    /// Synchronous [`FileSystem::stat`].
    pub fn stat_sync(&self, path: &str, timeout: Option<Duration>) -> XrdResult<StatInfo> {
        let response = self.submit_sync(requests::stat_path(path), timeout)?;
        responses::parse_stat(response.response_payload())
            .map_err(|_| Status::error(Code::ServerError))
    }

    /// Queries filesystem usage below `path`.
    pub fn statvfs(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::statvfs(path), handler, timeout)
    }

    /// Synchronous [`FileSystem::statvfs`].
    pub fn statvfs_sync(&self, path: &str, timeout: Option<Duration>) -> XrdResult<StatVfsInfo> {
        let response = self.submit_sync(requests::statvfs(path), timeout)?;
        responses::parse_statvfs(response.response_payload())
            .map_err(|_| Status::error(Code::ServerError))
    }

    /// Queries the server's protocol version and role.
    pub fn protocol(
        &self,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::protocol(wire::PROTOCOL_VERSION), handler, timeout)
    }

    /// Synchronous [`FileSystem::protocol`], returning `(version, flags)`.
    pub fn protocol_sync(&self, timeout: Option<Duration>) -> XrdResult<(i32, i32)> {
        let response = self.submit_sync(requests::protocol(wire::PROTOCOL_VERSION), timeout)?;
        let body = response.response_payload();
        if body.len() < 8 {
            return Err(Status::error(Code::ServerError));
        }
        Ok((wire::get_i32(body, 0), wire::get_i32(body, 4)))
    }

    /// Lists the directory at `path`.
    pub fn dirlist(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::dirlist(path), handler, timeout)
    }

    /// Synchronous [`FileSystem::dirlist`].
    pub fn dirlist_sync(&self, path: &str, timeout: Option<Duration>) -> XrdResult<Vec<String>> {
        let response = self.submit_sync(requests::dirlist(path), timeout)?;
        Ok(responses::parse_dirlist(response.response_payload()))
    }

    /// Truncates the file at `path` to `size`.
    pub fn truncate(
        &self,
        path: &str,
        size: u64,
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::truncate_path(path, size), handler, timeout)
    }

    /// Synchronous [`FileSystem::truncate`].
    pub fn truncate_sync(&self, path: &str, size: u64, timeout: Option<Duration>) -> XrdResult<()> {
        self.submit_sync(requests::truncate_path(path, size), timeout)
            .map(|_| ())
    }

    /// Issues an information query of class `what` with `args`.
    pub fn query(
        &self,
        what: u16,
        args: &[u8],
        handler: Arc<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.submit(requests::query(what, None, args), handler, timeout)
    }

    /// Synchronous [`FileSystem::query`], returning the raw response body.
    pub fn query_sync(&self, what: u16, args: &[u8], timeout: Option<Duration>) -> XrdResult<Vec<u8>> {
        let response = self.submit_sync(requests::query(what, None, args), timeout)?;
        Ok(response.response_payload().to_vec())
    }
}
