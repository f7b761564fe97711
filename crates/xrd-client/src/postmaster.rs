//! Post master: the process-wide message hub.
//!
//! One instance per process. It owns the reactor, the timer wheel, the job
//! pool, and the channel directory keyed by `host:port`. Channels are
//! created lazily on first use.
//!
//! Deadlock rule: no public method invokes user callbacks while holding
//! the channel-map lock, and callers must not hold locks used inside their
//! own handlers when calling [`PostMaster::send`].

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, info};
use xrd_core::{Code, Env, Status, Url, XrdResult, env::keys};
use xrd_protocol::Message;
use xrd_runtime::{JobManager, Poller, TaskManager};

use crate::channel::Channel;
use crate::handlers::{ChannelEventHandler, MessageFilter, ResponseHandler};
use crate::msgutil::MessageSendParams;
use crate::stream::RedirectSink;
use crate::transport::{TransportCodec, TransportQuery, XrootdTransport};

/// Directory of channels plus the shared runtime they run on.
pub struct PostMaster {
    env: Arc<Env>,
    poller: Arc<Poller>,
    task_manager: Arc<TaskManager>,
    job_manager: Arc<JobManager>,
    transports: Mutex<FxHashMap<String, Arc<dyn TransportCodec>>>,
    channels: Mutex<FxHashMap<String, Arc<Channel>>>,
    self_ref: Weak<PostMaster>,
}

impl PostMaster {
    /// Creates a stopped post master over the given defaults table.
    pub fn new(env: Arc<Env>) -> XrdResult<Arc<Self>> {
        let resolution = Duration::from_secs(
            env.get_int(keys::TIMEOUT_RESOLUTION).unwrap_or(1).max(1) as u64,
        );
        let workers = env.get_int(keys::WORKER_THREADS).unwrap_or(3).max(1) as usize;

        let poller = Arc::new(Poller::new()?);
        let task_manager = Arc::new(TaskManager::new(resolution));
        let job_manager = Arc::new(JobManager::new(workers));

        let mut transports: FxHashMap<String, Arc<dyn TransportCodec>> = FxHashMap::default();
        let default_transport: Arc<dyn TransportCodec> = Arc::new(XrootdTransport::new());
        transports.insert("root".to_owned(), Arc::clone(&default_transport));
        transports.insert("xroot".to_owned(), default_transport);

        Ok(Arc::new_cyclic(|self_ref| Self {
            env,
            poller,
            task_manager,
            job_manager,
            transports: Mutex::new(transports),
            channels: Mutex::new(FxHashMap::default()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Starts the reactor, the timer wheel, and the job pool.
    pub fn start(&self) -> XrdResult<()> {
        self.poller.start()?;
        self.task_manager.start();
        self.job_manager.start();
        info!("post master started");
        Ok(())
    }

    /// Stops everything. Channels are dropped; in-flight requests fail.
    pub fn stop(&self) -> XrdResult<()> {
        self.channels.lock().expect("post master lock poisoned").clear();
        self.task_manager.stop();
        self.poller.stop()?;
        self.job_manager.stop();
        info!("post master stopped");
        Ok(())
    }

    /// Fork-child entry point: discards inherited sockets and rebuilds the
    /// runtime without re-arming anything.
    pub fn reinitialize(&self) -> XrdResult<()> {
        self.channels.lock().expect("post master lock poisoned").clear();
        self.poller.after_fork()?;
        self.poller.start()?;
        self.task_manager.start();
        self.job_manager.start();
        debug!("post master reinitialized after fork");
        Ok(())
    }

    /// Registers a transport for a URL scheme, replacing any previous one.
    pub fn register_transport(&self, scheme: &str, transport: Arc<dyn TransportCodec>) {
        self.transports
            .lock()
            .expect("post master lock poisoned")
            .insert(scheme.to_owned(), transport);
    }

    /// Sends `msg` to the endpoint named by `url`, creating the channel on
    /// first use. The handler fires on a job-pool thread.
    pub fn send(
        &self,
        url: &Url,
        msg: Message,
        handler: Arc<dyn ResponseHandler>,
        params: MessageSendParams,
    ) -> XrdResult<()> {
        let channel = self.channel(url)?;
        channel.send(msg, handler, params)
    }

    /// Blocks until a message matching `filter` arrives from `url`.
    pub fn receive(
        &self,
        url: &Url,
        filter: &dyn MessageFilter,
        timeout: Duration,
    ) -> XrdResult<Message> {
        let channel = self.channel(url)?;
        channel.receive(filter, timeout)
    }

    /// Registers a single-shot listener for unsolicited messages from
    /// `url`.
    pub fn add_listener(
        &self,
        url: &Url,
        filter: Arc<dyn MessageFilter>,
        handler: Arc<dyn ResponseHandler>,
        expires: std::time::Instant,
    ) -> XrdResult<()> {
        let channel = self.channel(url)?;
        channel.add_listener(filter, handler, expires);
        Ok(())
    }

    /// Queries the transport serving `url`.
    #[must_use]
    pub fn query_transport(&self, url: &Url, what: TransportQuery) -> Option<String> {
        let channel = self.channel(url).ok()?;
        channel.query_transport(what)
    }

    /// Registers a channel-event observer on `url`'s channel.
    pub fn register_event_handler(
        &self,
        url: &Url,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> XrdResult<()> {
        let channel = self.channel(url)?;
        channel.register_event_handler(handler);
        Ok(())
    }

    /// Removes a channel-event observer from `url`'s channel.
    pub fn remove_event_handler(
        &self,
        url: &Url,
        handler: &Arc<dyn ChannelEventHandler>,
    ) -> XrdResult<()> {
        let channel = self.channel(url)?;
        channel.remove_event_handler(handler);
        Ok(())
    }

    /// Installs a callback run each time `url`'s channel connects.
    pub fn set_on_connect_handler(
        &self,
        url: &Url,
        job: Arc<dyn Fn() + Send + Sync>,
    ) -> XrdResult<()> {
        let channel = self.channel(url)?;
        channel.set_on_connect(job);
        Ok(())
    }

    /// Shuts down `url`'s channel connections.
    pub fn force_disconnect(&self, url: &Url) -> XrdResult<()> {
        let channel = {
            let channels = self.channels.lock().expect("post master lock poisoned");
            channels.get(&url.host_id()).cloned()
        };
        if let Some(channel) = channel {
            channel.force_disconnect();
        }
        Ok(())
    }

    /// Number of connected sub-streams on `url`'s channel, zero when the
    /// channel does not exist.
    #[must_use]
    pub fn connected_substreams(&self, url: &Url) -> usize {
        let channels = self.channels.lock().expect("post master lock poisoned");
        channels
            .get(&url.host_id())
            .map_or(0, |channel| channel.connected_substreams())
    }

    /// The shared timer wheel.
    #[must_use]
    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// The shared job pool.
    #[must_use]
    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.job_manager
    }

    /// Looks up or creates the channel for `url`. The map lock is never
    /// held while the channel is used.
    fn channel(&self, url: &Url) -> XrdResult<Arc<Channel>> {
        let key = url.host_id();
        {
            let channels = self.channels.lock().expect("post master lock poisoned");
            if let Some(channel) = channels.get(&key) {
                return Ok(Arc::clone(channel));
            }
        }

        let transport = {
            let transports = self.transports.lock().expect("post master lock poisoned");
            transports
                .get(url.scheme())
                .cloned()
                .ok_or_else(|| Status::error(Code::NotSupported))?
        };

        let channel = Channel::new(
            url.clone(),
            transport,
            Arc::clone(&self.poller),
            Arc::clone(&self.task_manager),
            Arc::clone(&self.job_manager),
            Arc::clone(&self.env),
        );
        let sink: Weak<dyn RedirectSink> = self.self_ref.clone();
        channel.set_redirect_sink(sink);

        let mut channels = self.channels.lock().expect("post master lock poisoned");
        let entry = channels.entry(key).or_insert(channel);
        Ok(Arc::clone(entry))
    }
}

impl RedirectSink for PostMaster {
    fn resubmit(
        &self,
        url: &Url,
        msg: Message,
        handler: Arc<dyn ResponseHandler>,
        params: MessageSendParams,
    ) -> XrdResult<()> {
        self.send(url, msg, handler, params)
    }
}
