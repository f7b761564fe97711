//! Cache front end: attach, registry, worker pools, purge thread.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender, unbounded};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::cinfo::{AccessRecord, CInfo, CkSumState};
use crate::config::CacheConfig;
use crate::dirstate::{DirState, DirUsage};
use crate::error::{CacheError, CacheResult};
use crate::file::{CacheFile, FileInner};
use crate::oss::{Oss, Space, read_all, write_all};
use crate::purge::{self, PurgeStats};
use crate::store::RamBudget;
use crate::upstream::UpstreamProvider;

/// A dirty block on its way to disk.
pub(crate) struct WriteJob {
    pub(crate) path: String,
    pub(crate) index: u64,
    pub(crate) data: Arc<Vec<u8>>,
}

enum WriterMsg {
    Write(WriteJob, Arc<FileInner>),
    Stop,
}

enum PrefetchMsg {
    Fetch {
        file: Weak<FileInner>,
        first: u64,
        count: u64,
    },
    Stop,
}

/// State shared between the cache, its files, and its workers.
pub(crate) struct CacheShared {
    pub(crate) config: CacheConfig,
    pub(crate) oss: Arc<dyn Oss>,
    pub(crate) ram: RamBudget,
    pub(crate) files: Mutex<FxHashMap<String, Weak<FileInner>>>,
    pub(crate) dirstate: Mutex<DirState>,
    writer_tx: Sender<WriterMsg>,
    prefetch_tx: Sender<PrefetchMsg>,
}

impl CacheShared {
    /// Path of the cinfo sidecar for a data path.
    pub(crate) fn meta_path(path: &str) -> String {
        format!("{path}.cinfo")
    }

    pub(crate) fn write_meta(&self, path: &str, bytes: &[u8]) -> CacheResult<()> {
        write_all(self.oss.as_ref(), Space::Meta, &Self::meta_path(path), bytes)?;
        Ok(())
    }

    /// Reserves RAM for one block, evicting clean blocks when needed.
    /// Returns false when the reservation stays unaccounted.
    pub(crate) fn reserve_block(&self, bytes: u64, requester: Option<&FileInner>) -> bool {
        if self.ram.try_reserve(bytes) {
            return true;
        }
        if let Some(file) = requester {
            file.evict_clean(bytes);
            if self.ram.try_reserve(bytes) {
                return true;
            }
        }
        let others: Vec<Arc<FileInner>> = {
            let files = self.files.lock().expect("file registry lock poisoned");
            files.values().filter_map(Weak::upgrade).collect()
        };
        for file in others {
            file.evict_clean(bytes);
            if self.ram.try_reserve(bytes) {
                return true;
            }
        }
        // The ceiling is soft: the block is kept regardless, it just is
        // not accounted and will not be charged on eviction.
        false
    }

    pub(crate) fn queue_write(&self, job: WriteJob) {
        let file = {
            let files = self.files.lock().expect("file registry lock poisoned");
            files.get(&job.path).and_then(Weak::upgrade)
        };
        if let Some(file) = file {
            let _ = self.writer_tx.send(WriterMsg::Write(job, file));
        }
    }

    /// Queues a run of `count` consecutive blocks starting at `first` for
    /// background fetching.
    pub(crate) fn queue_prefetch(&self, file: &Arc<FileInner>, first: u64, count: u64) {
        if self.ram.is_tight(self.config.block_size * count.max(1)) {
            return;
        }
        let _ = self.prefetch_tx.send(PrefetchMsg::Fetch {
            file: Arc::downgrade(file),
            first,
            count,
        });
    }

    pub(crate) fn note_session(&self, path: &str, record: &AccessRecord) {
        let mut dirstate = self.dirstate.lock().expect("dirstate lock poisoned");
        dirstate.apply(
            path,
            &DirUsage {
                bytes_hit: record.bytes_hit,
                bytes_missed: record.bytes_missed,
                bytes_bypassed: record.bytes_bypassed,
                bytes_written: record.bytes_written,
                ..DirUsage::default()
            },
        );
    }
}

/// Local stat of a cached object.
#[derive(Clone, Copy, Debug)]
pub struct CacheStat {
    /// Object size in bytes.
    pub size: u64,
    /// Blocks present on disk.
    pub cached_blocks: u64,
    /// Total blocks.
    pub total_blocks: u64,
}

impl CacheStat {
    /// True when the whole object is on disk.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.cached_blocks == self.total_blocks
    }
}

/// The disk-backed block cache.
pub struct Cache {
    shared: Arc<CacheShared>,
    provider: Box<dyn UpstreamProvider>,
    writer_rx: Receiver<WriterMsg>,
    prefetch_rx: Receiver<PrefetchMsg>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    purge_signal: Arc<(Mutex<bool>, Condvar)>,
}

impl Cache {
    /// Creates the cache and starts its writer, prefetch, and purge
    /// threads.
    pub fn new(
        config: CacheConfig,
        oss: Arc<dyn Oss>,
        provider: Box<dyn UpstreamProvider>,
    ) -> Arc<Self> {
        let (writer_tx, writer_rx) = unbounded();
        let (prefetch_tx, prefetch_rx) = unbounded();

        let shared = Arc::new(CacheShared {
            ram: RamBudget::new(config.ram_bytes),
            config,
            oss,
            files: Mutex::new(FxHashMap::default()),
            dirstate: Mutex::new(DirState::new()),
            writer_tx,
            prefetch_tx,
        });

        let cache = Arc::new(Self {
            shared,
            provider,
            writer_rx,
            prefetch_rx,
            workers: Mutex::new(Vec::new()),
            purge_signal: Arc::new((Mutex::new(false), Condvar::new())),
        });
        cache.start_workers();
        cache
    }

    fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");

        for index in 0..self.shared.config.writer_threads {
            let rx = self.writer_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("pfc-writer-{index}"))
                .spawn(move || {
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            WriterMsg::Write(job, file) => write_back(&job, &file),
                            WriterMsg::Stop => break,
                        }
                    }
                })
                .expect("spawning a cache writer thread");
            workers.push(handle);
        }

        {
            let rx = self.prefetch_rx.clone();
            let handle = thread::Builder::new()
                .name("pfc-prefetch".to_owned())
                .spawn(move || {
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            PrefetchMsg::Fetch { file, first, count } => {
                                if let Some(file) = file.upgrade() {
                                    if let Err(err) = file.prefetch_span(first, count) {
                                        debug!(first, count, %err, "prefetch fetch failed");
                                    }
                                }
                            }
                            PrefetchMsg::Stop => break,
                        }
                    }
                })
                .expect("spawning the prefetch thread");
            workers.push(handle);
        }

        {
            let cache = Arc::downgrade(self);
            let signal = Arc::clone(&self.purge_signal);
            let interval = self.shared.config.disk_usage.purge_interval;
            let handle = thread::Builder::new()
                .name("pfc-purge".to_owned())
                .spawn(move || {
                    let mut cycle: u32 = 0;
                    loop {
                        {
                            let (stop, cond) = &*signal;
                            let guard = stop.lock().expect("purge signal lock poisoned");
                            let (guard, _timeout) = cond
                                .wait_timeout(guard, interval)
                                .expect("purge signal lock poisoned");
                            if *guard {
                                break;
                            }
                        }
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        cycle = cycle.wrapping_add(1);
                        match cache.run_purge_once_at(cycle) {
                            Ok(stats) if stats.removed_files > 0 => {
                                info!(
                                    removed = stats.removed_files,
                                    bytes = stats.removed_bytes,
                                    "purge cycle complete"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => warn!(%err, "purge cycle failed"),
                        }
                    }
                })
                .expect("spawning the purge thread");
            workers.push(handle);
        }
    }

    /// Attaches `path`, creating the local copy lazily.
    pub fn attach(self: &Arc<Self>, path: &str) -> CacheResult<CacheFile> {
        if let Some(inner) = {
            let files = self.shared.files.lock().expect("file registry lock poisoned");
            files.get(path).and_then(Weak::upgrade)
        } {
            inner.attachments.fetch_add(1, Ordering::SeqCst);
            return Ok(CacheFile { inner });
        }

        let upstream = self.provider.open(path)?;
        let now = unix_now();

        let meta_path = CacheShared::meta_path(path);
        let cinfo = match read_all(self.shared.oss.as_ref(), Space::Meta, &meta_path) {
            Ok(bytes) => match CInfo::deserialize(&bytes) {
                Ok(info) => {
                    let upstream_size = upstream.size()?;
                    if info.file_size() == upstream_size {
                        Some(info)
                    } else {
                        // The origin changed under us; the local copy is
                        // stale.
                        warn!(path, "cached size mismatch, invalidating");
                        self.invalidate(path);
                        None
                    }
                }
                Err(detail) => {
                    warn!(path, %detail, "corrupt cinfo, invalidating");
                    self.invalidate(path);
                    None
                }
            },
            Err(_) => None,
        };

        let cinfo = match cinfo {
            Some(info) => info,
            None => {
                let size = upstream.size()?;
                let mut info = CInfo::new(self.shared.config.block_size, size, now);
                if !self.shared.config.cschk.is_off() {
                    info.set_cksum_state(CkSumState::Unverified);
                }
                {
                    let mut dirstate =
                        self.shared.dirstate.lock().expect("dirstate lock poisoned");
                    dirstate.apply(
                        path,
                        &DirUsage {
                            files_created: 1,
                            ..DirUsage::default()
                        },
                    );
                }
                info
            }
        };

        let data = self.shared.oss.create(Space::Data, path)?;
        let inner = Arc::new(FileInner::new(
            path.to_owned(),
            Arc::clone(&self.shared),
            upstream,
            data,
            cinfo,
            now,
        ));
        inner.attachments.fetch_add(1, Ordering::SeqCst);
        inner.commit_cinfo()?;

        let mut files = self.shared.files.lock().expect("file registry lock poisoned");
        files.insert(path.to_owned(), Arc::downgrade(&inner));
        drop(files);

        debug!(path, "file attached");
        Ok(CacheFile { inner })
    }

    /// Local stat: consults the sidecar first, then the origin.
    pub fn stat(&self, path: &str) -> CacheResult<CacheStat> {
        let meta_path = CacheShared::meta_path(path);
        if let Ok(bytes) = read_all(self.shared.oss.as_ref(), Space::Meta, &meta_path) {
            if let Ok(info) = CInfo::deserialize(&bytes) {
                return Ok(CacheStat {
                    size: info.file_size(),
                    cached_blocks: info.bits_set(),
                    total_blocks: info.n_blocks(),
                });
            }
        }
        let upstream = self.provider.open(path)?;
        let size = upstream.size()?;
        Ok(CacheStat {
            size,
            cached_blocks: 0,
            total_blocks: crate::cinfo::n_blocks_for(size, self.shared.config.block_size),
        })
    }

    fn invalidate(&self, path: &str) {
        let _ = self.shared.oss.unlink(Space::Data, path);
        let _ = self
            .shared
            .oss
            .unlink(Space::Meta, &CacheShared::meta_path(path));
    }

    /// Runs one purge cycle now.
    pub fn run_purge_once(&self) -> CacheResult<PurgeStats> {
        self.run_purge_once_at(0)
    }

    fn run_purge_once_at(&self, cycle: u32) -> CacheResult<PurgeStats> {
        let shared = &self.shared;
        let active = |path: &str| -> bool {
            let files = shared.files.lock().expect("file registry lock poisoned");
            files.get(path).is_some_and(|weak| weak.strong_count() > 0)
        };
        purge::run_cycle(
            shared.oss.as_ref(),
            &shared.config,
            &shared.dirstate,
            &active,
            unix_now(),
            cycle,
        )
    }

    /// JSON snapshot of the directory usage tree.
    #[must_use]
    pub fn dirstate_snapshot(&self) -> serde_json::Value {
        self.shared
            .dirstate
            .lock()
            .expect("dirstate lock poisoned")
            .snapshot()
    }

    /// Writes the usage snapshot through the OSS meta space.
    pub fn write_dirstate_snapshot(&self, path: &str) -> CacheResult<()> {
        let snapshot = self.dirstate_snapshot();
        let rendered = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| CacheError::Io(std::io::Error::other(err)))?;
        write_all(self.shared.oss.as_ref(), Space::Meta, path, &rendered)?;
        Ok(())
    }

    /// Stops the worker threads, draining the write queue first.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        if workers.is_empty() {
            return;
        }
        for _ in 0..self.shared.config.writer_threads {
            let _ = self.shared.writer_tx.send(WriterMsg::Stop);
        }
        let _ = self.shared.prefetch_tx.send(PrefetchMsg::Stop);
        {
            let (stop, cond) = &*self.purge_signal;
            *stop.lock().expect("purge signal lock poisoned") = true;
            cond.notify_all();
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("cache shut down");
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_back(job: &WriteJob, file: &Arc<FileInner>) {
    let offset = job.index * file.block_size;
    let mut done = 0usize;
    while done < job.data.len() {
        match file.data.write_at(&job.data[done..], offset + done as u64) {
            Ok(0) => {
                warn!(path = %job.path, index = job.index, "short write to cache disk");
                return;
            }
            Ok(n) => done += n,
            Err(err) => {
                // The block stays dirty in RAM and its bit stays clear;
                // the data is simply not cacheable this time around.
                warn!(path = %job.path, index = job.index, %err, "block write-back failed");
                return;
            }
        }
    }
    if let Err(err) = file.data.sync() {
        warn!(path = %job.path, %err, "cache data sync failed");
        return;
    }

    {
        let mut cinfo = file.cinfo.lock().expect("cinfo lock poisoned");
        cinfo.set_bit(job.index);
    }
    if let Err(err) = file.commit_cinfo() {
        warn!(path = %job.path, %err, "cinfo commit failed");
        let mut cinfo = file.cinfo.lock().expect("cinfo lock poisoned");
        cinfo.clear_bit(job.index);
        return;
    }
    file.mark_clean(job.index);

    let mut dirstate = file.shared.dirstate.lock().expect("dirstate lock poisoned");
    dirstate.apply(
        &job.path,
        &DirUsage {
            st_blocks_added: (job.data.len() as u64).div_ceil(512),
            ..DirUsage::default()
        },
    );
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
