//! Per-file cache logic: block lookup, single-flight fetch, eviction.
//!
//! A read splits into blocks. Each block is served from RAM (a live
//! [`BlockSlot`]), from disk (bitmap bit set), or from upstream. At most
//! one upstream fetch runs per (file, block): the slot map holds the
//! single-flight token and later readers wait on the slot's condvar.
//! Fetched blocks become readable immediately and are queued to the
//! writer pool; the bitmap bit is set only after the bytes are safely on
//! disk.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use xrd_core::Status;

use crate::cache::{CacheShared, WriteJob};
use crate::cinfo::{AccessRecord, CInfo};
use crate::error::{CacheError, CacheResult};
use crate::oss::OssFile;
use crate::prefetch::PrefetchState;
use crate::upstream::UpstreamFile;

/// Upstream fetch retry schedule.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) enum SlotState {
    Fetching,
    Ready {
        data: Arc<Vec<u8>>,
        dirty: bool,
        accounted: bool,
    },
    Failed(Status),
}

/// One RAM-resident (or in-flight) block.
pub(crate) struct BlockSlot {
    pub(crate) state: Mutex<SlotState>,
    pub(crate) ready: Condvar,
}

impl BlockSlot {
    fn fetching() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Fetching),
            ready: Condvar::new(),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Origin {
    Ram,
    Disk,
    Upstream,
}

pub(crate) struct FileInner {
    pub(crate) path: String,
    pub(crate) shared: Arc<CacheShared>,
    pub(crate) upstream: Box<dyn UpstreamFile>,
    pub(crate) data: Box<dyn OssFile>,
    pub(crate) cinfo: Mutex<CInfo>,
    pub(crate) blocks: Mutex<FxHashMap<u64, Arc<BlockSlot>>>,
    resident: Mutex<VecDeque<u64>>,
    session: Mutex<AccessRecord>,
    prefetch: Mutex<PrefetchState>,
    pub(crate) attachments: AtomicUsize,
    pub(crate) file_size: u64,
    pub(crate) block_size: u64,
}

impl FileInner {
    pub(crate) fn new(
        path: String,
        shared: Arc<CacheShared>,
        upstream: Box<dyn UpstreamFile>,
        data: Box<dyn OssFile>,
        cinfo: CInfo,
        attach_time: i64,
    ) -> Self {
        let file_size = cinfo.file_size();
        let block_size = cinfo.block_size();
        Self {
            path,
            shared,
            upstream,
            data,
            cinfo: Mutex::new(cinfo),
            blocks: Mutex::new(FxHashMap::default()),
            resident: Mutex::new(VecDeque::new()),
            session: Mutex::new(AccessRecord {
                attach_time,
                ..AccessRecord::default()
            }),
            prefetch: Mutex::new(PrefetchState::new()),
            attachments: AtomicUsize::new(0),
            file_size,
            block_size,
        }
    }

    fn block_span(&self, index: u64) -> (u64, usize) {
        let start = index * self.block_size;
        let len = self.block_size.min(self.file_size - start) as usize;
        (start, len)
    }

    /// True when the block can be served without touching upstream.
    pub(crate) fn is_local(&self, index: u64) -> bool {
        if self
            .cinfo
            .lock()
            .expect("cinfo lock poisoned")
            .test_bit(index)
        {
            return true;
        }
        self.blocks
            .lock()
            .expect("block map lock poisoned")
            .contains_key(&index)
    }

    /// Serves one whole block, fetching it upstream if needed.
    pub(crate) fn block_data(&self, index: u64) -> CacheResult<Arc<Vec<u8>>> {
        let (data, origin) = self.block_data_traced(index)?;
        trace!(path = %self.path, index, ?origin, "block served");
        Ok(data)
    }

    fn block_data_traced(&self, index: u64) -> CacheResult<(Arc<Vec<u8>>, Origin)> {
        enum Plan {
            Wait(Arc<BlockSlot>),
            Fetch(Arc<BlockSlot>),
            Disk,
        }

        let (start, len) = self.block_span(index);
        loop {
            let plan = {
                let mut blocks = self.blocks.lock().expect("block map lock poisoned");
                if let Some(slot) = blocks.get(&index) {
                    Plan::Wait(Arc::clone(slot))
                } else if self
                    .cinfo
                    .lock()
                    .expect("cinfo lock poisoned")
                    .test_bit(index)
                {
                    Plan::Disk
                } else {
                    let slot = BlockSlot::fetching();
                    blocks.insert(index, Arc::clone(&slot));
                    Plan::Fetch(slot)
                }
            };

            match plan {
                Plan::Disk => {
                    let mut buf = vec![0u8; len];
                    let mut done = 0;
                    while done < len {
                        let n = self.data.read_at(&mut buf[done..], start + done as u64)?;
                        if n == 0 {
                            return Err(CacheError::Io(std::io::Error::from(
                                std::io::ErrorKind::UnexpectedEof,
                            )));
                        }
                        done += n;
                    }
                    return Ok((Arc::new(buf), Origin::Disk));
                }
                Plan::Wait(slot) => {
                    let mut state = slot.state.lock().expect("block slot lock poisoned");
                    loop {
                        match &*state {
                            SlotState::Fetching => {
                                state = slot
                                    .ready
                                    .wait(state)
                                    .expect("block slot lock poisoned");
                            }
                            SlotState::Ready { data, .. } => {
                                return Ok((Arc::clone(data), Origin::Ram));
                            }
                            SlotState::Failed(status) => {
                                return Err(CacheError::Upstream(*status));
                            }
                        }
                    }
                }
                Plan::Fetch(slot) => {
                    return self.fetch_block(index, start, len, &slot);
                }
            }
        }
    }

    fn fetch_block(
        &self,
        index: u64,
        start: u64,
        len: usize,
        slot: &Arc<BlockSlot>,
    ) -> CacheResult<(Arc<Vec<u8>>, Origin)> {
        match self.fetch_with_retry(start, len as u32) {
            Ok(bytes) => {
                let data = Arc::new(bytes);
                self.finalize_fetched(index, Arc::clone(&data), slot);
                Ok((data, Origin::Upstream))
            }
            Err(err) => {
                let status = match &err {
                    CacheError::Upstream(status) => *status,
                    _ => Status::error(xrd_core::Code::InternalError),
                };
                self.fail_slot(index, slot, status);
                Err(err)
            }
        }
    }

    /// Publishes a fetched block: readers may use it immediately, the
    /// writer pool persists it, and only then does the bitmap bit flip.
    fn finalize_fetched(&self, index: u64, data: Arc<Vec<u8>>, slot: &Arc<BlockSlot>) {
        let len = data.len() as u64;
        let accounted = self.shared.reserve_block(len, Some(self));
        {
            let mut state = slot.state.lock().expect("block slot lock poisoned");
            *state = SlotState::Ready {
                data: Arc::clone(&data),
                dirty: true,
                accounted,
            };
        }
        slot.ready.notify_all();
        self.resident
            .lock()
            .expect("resident list lock poisoned")
            .push_back(index);
        self.shared.queue_write(WriteJob {
            path: self.path.clone(),
            index,
            data,
        });
    }

    /// Fails one claimed slot and removes it so a later read can retry
    /// the block; the failure poisons only the waiters of this attempt.
    fn fail_slot(&self, index: u64, slot: &Arc<BlockSlot>, status: Status) {
        {
            let mut state = slot.state.lock().expect("block slot lock poisoned");
            *state = SlotState::Failed(status);
        }
        slot.ready.notify_all();
        self.blocks
            .lock()
            .expect("block map lock poisoned")
            .remove(&index);
        warn!(path = %self.path, index, %status, "block fetch failed");
    }

    /// Background read-ahead over `count` blocks starting at `first`.
    /// Still-missing blocks are claimed under one lock and contiguous
    /// claims are merged into single upstream reads.
    pub(crate) fn prefetch_span(&self, first: u64, count: u64) -> CacheResult<()> {
        let n_blocks = crate::cinfo::n_blocks_for(self.file_size, self.block_size);
        let claims: Vec<(u64, Vec<Arc<BlockSlot>>)> = {
            let mut blocks = self.blocks.lock().expect("block map lock poisoned");
            let cinfo = self.cinfo.lock().expect("cinfo lock poisoned");
            let mut claims: Vec<(u64, Vec<Arc<BlockSlot>>)> = Vec::new();
            for index in first..(first + count).min(n_blocks) {
                if blocks.contains_key(&index) || cinfo.test_bit(index) {
                    continue;
                }
                let slot = BlockSlot::fetching();
                blocks.insert(index, Arc::clone(&slot));
                match claims.last_mut() {
                    Some((start, slots)) if *start + slots.len() as u64 == index => {
                        slots.push(slot);
                    }
                    _ => claims.push((index, vec![slot])),
                }
            }
            claims
        };

        let mut first_error = None;
        for (start, slots) in claims {
            if let Err(err) = self.fetch_span(start, &slots) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fetches `slots.len()` consecutive claimed blocks with one upstream
    /// read and publishes them block-wise.
    fn fetch_span(&self, start_index: u64, slots: &[Arc<BlockSlot>]) -> CacheResult<()> {
        let count = slots.len() as u64;
        let (span_start, _) = self.block_span(start_index);
        let (last_start, last_len) = self.block_span(start_index + count - 1);
        let span_len = (last_start + last_len as u64 - span_start) as usize;

        let bytes = match self.fetch_with_retry(span_start, span_len as u32) {
            Ok(bytes) if bytes.len() == span_len => bytes,
            Ok(short) => {
                let status = Status::error(xrd_core::Code::InternalError);
                debug!(
                    path = %self.path,
                    expected = span_len,
                    got = short.len(),
                    "short span read"
                );
                for (i, slot) in slots.iter().enumerate() {
                    self.fail_slot(start_index + i as u64, slot, status);
                }
                return Err(CacheError::Upstream(status));
            }
            Err(err) => {
                let status = match &err {
                    CacheError::Upstream(status) => *status,
                    _ => Status::error(xrd_core::Code::InternalError),
                };
                for (i, slot) in slots.iter().enumerate() {
                    self.fail_slot(start_index + i as u64, slot, status);
                }
                return Err(err);
            }
        };

        if count > 1 {
            // Adjacent blocks went out as one request.
            let mut session = self.session.lock().expect("session lock poisoned");
            session.num_merges += (count - 1) as u32;
        }

        for (i, slot) in slots.iter().enumerate() {
            let index = start_index + i as u64;
            let (block_start, block_len) = self.block_span(index);
            let rel = (block_start - span_start) as usize;
            let data = Arc::new(bytes[rel..rel + block_len].to_vec());
            self.finalize_fetched(index, data, slot);
        }
        Ok(())
    }

    fn fetch_with_retry(&self, offset: u64, len: u32) -> CacheResult<Vec<u8>> {
        let mut backoff = FETCH_BACKOFF;
        let mut last = None;
        for attempt in 0..FETCH_ATTEMPTS {
            match self.upstream.read(offset, len) {
                Ok(bytes) => return Ok(bytes),
                Err(CacheError::Upstream(status)) if status.is_recoverable() => {
                    debug!(path = %self.path, attempt, %status, "transient upstream error");
                    last = Some(CacheError::Upstream(status));
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            CacheError::Upstream(Status::error(xrd_core::Code::InternalError))
        }))
    }

    /// Evicts clean, unreferenced blocks until `need` bytes fit or
    /// nothing evictable remains. Returns the bytes released.
    pub(crate) fn evict_clean(&self, need: u64) -> u64 {
        let mut released = 0u64;
        let mut attempts = self
            .resident
            .lock()
            .expect("resident list lock poisoned")
            .len();
        while released < need && attempts > 0 {
            attempts -= 1;
            let candidate = {
                let mut resident = self.resident.lock().expect("resident list lock poisoned");
                resident.pop_front()
            };
            let Some(index) = candidate else {
                break;
            };
            let (_, len) = self.block_span(index);

            let mut blocks = self.blocks.lock().expect("block map lock poisoned");
            let Some(slot) = blocks.get(&index) else {
                continue;
            };
            let evictable = {
                let state = slot.state.lock().expect("block slot lock poisoned");
                matches!(
                    &*state,
                    SlotState::Ready {
                        dirty: false,
                        ..
                    }
                )
            };
            if !evictable || !self.shared.ram.may_evict(len as u64) {
                // Still dirty or protected by the sticky floor; keep it
                // resident at the back of the queue.
                drop(blocks);
                self.resident
                    .lock()
                    .expect("resident list lock poisoned")
                    .push_back(index);
                if !evictable {
                    continue;
                }
                break;
            }
            let accounted = {
                let state = slot.state.lock().expect("block slot lock poisoned");
                match &*state {
                    SlotState::Ready { accounted, .. } => *accounted,
                    _ => false,
                }
            };
            blocks.remove(&index);
            drop(blocks);
            if accounted {
                self.shared.ram.release(len as u64);
                released += len as u64;
            }
        }
        released
    }

    /// Marks a block clean after the writer persisted it.
    pub(crate) fn mark_clean(&self, index: u64) {
        let blocks = self.blocks.lock().expect("block map lock poisoned");
        if let Some(slot) = blocks.get(&index) {
            let mut state = slot.state.lock().expect("block slot lock poisoned");
            if let SlotState::Ready { dirty, .. } = &mut *state {
                *dirty = false;
            }
        }
    }

    /// Serializes the cinfo sidecar to the meta space.
    pub(crate) fn commit_cinfo(&self) -> CacheResult<()> {
        let bytes = self
            .cinfo
            .lock()
            .expect("cinfo lock poisoned")
            .serialize();
        self.shared.write_meta(&self.path, &bytes)?;
        Ok(())
    }

    fn account(&self, origin: Origin, bytes: u64) {
        let mut session = self.session.lock().expect("session lock poisoned");
        match origin {
            Origin::Ram | Origin::Disk => session.bytes_hit += bytes,
            Origin::Upstream => session.bytes_missed += bytes,
        }
    }

    pub(crate) fn finish_session(&self, detach_time: i64) {
        let record = {
            let mut session = self.session.lock().expect("session lock poisoned");
            session.detach_time = detach_time;
            *session
        };
        {
            let mut cinfo = self.cinfo.lock().expect("cinfo lock poisoned");
            cinfo.record_access(record);
        }
        if let Err(err) = self.commit_cinfo() {
            warn!(path = %self.path, %err, "failed to commit access record");
        }
        self.shared.note_session(&self.path, &record);
    }
}

/// A file attached to the cache.
pub struct CacheFile {
    pub(crate) inner: Arc<FileInner>,
}

impl std::fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl CacheFile {
    /// Cache path of this file.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Size of the cached object.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.file_size
    }

    /// Block size recorded for this file.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.inner.block_size
    }

    /// Fraction of blocks already on disk, in [0, 1].
    #[must_use]
    pub fn cached_fraction(&self) -> f64 {
        let cinfo = self.inner.cinfo.lock().expect("cinfo lock poisoned");
        if cinfo.n_blocks() == 0 {
            return 1.0;
        }
        cinfo.bits_set() as f64 / cinfo.n_blocks() as f64
    }

    /// Reads up to `len` bytes at `offset`. Reads past end of file are
    /// shortened; a read entirely past the end returns an empty buffer.
    pub fn read(&self, offset: u64, len: usize) -> CacheResult<Vec<u8>> {
        let inner = &self.inner;
        if len == 0 || offset >= inner.file_size {
            return Ok(Vec::new());
        }
        let end = (offset + len as u64).min(inner.file_size);
        let first = offset / inner.block_size;
        let last = (end - 1) / inner.block_size;

        {
            let mut session = inner.session.lock().expect("session lock poisoned");
            session.num_ios += 1;
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        for index in first..=last {
            let (block_start, block_len) = inner.block_span(index);
            let (data, origin) = inner.block_data_traced(index)?;

            let copy_from = offset.max(block_start) - block_start;
            let copy_to = (end.min(block_start + block_len as u64)) - block_start;
            out.extend_from_slice(&data[copy_from as usize..copy_to as usize]);
            inner.account(origin, copy_to - copy_from);
        }

        // Sequential readers pull the next blocks in behind them;
        // consecutive targets travel as one run so the prefetcher can
        // merge them into a single upstream read.
        let targets = {
            let mut prefetch = inner.prefetch.lock().expect("prefetch lock poisoned");
            prefetch.advise(
                last,
                inner.shared.config.prefetch_max_blocks,
                crate::cinfo::n_blocks_for(inner.file_size, inner.block_size),
            )
        };
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for target in targets {
            if inner.is_local(target) {
                continue;
            }
            match runs.last_mut() {
                Some((start, count)) if *start + *count == target => *count += 1,
                _ => runs.push((target, 1)),
            }
        }
        for (run_start, run_count) in runs {
            inner.shared.queue_prefetch(&self.inner, run_start, run_count);
        }

        Ok(out)
    }

    /// Session counters so far.
    #[must_use]
    pub fn session_stats(&self) -> AccessRecord {
        *self.inner.session.lock().expect("session lock poisoned")
    }
}

impl Drop for CacheFile {
    fn drop(&mut self) {
        if self.inner.attachments.fetch_sub(1, Ordering::SeqCst) == 1 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            self.inner.finish_session(now);
        }
    }
}
