//! Upstream data sources.
//!
//! The cache treats the client stack as its origin: every miss becomes an
//! ordinary read against the federation. The traits here keep that seam
//! narrow so tests (and exotic deployments) can substitute their own
//! origin.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use xrd_core::{Env, Url};
use xrd_client::{FileStateHandler, FileSystem, PostMaster};
use xrd_protocol::requests::OpenFlags;

use crate::error::{CacheError, CacheResult};

/// An open upstream file.
pub trait UpstreamFile: Send + Sync {
    /// Size of the upstream object.
    fn size(&self) -> CacheResult<u64>;
    /// Reads `len` bytes at `offset`; short only at end of file.
    fn read(&self, offset: u64, len: u32) -> CacheResult<Vec<u8>>;
}

/// Opens upstream files by cache path.
pub trait UpstreamProvider: Send + Sync {
    /// Opens `path` for reading.
    fn open(&self, path: &str) -> CacheResult<Box<dyn UpstreamFile>>;
}

/// Origin backed by the client stack: misses turn into federation reads.
pub struct ClientUpstream {
    postmaster: Arc<PostMaster>,
    env: Arc<Env>,
    origin: Url,
    timeout: Duration,
}

impl ClientUpstream {
    /// Creates an origin rooted at `origin` (typically a manager URL).
    pub fn new(postmaster: Arc<PostMaster>, env: Arc<Env>, origin: Url) -> Self {
        Self {
            postmaster,
            env,
            origin,
            timeout: Duration::from_secs(60),
        }
    }
}

impl UpstreamProvider for ClientUpstream {
    fn open(&self, path: &str) -> CacheResult<Box<dyn UpstreamFile>> {
        let url = self.origin.with_path(path);
        let file = FileStateHandler::new(Arc::clone(&self.postmaster), Arc::clone(&self.env));
        file.open_sync(&url.to_string(), OpenFlags::READ, 0, Some(self.timeout))
            .map_err(CacheError::from)?;

        let size = match file.cached_stat() {
            Some(stat) => stat.size,
            None => {
                // Not every server attaches stat info to the open reply.
                let fs = FileSystem::new(
                    Arc::clone(&self.postmaster),
                    self.origin.clone(),
                    Arc::clone(&self.env),
                );
                fs.stat_sync(path, Some(self.timeout))
                    .map_err(CacheError::from)?
                    .size
            }
        };

        Ok(Box::new(ClientUpstreamFile {
            file,
            size,
            timeout: self.timeout,
        }))
    }
}

struct ClientUpstreamFile {
    file: Arc<FileStateHandler>,
    size: u64,
    timeout: Duration,
}

impl UpstreamFile for ClientUpstreamFile {
    fn size(&self) -> CacheResult<u64> {
        Ok(self.size)
    }

    fn read(&self, offset: u64, len: u32) -> CacheResult<Vec<u8>> {
        self.file
            .read_sync(offset, len, Some(self.timeout))
            .map_err(CacheError::from)
    }
}

impl Drop for ClientUpstreamFile {
    fn drop(&mut self) {
        if self.file.is_open() {
            if let Err(status) = self.file.close_sync(Some(Duration::from_secs(10))) {
                warn!(%status, "upstream close failed");
            }
        }
    }
}

/// In-memory origin for tests and embedding.
pub struct MemoryUpstream {
    files: std::sync::Mutex<rustc_hash::FxHashMap<String, Arc<Vec<u8>>>>,
    reads: std::sync::atomic::AtomicUsize,
}

impl MemoryUpstream {
    /// Creates an empty origin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: std::sync::Mutex::new(rustc_hash::FxHashMap::default()),
            reads: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Inserts an object.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .expect("memory upstream lock poisoned")
            .insert(path.to_owned(), Arc::new(bytes));
    }

    /// Number of reads served, across all files.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamProvider for Arc<MemoryUpstream> {
    fn open(&self, path: &str) -> CacheResult<Box<dyn UpstreamFile>> {
        let bytes = self
            .files
            .lock()
            .expect("memory upstream lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| {
                CacheError::Upstream(xrd_core::Status::error(xrd_core::Code::NotFound))
            })?;
        Ok(Box::new(MemoryUpstreamFile {
            origin: Arc::clone(self),
            bytes,
        }))
    }
}

struct MemoryUpstreamFile {
    origin: Arc<MemoryUpstream>,
    bytes: Arc<Vec<u8>>,
}

impl UpstreamFile for MemoryUpstreamFile {
    fn size(&self) -> CacheResult<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn read(&self, offset: u64, len: u32) -> CacheResult<Vec<u8>> {
        self.origin
            .reads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let start = (offset as usize).min(self.bytes.len());
        let end = (start + len as usize).min(self.bytes.len());
        Ok(self.bytes[start..end].to_vec())
    }
}
