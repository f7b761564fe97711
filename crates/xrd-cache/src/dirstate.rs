//! Hierarchical usage counters.
//!
//! Every cache event is attributed to the directory chain of its path, so
//! the purge policy can weigh whole subtrees and operators can snapshot
//! usage as JSON.

use std::collections::BTreeMap;

use serde::Serialize;

/// Counter deltas attributable to one directory subtree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DirUsage {
    /// Bytes served from present blocks.
    pub bytes_hit: u64,
    /// Bytes fetched from upstream.
    pub bytes_missed: u64,
    /// Bytes passed through without caching.
    pub bytes_bypassed: u64,
    /// Bytes written into the cache.
    pub bytes_written: u64,
    /// 512-byte disk blocks added by writes and fetches.
    pub st_blocks_added: u64,
    /// 512-byte disk blocks removed by purges.
    pub st_blocks_removed: u64,
    /// Cached files created.
    pub files_created: u64,
    /// Cached files removed.
    pub files_removed: u64,
    /// Checksum verification failures.
    pub cksum_errors: u64,
}

impl DirUsage {
    fn accumulate(&mut self, delta: &DirUsage) {
        self.bytes_hit += delta.bytes_hit;
        self.bytes_missed += delta.bytes_missed;
        self.bytes_bypassed += delta.bytes_bypassed;
        self.bytes_written += delta.bytes_written;
        self.st_blocks_added += delta.st_blocks_added;
        self.st_blocks_removed += delta.st_blocks_removed;
        self.files_created += delta.files_created;
        self.files_removed += delta.files_removed;
        self.cksum_errors += delta.cksum_errors;
    }
}

/// One directory node: subtree totals plus children.
#[derive(Debug, Default, Serialize)]
pub struct DirNode {
    /// Totals for this node's entire subtree.
    pub usage: DirUsage,
    /// Child directories by name.
    pub dirs: BTreeMap<String, DirNode>,
}

/// Usage tree rooted at the cache root.
#[derive(Debug, Default, Serialize)]
pub struct DirState {
    root: DirNode,
}

impl DirState {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `delta` to every node on the directory chain of `path`.
    /// The final path component is treated as the file name and does not
    /// create a node.
    pub fn apply(&mut self, path: &str, delta: &DirUsage) {
        self.root.usage.accumulate(delta);
        let mut node = &mut self.root;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return;
        }
        for dir in &components[..components.len() - 1] {
            node = node.dirs.entry((*dir).to_owned()).or_default();
            node.usage.accumulate(delta);
        }
    }

    /// Totals for the subtree at `path` (`"/"` for the root).
    #[must_use]
    pub fn usage_at(&self, path: &str) -> Option<DirUsage> {
        let mut node = &self.root;
        for dir in path.split('/').filter(|c| !c.is_empty()) {
            node = node.dirs.get(dir)?;
        }
        Some(node.usage)
    }

    /// Serializes the whole tree.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
