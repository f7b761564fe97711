#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `xrd_cache` is a disk-backed block cache that fronts the client stack.
//! Every cached file is a pair of OSS objects: a data file holding bytes at
//! their natural offsets and a `cinfo` sidecar recording the block bitmap
//! and access history. Reads are served block-wise: present blocks come
//! from disk or RAM, absent blocks are fetched upstream exactly once per
//! (file, block), written back by a writer pool, and only then marked
//! present in the bitmap.
//!
//! # Moving parts
//!
//! - [`Cache`] — attach/read/stat/detach entry points and file registry.
//! - [`oss::Oss`] — the only disk abstraction the cache talks to.
//! - [`cinfo::CInfo`] — versioned sidecar codec.
//! - [`store`] — RAM budget with sticky floor and clean-block eviction.
//! - [`prefetch`] — sequential read-ahead.
//! - [`purge`] — watermark-driven eviction of whole files.
//! - [`dirstate`] — hierarchical usage counters, snapshotable to JSON.
//! - [`config`] — `pfc.*` directive parsing.

pub mod cache;
pub mod cinfo;
pub mod config;
pub mod dirstate;
pub mod error;
pub mod file;
pub mod oss;
pub mod prefetch;
pub mod purge;
pub mod store;
pub mod upstream;

pub use cache::Cache;
pub use cinfo::CInfo;
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use file::CacheFile;
