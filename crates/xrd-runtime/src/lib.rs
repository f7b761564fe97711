#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `xrd_runtime` hosts the three scheduling primitives the client stack is
//! built on: a single-threaded socket reactor ([`Poller`]) delivering
//! readiness and per-direction timeouts, a monotonic timer wheel
//! ([`TaskManager`]) for short serialized housekeeping, and a bounded worker
//! pool ([`JobManager`]) for anything that may block.
//!
//! # Design
//!
//! - Exactly one thread runs the reactor loop. Socket handlers run on that
//!   thread and must never block; blocking work is queued to the
//!   [`JobManager`] instead.
//! - Every mutating [`Poller`] method may be called from any thread;
//!   registrations are serialized by an internal lock and the loop is woken
//!   through a [`mio::Waker`] when deadlines change.
//! - Timer tasks serialize with each other but run in parallel with
//!   everything else.

pub mod job;
pub mod poller;
pub mod task;

pub use job::{Job, JobManager};
pub use poller::{Poller, SocketEventHandler};
pub use task::{Task, TaskManager};
