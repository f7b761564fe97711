#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `xrd_client` is the connection, multiplexing, and recovery core of the
//! stack. The [`PostMaster`] is the process-wide front door: it owns one
//! [`Channel`] per endpoint, each driving a [`Stream`](stream::Stream) of
//! one or more sub-streams over the shared reactor. Request/response pairs
//! are correlated by 16-bit stream ids handed out by the per-channel
//! [`SidManager`]; arrived-but-unclaimed messages park in the [`InQueue`].
//! On top of the transport sit the stateful [`FileStateHandler`] with its
//! redirect-following and recovery semantics and the stateless
//! [`FileSystem`] admin operations.
//!
//! # Concurrency
//!
//! Socket I/O, handshakes, and stream state transitions happen on the
//! reactor thread. User-facing completion handlers are dispatched through
//! the job manager so the reactor never blocks on user code. The post
//! master never holds its channel-map lock while invoking callbacks.

pub mod channel;
pub mod file;
pub mod filesystem;
pub mod handlers;
pub mod inqueue;
pub mod msgutil;
pub mod postmaster;
pub mod resolver;
pub mod rsync;
pub mod sid;
pub mod stream;
pub mod transport;

pub use channel::Channel;
pub use file::{FileStateHandler, FileStatus};
pub use filesystem::FileSystem;
pub use handlers::{
    ChannelEvent, ChannelEventHandler, MessageFilter, ResponseHandler,
};
pub use inqueue::InQueue;
pub use msgutil::{MessageSendParams, SyncResponseHandler};
pub use postmaster::PostMaster;
pub use rsync::RequestSync;
pub use sid::SidManager;
pub use transport::{TransportCodec, XrootdTransport};
