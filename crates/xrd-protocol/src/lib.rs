#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `xrd_protocol` owns the XRootD wire representation: the 24-byte request
//! header and 8-byte response header, the request and status code tables,
//! typed request builders, response body parsers, and the incremental frame
//! reassembly used by the transport when draining non-blocking sockets.
//!
//! # Design
//!
//! - All multi-byte integers on the wire are big-endian; this crate owns
//!   every byte swap so nothing above it ever touches network order.
//! - [`Message`] is an owned, contiguous buffer with a cursor. Partial
//!   socket reads and writes park their progress in the cursor so the
//!   reactor can resume mid-frame.
//! - Builders in [`requests`] produce complete request frames with a zero
//!   stream id; the stream stamps the allocated SID immediately before the
//!   bytes reach the socket.
//!
//! # Invariants
//!
//! - A request frame is always `24 + dlen` bytes and a response frame
//!   `8 + dlen` bytes; the `dlen` field is authoritative.
//! - Builders never emit a frame whose `dlen` disagrees with the payload
//!   they attached.

pub mod frame;
pub mod message;
pub mod requests;
pub mod responses;
pub mod wire;

pub use frame::FrameReader;
pub use message::Message;
pub use responses::ServerResponse;
pub use wire::{RequestCode, ResponseStatus};
