#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `xrd_core` carries the vocabulary types shared by every layer of the
//! XRootD client stack: the [`Status`] taxonomy that transports success and
//! failure between the wire, the post office, and user handlers, the
//! [`Url`] endpoint representation used to key channels, the type-tagged
//! [`AnyBag`] that transports cache opaque per-channel session state, and the
//! [`Env`] defaults table with its environment-variable overrides.
//!
//! # Design
//!
//! - [`Status`] is a plain value (severity, code, OS errno) rather than an
//!   error enum: it crosses thread and callback boundaries by copy and is
//!   inspected, not matched exhaustively, by most consumers.
//! - [`Url`] parsing is hand-rolled: the accepted grammar is the small
//!   `scheme://[user@]host[:port]/path[?key=val&...]` subset the protocol
//!   uses, and error positions matter more than generality.
//! - [`AnyBag`] exposes typed slots over `Any` so transport plug-ins can
//!   stash negotiated session state on a channel they do not own.
//!
//! # See also
//!
//! - `xrd_protocol` for the wire representation built on these types.

pub mod any;
pub mod env;
pub mod status;
pub mod url;

pub use any::AnyBag;
pub use env::Env;
pub use status::{Code, Severity, Status};
pub use url::{Url, UrlParseError};

/// Result alias used across the stack for operations that fail with a
/// transport [`Status`].
pub type XrdResult<T> = Result<T, Status>;
