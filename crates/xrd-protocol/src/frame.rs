//! Incremental frame I/O against non-blocking sockets.
//!
//! The reactor delivers readiness, not bytes; a frame routinely arrives in
//! several pieces. [`FrameReader`] accumulates the 8-byte response header,
//! learns the body length from it, and keeps accumulating until the frame is
//! whole. [`write_message`] is the mirror image for the send side, resuming
//! from the message cursor.

use std::io::{self, Read, Write};

use crate::message::Message;
use crate::wire::{self, RESPONSE_HEADER_LEN};

/// Where a partially read frame stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameProgress {
    /// The socket ran dry mid-frame; retry on the next readiness event.
    NeedMore,
    /// A full frame is buffered and ready to be taken.
    Complete,
}

/// Reassembles one response frame at a time.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    body_len: Option<usize>,
}

impl FrameReader {
    /// Creates an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a header has been read but the body is still short.
    #[must_use]
    pub fn mid_frame(&self) -> bool {
        !self.buffer.is_empty() && !self.is_complete()
    }

    fn is_complete(&self) -> bool {
        match self.body_len {
            Some(body_len) => self.buffer.len() == RESPONSE_HEADER_LEN + body_len,
            None => false,
        }
    }

    /// Pulls bytes from `src` until the frame completes or the source would
    /// block. A clean EOF mid-frame is reported as `UnexpectedEof`; a clean
    /// EOF on a frame boundary surfaces as `ConnectionAborted` so the caller
    /// can treat it as an orderly hang-up.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<FrameProgress> {
        loop {
            if self.is_complete() {
                return Ok(FrameProgress::Complete);
            }

            let target = match self.body_len {
                Some(body_len) => RESPONSE_HEADER_LEN + body_len,
                None => RESPONSE_HEADER_LEN,
            };
            let filled = self.buffer.len();
            let mut chunk = vec![0u8; target - filled];
            match src.read(&mut chunk) {
                Ok(0) => {
                    return Err(if filled == 0 {
                        io::Error::from(io::ErrorKind::ConnectionAborted)
                    } else {
                        io::Error::from(io::ErrorKind::UnexpectedEof)
                    });
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if self.body_len.is_none() && self.buffer.len() == RESPONSE_HEADER_LEN {
                        let dlen = wire::get_u32(&self.buffer, 4) as usize;
                        self.body_len = Some(dlen);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FrameProgress::NeedMore);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Takes the completed frame and resets the reader for the next one.
    pub fn take(&mut self) -> Option<Message> {
        if !self.is_complete() {
            return None;
        }
        self.body_len = None;
        Some(Message::from_vec(std::mem::take(&mut self.buffer)))
    }
}

/// Writes as much of `msg` as the socket accepts, resuming at the message
/// cursor. Returns `true` when the whole frame has left the buffer.
pub fn write_message<W: Write>(msg: &mut Message, dst: &mut W) -> io::Result<bool> {
    while !msg.is_complete() {
        match dst.write(msg.remaining()) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => msg.advance(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
