//! Owned wire buffers.
//!
//! A [`Message`] is one contiguous frame: a fixed header at offset 0 and an
//! optional payload after it. The producer builds it, ownership moves down
//! the pipeline, and the consumer that completes the exchange drops it. The
//! cursor records partial progress when a frame straddles socket readiness
//! events.

use crate::wire::{
    self, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN, RequestCode, ResponseStatus,
};

/// A contiguous request or response frame.
#[derive(Clone, Debug, Default)]
pub struct Message {
    buffer: Vec<u8>,
    cursor: usize,
    description: String,
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message over an existing frame buffer.
    #[must_use]
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            cursor: 0,
            description: String::new(),
        }
    }

    /// Creates a zeroed request frame with the request code stamped in.
    ///
    /// The stream id is left as zero; the owning stream fills it in when the
    /// request is bound to a SID.
    #[must_use]
    pub fn request(code: RequestCode) -> Self {
        let mut buffer = vec![0u8; REQUEST_HEADER_LEN];
        wire::put_u16(&mut buffer, 2, code.as_u16());
        let mut msg = Self::from_vec(buffer);
        msg.description = code.name().to_owned();
        msg
    }

    /// Total frame length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whole frame as bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Whole frame as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Appends payload bytes and keeps the request `dlen` in step.
    pub fn append_payload(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() >= REQUEST_HEADER_LEN {
            let dlen = (self.buffer.len() - REQUEST_HEADER_LEN) as u32;
            wire::put_u32(&mut self.buffer, 20, dlen);
        }
    }

    /// Grows the buffer by `additional` zero bytes.
    pub fn grow(&mut self, additional: usize) {
        self.buffer.resize(self.buffer.len() + additional, 0);
    }

    /// Stream id, if a header is present.
    #[must_use]
    pub fn sid(&self) -> Option<[u8; 2]> {
        (self.buffer.len() >= 2).then(|| [self.buffer[0], self.buffer[1]])
    }

    /// Stamps the stream id into the header.
    pub fn set_sid(&mut self, sid: [u8; 2]) {
        self.buffer[0] = sid[0];
        self.buffer[1] = sid[1];
    }

    /// Request code of a request frame.
    #[must_use]
    pub fn request_code(&self) -> Option<RequestCode> {
        (self.buffer.len() >= 4).then(|| wire::get_u16(&self.buffer, 2)).and_then(RequestCode::from_u16)
    }

    /// Response status of a response frame.
    #[must_use]
    pub fn response_status(&self) -> Option<ResponseStatus> {
        (self.buffer.len() >= 4)
            .then(|| wire::get_u16(&self.buffer, 2))
            .and_then(ResponseStatus::from_u16)
    }

    /// Payload of a request frame.
    #[must_use]
    pub fn request_payload(&self) -> &[u8] {
        self.buffer.get(REQUEST_HEADER_LEN..).unwrap_or(&[])
    }

    /// Payload of a response frame.
    #[must_use]
    pub fn response_payload(&self) -> &[u8] {
        self.buffer.get(RESPONSE_HEADER_LEN..).unwrap_or(&[])
    }

    /// Bytes already sent or received.
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Advances the cursor after a partial transfer.
    pub fn advance(&mut self, bytes: usize) {
        self.cursor = (self.cursor + bytes).min(self.buffer.len());
    }

    /// Unsent or unreceived remainder of the frame.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    /// True when the cursor reached the end of the frame.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.cursor == self.buffer.len()
    }

    /// Rewinds the cursor, e.g. before re-sending on a new sub-stream.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Human-readable description used in traces.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Sets the trace description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }
}
