//! Wire-level constants and conversions.
//!
//! Numeric values follow the XRootD protocol reference: request codes from
//! 3000, response statuses from 4000, server error numbers from 3000. The
//! handshake preamble and its fixed reply are defined here as well.

use xrd_core::{Code, Status};

/// Length of a client request header.
pub const REQUEST_HEADER_LEN: usize = 24;
/// Length of a server response header.
pub const RESPONSE_HEADER_LEN: usize = 8;
/// Length of the session id issued at login.
pub const SESSION_ID_LEN: usize = 16;
/// Length of the opaque server-assigned file handle.
pub const FILE_HANDLE_LEN: usize = 4;
/// Length of the initial client handshake frame.
pub const HANDSHAKE_REQUEST_LEN: usize = 20;
/// Length of the handshake reply body (after its response header).
pub const HANDSHAKE_RESPONSE_BODY_LEN: usize = 8;
/// Protocol version this implementation advertises.
pub const PROTOCOL_VERSION: i32 = 0x0310;

/// Client request codes recognized by the core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
#[non_exhaustive]
pub enum RequestCode {
    /// Authentication exchange (not initiated by this client).
    Auth = 3000,
    /// Information query.
    Query = 3001,
    /// Change access mode.
    Chmod = 3002,
    /// Close an open file.
    Close = 3003,
    /// List a directory.
    Dirlist = 3004,
    /// Protocol version and capability query.
    Protocol = 3006,
    /// Session login.
    Login = 3007,
    /// Create a directory.
    Mkdir = 3008,
    /// Rename a path.
    Mv = 3009,
    /// Open a file.
    Open = 3010,
    /// Liveness probe.
    Ping = 3011,
    /// Read from an open file.
    Read = 3013,
    /// Remove a file.
    Rm = 3014,
    /// Remove a directory.
    Rmdir = 3015,
    /// Commit pending writes.
    Sync = 3016,
    /// Stat a path or open file.
    Stat = 3017,
    /// Write to an open file.
    Write = 3019,
    /// End a session.
    EndSess = 3023,
    /// Bind an additional sub-stream to a session.
    Bind = 3024,
    /// Vector read.
    ReadV = 3025,
    /// Locate a file on the federation.
    Locate = 3027,
    /// Truncate a file.
    Truncate = 3028,
}

impl RequestCode {
    /// Decodes a wire value.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            3000 => Self::Auth,
            3001 => Self::Query,
            3002 => Self::Chmod,
            3003 => Self::Close,
            3004 => Self::Dirlist,
            3006 => Self::Protocol,
            3007 => Self::Login,
            3008 => Self::Mkdir,
            3009 => Self::Mv,
            3010 => Self::Open,
            3011 => Self::Ping,
            3013 => Self::Read,
            3014 => Self::Rm,
            3015 => Self::Rmdir,
            3016 => Self::Sync,
            3017 => Self::Stat,
            3019 => Self::Write,
            3023 => Self::EndSess,
            3024 => Self::Bind,
            3025 => Self::ReadV,
            3027 => Self::Locate,
            3028 => Self::Truncate,
            _ => return None,
        })
    }

    /// Wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Lower-case name used in message descriptions and traces.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Query => "query",
            Self::Chmod => "chmod",
            Self::Close => "close",
            Self::Dirlist => "dirlist",
            Self::Protocol => "protocol",
            Self::Login => "login",
            Self::Mkdir => "mkdir",
            Self::Mv => "mv",
            Self::Open => "open",
            Self::Ping => "ping",
            Self::Read => "read",
            Self::Rm => "rm",
            Self::Rmdir => "rmdir",
            Self::Sync => "sync",
            Self::Stat => "stat",
            Self::Write => "write",
            Self::EndSess => "endsess",
            Self::Bind => "bind",
            Self::ReadV => "readv",
            Self::Locate => "locate",
            Self::Truncate => "truncate",
        }
    }
}

/// Server response statuses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum ResponseStatus {
    /// Final, successful response.
    Ok = 0,
    /// Partial response, more data follows under the same stream id.
    OkSoFar = 4000,
    /// Asynchronous server notification, not tied to a request.
    Attn = 4001,
    /// The server wants another authentication round.
    AuthMore = 4002,
    /// The request failed; the body carries an error number and text.
    Error = 4003,
    /// Retry the request at the host given in the body.
    Redirect = 4004,
    /// Retry the same request after the number of seconds in the body.
    Wait = 4005,
    /// The response will arrive later as an unsolicited message.
    WaitResp = 4006,
}

impl ResponseStatus {
    /// Decodes a wire value.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            4000 => Self::OkSoFar,
            4001 => Self::Attn,
            4002 => Self::AuthMore,
            4003 => Self::Error,
            4004 => Self::Redirect,
            4005 => Self::Wait,
            4006 => Self::WaitResp,
            _ => return None,
        })
    }

    /// Wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Maps a server error number (body of an `Error` response) onto the
/// status taxonomy.
#[must_use]
pub fn server_errno_to_status(errnum: i32) -> Status {
    let code = match errnum {
        3000..=3002 | 3006 => Code::InvalidArgs, // ArgInvalid/ArgMissing/ArgTooLong/InvalidRequest
        3004 => Code::FileClosed,                // FileNotOpen
        3009 => Code::NoSpace,
        3010 => Code::AuthFailed, // NotAuthorized
        3011 => Code::NotFound,
        3013 => Code::NotSupported,
        3019 => Code::ChecksumMismatch,
        _ => Code::ServerError,
    };
    Status::error(code).with_errno(errnum)
}

/// Writes a big-endian `u16` at `offset`.
pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Writes a big-endian `u32` at `offset`.
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Writes a big-endian `i32` at `offset`.
pub fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Writes a big-endian `u64` at `offset`.
pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Reads a big-endian `u16` at `offset`.
#[must_use]
pub fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Reads a big-endian `u32` at `offset`.
#[must_use]
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Reads a big-endian `i32` at `offset`.
#[must_use]
pub fn get_i32(buf: &[u8], offset: usize) -> i32 {
    get_u32(buf, offset) as i32
}

/// Reads a big-endian `u64` at `offset`.
#[must_use]
pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_round_trip() {
        for code in [
            RequestCode::Query,
            RequestCode::Open,
            RequestCode::Read,
            RequestCode::Write,
            RequestCode::Locate,
            RequestCode::Truncate,
            RequestCode::EndSess,
        ] {
            assert_eq!(RequestCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(RequestCode::from_u16(2999), None);
    }

    #[test]
    fn response_statuses_round_trip() {
        for status in [
            ResponseStatus::Ok,
            ResponseStatus::OkSoFar,
            ResponseStatus::Attn,
            ResponseStatus::AuthMore,
            ResponseStatus::Error,
            ResponseStatus::Redirect,
            ResponseStatus::Wait,
            ResponseStatus::WaitResp,
        ] {
            assert_eq!(ResponseStatus::from_u16(status.as_u16()), Some(status));
        }
        assert_eq!(ResponseStatus::from_u16(4999), None);
    }

    #[test]
    fn server_errno_mapping() {
        assert_eq!(server_errno_to_status(3011).code(), xrd_core::Code::NotFound);
        assert_eq!(server_errno_to_status(3009).code(), xrd_core::Code::NoSpace);
        assert_eq!(
            server_errno_to_status(3010).code(),
            xrd_core::Code::AuthFailed
        );
        assert_eq!(
            server_errno_to_status(3999).code(),
            xrd_core::Code::ServerError
        );
        assert_eq!(server_errno_to_status(3011).errno(), 3011);
    }

    #[test]
    fn integer_helpers_are_big_endian() {
        let mut buf = [0u8; 8];
        put_u32(&mut buf, 0, 0x0102_0304);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(get_u32(&buf, 0), 0x0102_0304);

        put_u64(&mut buf, 0, 0x0102_0304_0506_0708);
        assert_eq!(get_u64(&buf, 0), 0x0102_0304_0506_0708);

        put_u16(&mut buf, 0, 0xBEEF);
        assert_eq!(get_u16(&buf, 0), 0xBEEF);
    }
}
