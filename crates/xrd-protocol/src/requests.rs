//! Typed request builders.
//!
//! Each builder produces a complete frame: header fields in network order,
//! `dlen` consistent with the attached payload, stream id zero. Field
//! offsets follow the protocol reference layout of each request.

use crate::message::Message;
use crate::wire::{self, HANDSHAKE_REQUEST_LEN, RequestCode, SESSION_ID_LEN};

/// Open flags understood by the `open` request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpenFlags(pub u16);

impl OpenFlags {
    /// Open for reading.
    pub const READ: Self = Self(0x0010);
    /// Open for update (read/write).
    pub const UPDATE: Self = Self(0x0020);
    /// Delete an existing file before writing.
    pub const DELETE: Self = Self(0x0002);
    /// Require that the file does not exist yet.
    pub const NEW: Self = Self(0x0008);
    /// Create missing parent directories.
    pub const MAKE_PATH: Self = Self(0x0100);
    /// Open in append mode.
    pub const APPEND: Self = Self(0x0200);
    /// Ignore soft restrictions on the server side.
    pub const FORCE: Self = Self(0x0004);

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when the flags allow mutating the file.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & (Self::UPDATE.0 | Self::APPEND.0 | Self::NEW.0 | Self::DELETE.0) != 0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// One segment of a vector read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadChunk {
    /// Offset from the beginning of the file.
    pub offset: u64,
    /// Number of bytes to read.
    pub length: u32,
}

/// Initial handshake frame, sent before any request.
#[must_use]
pub fn handshake() -> Vec<u8> {
    let mut buf = vec![0u8; HANDSHAKE_REQUEST_LEN];
    wire::put_i32(&mut buf, 12, 4);
    wire::put_i32(&mut buf, 16, 2012);
    buf
}

/// `login` request carrying the client pid and user name.
#[must_use]
pub fn login(pid: u32, username: &str, token: &[u8]) -> Message {
    let mut msg = Message::request(RequestCode::Login);
    {
        let header = msg.as_mut_slice();
        wire::put_u32(header, 4, pid);
        let name = username.as_bytes();
        let n = name.len().min(8);
        header[8..8 + n].copy_from_slice(&name[..n]);
        header[18] = 4; // capability version
    }
    msg.append_payload(token);
    msg.set_description(format!("login as {username}"));
    msg
}

/// `protocol` request advertising our protocol version.
#[must_use]
pub fn protocol(client_version: i32) -> Message {
    let mut msg = Message::request(RequestCode::Protocol);
    wire::put_i32(msg.as_mut_slice(), 4, client_version);
    msg
}

/// `open` request.
#[must_use]
pub fn open(path: &str, flags: OpenFlags, mode: u16) -> Message {
    let mut msg = Message::request(RequestCode::Open);
    {
        let header = msg.as_mut_slice();
        wire::put_u16(header, 4, mode);
        wire::put_u16(header, 6, flags.0);
    }
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("open {path}"));
    msg
}

/// `close` request for an open file handle.
#[must_use]
pub fn close(fhandle: [u8; 4]) -> Message {
    let mut msg = Message::request(RequestCode::Close);
    msg.as_mut_slice()[4..8].copy_from_slice(&fhandle);
    msg
}

/// `read` request for a byte range of an open file.
#[must_use]
pub fn read(fhandle: [u8; 4], offset: u64, length: u32) -> Message {
    let mut msg = Message::request(RequestCode::Read);
    {
        let header = msg.as_mut_slice();
        header[4..8].copy_from_slice(&fhandle);
        wire::put_u64(header, 8, offset);
        wire::put_u32(header, 16, length);
    }
    msg.set_description(format!("read {length}@{offset}"));
    msg
}

/// `write` request carrying its data as payload.
#[must_use]
pub fn write(fhandle: [u8; 4], offset: u64, data: &[u8]) -> Message {
    let mut msg = Message::request(RequestCode::Write);
    {
        let header = msg.as_mut_slice();
        header[4..8].copy_from_slice(&fhandle);
        wire::put_u64(header, 8, offset);
    }
    msg.append_payload(data);
    msg.set_description(format!("write {}@{}", data.len(), offset));
    msg
}

/// `sync` request for an open file handle.
#[must_use]
pub fn sync(fhandle: [u8; 4]) -> Message {
    let mut msg = Message::request(RequestCode::Sync);
    msg.as_mut_slice()[4..8].copy_from_slice(&fhandle);
    msg
}

/// `truncate` request against an open file handle.
#[must_use]
pub fn truncate_handle(fhandle: [u8; 4], size: u64) -> Message {
    let mut msg = Message::request(RequestCode::Truncate);
    {
        let header = msg.as_mut_slice();
        header[4..8].copy_from_slice(&fhandle);
        wire::put_u64(header, 8, size);
    }
    msg
}

/// `truncate` request against a path.
#[must_use]
pub fn truncate_path(path: &str, size: u64) -> Message {
    let mut msg = Message::request(RequestCode::Truncate);
    wire::put_u64(msg.as_mut_slice(), 8, size);
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("truncate {path}"));
    msg
}

/// `stat` request against a path.
#[must_use]
pub fn stat_path(path: &str) -> Message {
    let mut msg = Message::request(RequestCode::Stat);
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("stat {path}"));
    msg
}

/// `stat` request against an open file handle.
#[must_use]
pub fn stat_handle(fhandle: [u8; 4]) -> Message {
    let mut msg = Message::request(RequestCode::Stat);
    msg.as_mut_slice()[16..20].copy_from_slice(&fhandle);
    msg
}

/// `stat` request for filesystem usage (statvfs variant).
#[must_use]
pub fn statvfs(path: &str) -> Message {
    let mut msg = Message::request(RequestCode::Stat);
    msg.as_mut_slice()[4] = 1; // vfs option
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("statvfs {path}"));
    msg
}

/// `locate` request.
#[must_use]
pub fn locate(path: &str, opts: u16) -> Message {
    let mut msg = Message::request(RequestCode::Locate);
    wire::put_u16(msg.as_mut_slice(), 4, opts);
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("locate {path}"));
    msg
}

/// `mkdir` request.
#[must_use]
pub fn mkdir(path: &str, make_path: bool, mode: u16) -> Message {
    let mut msg = Message::request(RequestCode::Mkdir);
    {
        let header = msg.as_mut_slice();
        header[4] = u8::from(make_path);
        wire::put_u16(header, 18, mode);
    }
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("mkdir {path}"));
    msg
}

/// `mv` request renaming `source` to `dest`.
#[must_use]
pub fn mv(source: &str, dest: &str) -> Message {
    let mut msg = Message::request(RequestCode::Mv);
    wire::put_u16(msg.as_mut_slice(), 18, source.len() as u16);
    let mut payload = Vec::with_capacity(source.len() + dest.len() + 1);
    payload.extend_from_slice(source.as_bytes());
    payload.push(b' ');
    payload.extend_from_slice(dest.as_bytes());
    msg.append_payload(&payload);
    msg.set_description(format!("mv {source} {dest}"));
    msg
}

/// `rm` request.
#[must_use]
pub fn rm(path: &str) -> Message {
    let mut msg = Message::request(RequestCode::Rm);
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("rm {path}"));
    msg
}

/// `rmdir` request.
#[must_use]
pub fn rmdir(path: &str) -> Message {
    let mut msg = Message::request(RequestCode::Rmdir);
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("rmdir {path}"));
    msg
}

/// `chmod` request.
#[must_use]
pub fn chmod(path: &str, mode: u16) -> Message {
    let mut msg = Message::request(RequestCode::Chmod);
    wire::put_u16(msg.as_mut_slice(), 18, mode);
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("chmod {path}"));
    msg
}

/// `dirlist` request.
#[must_use]
pub fn dirlist(path: &str) -> Message {
    let mut msg = Message::request(RequestCode::Dirlist);
    msg.append_payload(path.as_bytes());
    msg.set_description(format!("dirlist {path}"));
    msg
}

/// `ping` request.
#[must_use]
pub fn ping() -> Message {
    Message::request(RequestCode::Ping)
}

/// `query` request. `what` selects the query class; `args` is its argument.
#[must_use]
pub fn query(what: u16, fhandle: Option<[u8; 4]>, args: &[u8]) -> Message {
    let mut msg = Message::request(RequestCode::Query);
    {
        let header = msg.as_mut_slice();
        wire::put_u16(header, 4, what);
        if let Some(fh) = fhandle {
            header[16..20].copy_from_slice(&fh);
        }
    }
    msg.append_payload(args);
    msg
}

/// `readv` request over the given chunks of one open file.
#[must_use]
pub fn readv(fhandle: [u8; 4], chunks: &[ReadChunk]) -> Message {
    let mut msg = Message::request(RequestCode::ReadV);
    let mut payload = vec![0u8; chunks.len() * 16];
    for (i, chunk) in chunks.iter().enumerate() {
        let base = i * 16;
        payload[base..base + 4].copy_from_slice(&fhandle);
        wire::put_u32(&mut payload, base + 4, chunk.length);
        wire::put_u64(&mut payload, base + 8, chunk.offset);
    }
    msg.append_payload(&payload);
    msg.set_description(format!("readv {} chunks", chunks.len()));
    msg
}

/// `endsess` request terminating the given session.
#[must_use]
pub fn endsess(session_id: [u8; SESSION_ID_LEN]) -> Message {
    let mut msg = Message::request(RequestCode::EndSess);
    msg.as_mut_slice()[4..4 + SESSION_ID_LEN].copy_from_slice(&session_id);
    msg
}

/// `bind` request attaching an additional sub-stream to a session.
#[must_use]
pub fn bind(session_id: [u8; SESSION_ID_LEN]) -> Message {
    let mut msg = Message::request(RequestCode::Bind);
    msg.as_mut_slice()[4..4 + SESSION_ID_LEN].copy_from_slice(&session_id);
    msg
}

/// Rewrites the file handle of a queued `read`/`write`/`sync`/`truncate`/
/// `close` request, used when recovery re-opens a file and the server hands
/// out a fresh handle.
pub fn rewrite_file_handle(msg: &mut Message, fhandle: [u8; 4]) {
    if msg.len() >= 8 {
        msg.as_mut_slice()[4..8].copy_from_slice(&fhandle);
    }
}
