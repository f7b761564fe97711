//! Response body parsing.
//!
//! Response payload layouts are a mix of fixed binary fields (redirect port,
//! wait seconds, file handles) and ASCII blobs (stat, statvfs, locate,
//! dirlist). Parsers return typed values and flag malformed bodies with
//! [`ResponseParseError`] instead of guessing.

use thiserror::Error;
use xrd_core::{Code, Status};

use crate::message::Message;
use crate::wire::{
    self, FILE_HANDLE_LEN, HANDSHAKE_RESPONSE_BODY_LEN, RESPONSE_HEADER_LEN, ResponseStatus,
    SESSION_ID_LEN,
};

/// Why a response body failed to parse.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ResponseParseError {
    /// The frame is shorter than its own header claims.
    #[error("response body truncated: expected at least {expected} bytes, found {found}")]
    Truncated {
        /// Bytes the layout requires.
        expected: usize,
        /// Bytes actually present.
        found: usize,
    },
    /// The status field holds a value outside the protocol tables.
    #[error("unknown response status {0}")]
    UnknownStatus(u16),
    /// An ASCII body did not match its expected shape.
    #[error("malformed {what} body: {detail}")]
    Malformed {
        /// Which body failed.
        what: &'static str,
        /// What was wrong.
        detail: String,
    },
}

/// A decoded response frame.
#[derive(Debug)]
pub struct ServerResponse<'a> {
    sid: [u8; 2],
    status: ResponseStatus,
    body: &'a [u8],
}

impl<'a> ServerResponse<'a> {
    /// Decodes the header of a complete response frame.
    pub fn parse(msg: &'a Message) -> Result<Self, ResponseParseError> {
        let buf = msg.as_slice();
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(ResponseParseError::Truncated {
                expected: RESPONSE_HEADER_LEN,
                found: buf.len(),
            });
        }
        let raw_status = wire::get_u16(buf, 2);
        let status = ResponseStatus::from_u16(raw_status)
            .ok_or(ResponseParseError::UnknownStatus(raw_status))?;
        let dlen = wire::get_u32(buf, 4) as usize;
        let body = &buf[RESPONSE_HEADER_LEN..];
        if body.len() < dlen {
            return Err(ResponseParseError::Truncated {
                expected: RESPONSE_HEADER_LEN + dlen,
                found: buf.len(),
            });
        }
        Ok(Self {
            sid: [buf[0], buf[1]],
            status,
            body: &body[..dlen],
        })
    }

    /// Stream id the response correlates to.
    #[must_use]
    pub const fn sid(&self) -> [u8; 2] {
        self.sid
    }

    /// Response status.
    #[must_use]
    pub const fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Response body, exactly `dlen` bytes.
    #[must_use]
    pub const fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Maps the response onto the status taxonomy.
    #[must_use]
    pub fn to_status(&self) -> Status {
        match self.status {
            ResponseStatus::Ok | ResponseStatus::OkSoFar | ResponseStatus::Attn => Status::OK,
            ResponseStatus::AuthMore => Status::error(Code::AuthFailed),
            ResponseStatus::Error => match parse_error(self.body) {
                Ok(err) => wire::server_errno_to_status(err.errnum),
                Err(_) => Status::error(Code::ServerError),
            },
            ResponseStatus::Redirect => Status::error(Code::Redirect),
            ResponseStatus::Wait | ResponseStatus::WaitResp => Status::error(Code::RetryNeeded),
        }
    }
}

/// Body of an `Error` response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorBody {
    /// Server error number.
    pub errnum: i32,
    /// Human-readable explanation.
    pub message: String,
}

/// Parses an `Error` body: 4-byte error number plus text.
pub fn parse_error(body: &[u8]) -> Result<ErrorBody, ResponseParseError> {
    if body.len() < 4 {
        return Err(ResponseParseError::Truncated {
            expected: 4,
            found: body.len(),
        });
    }
    let errnum = wire::get_i32(body, 0);
    let text = &body[4..];
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    Ok(ErrorBody {
        errnum,
        message: String::from_utf8_lossy(&text[..end]).into_owned(),
    })
}

/// Body of a `Redirect` response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RedirectBody {
    /// Port to connect to; `-1` means "use the default".
    pub port: i32,
    /// Target host, possibly followed by opaque CGI after `?`.
    pub host: String,
    /// Opaque CGI the client must append to the retried request, if any.
    pub opaque: Option<String>,
}

/// Parses a `Redirect` body: 4-byte port, then `host[?opaque]`.
pub fn parse_redirect(body: &[u8]) -> Result<RedirectBody, ResponseParseError> {
    if body.len() < 4 {
        return Err(ResponseParseError::Truncated {
            expected: 4,
            found: body.len(),
        });
    }
    let port = wire::get_i32(body, 0);
    let target = String::from_utf8_lossy(&body[4..]);
    let target = target.trim_end_matches('\0');
    if target.is_empty() {
        return Err(ResponseParseError::Malformed {
            what: "redirect",
            detail: "empty host".to_owned(),
        });
    }
    let (host, opaque) = match target.split_once('?') {
        Some((host, opaque)) => (host.to_owned(), Some(opaque.to_owned())),
        None => (target.to_owned(), None),
    };
    Ok(RedirectBody { port, host, opaque })
}

/// Parses a `Wait` body: 4-byte seconds plus optional explanation.
pub fn parse_wait(body: &[u8]) -> Result<u32, ResponseParseError> {
    if body.len() < 4 {
        return Err(ResponseParseError::Truncated {
            expected: 4,
            found: body.len(),
        });
    }
    Ok(wire::get_u32(body, 0))
}

/// Handshake reply fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HandshakeBody {
    /// Protocol version the server speaks.
    pub protocol_version: i32,
    /// Server role flags.
    pub server_type: i32,
}

/// Parses the 8-byte handshake reply body.
pub fn parse_handshake(body: &[u8]) -> Result<HandshakeBody, ResponseParseError> {
    if body.len() < HANDSHAKE_RESPONSE_BODY_LEN {
        return Err(ResponseParseError::Truncated {
            expected: HANDSHAKE_RESPONSE_BODY_LEN,
            found: body.len(),
        });
    }
    Ok(HandshakeBody {
        protocol_version: wire::get_i32(body, 0),
        server_type: wire::get_i32(body, 4),
    })
}

/// Login reply fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoginBody {
    /// Session identity to present at recovery time.
    pub session_id: [u8; SESSION_ID_LEN],
    /// Security token for a follow-up auth loop, empty when none.
    pub sec_token: Vec<u8>,
}

/// Parses a `login` reply body.
pub fn parse_login(body: &[u8]) -> Result<LoginBody, ResponseParseError> {
    if body.len() < SESSION_ID_LEN {
        return Err(ResponseParseError::Truncated {
            expected: SESSION_ID_LEN,
            found: body.len(),
        });
    }
    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&body[..SESSION_ID_LEN]);
    Ok(LoginBody {
        session_id,
        sec_token: body[SESSION_ID_LEN..].to_vec(),
    })
}

/// Open reply fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenBody {
    /// Server-assigned opaque file handle.
    pub fhandle: [u8; FILE_HANDLE_LEN],
    /// Stat string when the open requested one.
    pub stat: Option<StatInfo>,
}

/// Parses an `open` reply body.
pub fn parse_open(body: &[u8]) -> Result<OpenBody, ResponseParseError> {
    if body.len() < FILE_HANDLE_LEN {
        return Err(ResponseParseError::Truncated {
            expected: FILE_HANDLE_LEN,
            found: body.len(),
        });
    }
    let mut fhandle = [0u8; FILE_HANDLE_LEN];
    fhandle.copy_from_slice(&body[..FILE_HANDLE_LEN]);

    // An extended body carries compression info (8 bytes) then the ASCII
    // stat string. Anything shorter than the compression fields is
    // handle-only.
    let stat = if body.len() > FILE_HANDLE_LEN + 8 {
        Some(parse_stat(&body[FILE_HANDLE_LEN + 8..])?)
    } else {
        None
    };
    Ok(OpenBody { fhandle, stat })
}

/// Decoded `stat` information.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatInfo {
    /// Server-unique file id.
    pub id: u64,
    /// Size in bytes.
    pub size: u64,
    /// Flag bits (directory, writable, offline...).
    pub flags: u32,
    /// Modification time, unix seconds.
    pub mtime: i64,
}

/// Parses the ASCII `stat` body: `id size flags mtime`.
pub fn parse_stat(body: &[u8]) -> Result<StatInfo, ResponseParseError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim_end_matches('\0').trim();
    let mut fields = text.split_ascii_whitespace();
    let mut next = |name: &'static str| {
        fields
            .next()
            .ok_or_else(|| ResponseParseError::Malformed {
                what: "stat",
                detail: format!("missing {name}"),
            })
    };
    let id = next("id")?;
    let size = next("size")?;
    let flags = next("flags")?;
    let mtime = next("mtime")?;
    let parse_field = |name: &'static str, value: &str| {
        value
            .parse::<i64>()
            .map_err(|_| ResponseParseError::Malformed {
                what: "stat",
                detail: format!("unparsable {name}: {value:?}"),
            })
    };
    Ok(StatInfo {
        id: parse_field("id", id)? as u64,
        size: parse_field("size", size)? as u64,
        flags: parse_field("flags", flags)? as u32,
        mtime: parse_field("mtime", mtime)?,
    })
}

/// Decoded `statvfs` information.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatVfsInfo {
    /// Number of writable nodes.
    pub nodes_rw: u64,
    /// Free space on writable nodes, in MiB.
    pub free_rw: u64,
    /// Utilization of writable nodes, percent.
    pub utilization_rw: u32,
    /// Number of staging nodes.
    pub nodes_staging: u64,
    /// Free space on staging nodes, in MiB.
    pub free_staging: u64,
    /// Utilization of staging nodes, percent.
    pub utilization_staging: u32,
}

/// Parses the ASCII `statvfs` body.
pub fn parse_statvfs(body: &[u8]) -> Result<StatVfsInfo, ResponseParseError> {
    let text = String::from_utf8_lossy(body);
    let fields: Vec<&str> = text.trim_end_matches('\0').split_ascii_whitespace().collect();
    if fields.len() < 6 {
        return Err(ResponseParseError::Malformed {
            what: "statvfs",
            detail: format!("expected 6 fields, found {}", fields.len()),
        });
    }
    let num = |idx: usize| {
        fields[idx]
            .parse::<u64>()
            .map_err(|_| ResponseParseError::Malformed {
                what: "statvfs",
                detail: format!("unparsable field {idx}: {:?}", fields[idx]),
            })
    };
    Ok(StatVfsInfo {
        nodes_rw: num(0)?,
        free_rw: num(1)?,
        utilization_rw: num(2)? as u32,
        nodes_staging: num(3)?,
        free_staging: num(4)?,
        utilization_staging: num(5)? as u32,
    })
}

/// One location returned by `locate`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocateEntry {
    /// `M`anager or `S`erver, lower-case for pending.
    pub node_type: char,
    /// `r`ead-only or `w`ritable.
    pub access: char,
    /// `host:port` of the node.
    pub address: String,
}

/// Parses the ASCII `locate` body: space-separated `TA[host]:port` entries.
pub fn parse_locate(body: &[u8]) -> Result<Vec<LocateEntry>, ResponseParseError> {
    let text = String::from_utf8_lossy(body);
    let mut entries = Vec::new();
    for token in text.trim_end_matches('\0').split_ascii_whitespace() {
        let mut chars = token.chars();
        let node_type = chars.next().ok_or_else(|| ResponseParseError::Malformed {
            what: "locate",
            detail: "empty entry".to_owned(),
        })?;
        let access = chars.next().ok_or_else(|| ResponseParseError::Malformed {
            what: "locate",
            detail: format!("entry too short: {token:?}"),
        })?;
        let address = chars.as_str();
        if address.is_empty() {
            return Err(ResponseParseError::Malformed {
                what: "locate",
                detail: format!("missing address: {token:?}"),
            });
        }
        entries.push(LocateEntry {
            node_type,
            access,
            address: address.to_owned(),
        });
    }
    Ok(entries)
}

/// Parses a `dirlist` body: newline-separated entry names.
#[must_use]
pub fn parse_dirlist(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .trim_end_matches('\0')
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != ".")
        .map(str::to_owned)
        .collect()
}
