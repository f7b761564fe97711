//! Transport status taxonomy.
//!
//! Every operation in the stack reports a [`Status`]: a severity, a coarse
//! [`Code`], and an optional OS errno. Statuses travel through response
//! handlers by value; the stream retry logic and the file recovery path
//! branch on [`Status::is_recoverable`] rather than on concrete codes.

use std::error::Error;
use std::fmt;

/// How bad it is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Severity {
    /// The operation succeeded.
    Ok,
    /// The operation failed but the failure is scoped to the request.
    Error,
    /// The failure poisons the owning stream or file.
    Fatal,
}

/// Coarse classification of an operation outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Code {
    /// Success.
    Ok,
    /// A caller-supplied argument was rejected.
    InvalidArgs,
    /// The request is recognized but not supported by this peer.
    NotSupported,
    /// A socket-level read/write failed.
    SocketError,
    /// A socket-level timeout fired.
    SocketTimeout,
    /// The physical connection dropped while a stateful request was in flight.
    StreamDisconnect,
    /// The stream is inside its error window and refuses traffic.
    StreamBroken,
    /// The protocol handshake could not be completed.
    HandshakeFailed,
    /// The peer demanded authentication we do not provide.
    AuthFailed,
    /// The session the request was bound to is no longer valid.
    InvalidSession,
    /// The per-request expiry elapsed before a response arrived.
    OperationExpired,
    /// The peer asked us to retry elsewhere.
    Redirect,
    /// Transient failure, retrying the same endpoint may succeed.
    RetryNeeded,
    /// The requested entity does not exist.
    NotFound,
    /// The peer reported an error of its own.
    ServerError,
    /// A bug on our side.
    InternalError,
    /// Stored or transferred data failed its checksum.
    ChecksumMismatch,
    /// A finite resource (SIDs, disk, RAM budget) ran out.
    NoSpace,
    /// The throttle gate rejected or delayed the request.
    Throttled,
    /// The server refused to open the file.
    FileOpenFailed,
    /// The file is not open.
    FileClosed,
    /// A per-entity cap (open files, connections) was reached.
    LimitHit,
}

impl Code {
    /// Short lower-case tag used in log lines and descriptions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidArgs => "invalid-args",
            Self::NotSupported => "not-supported",
            Self::SocketError => "socket-error",
            Self::SocketTimeout => "socket-timeout",
            Self::StreamDisconnect => "stream-disconnect",
            Self::StreamBroken => "stream-broken",
            Self::HandshakeFailed => "handshake-failed",
            Self::AuthFailed => "auth-failed",
            Self::InvalidSession => "invalid-session",
            Self::OperationExpired => "operation-expired",
            Self::Redirect => "redirect",
            Self::RetryNeeded => "retry-needed",
            Self::NotFound => "not-found",
            Self::ServerError => "server-error",
            Self::InternalError => "internal-error",
            Self::ChecksumMismatch => "checksum-mismatch",
            Self::NoSpace => "no-space",
            Self::Throttled => "throttled",
            Self::FileOpenFailed => "file-open-failed",
            Self::FileClosed => "file-closed",
            Self::LimitHit => "limit-hit",
        }
    }
}

/// Outcome of a transport-level operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[must_use = "statuses carry failure information that must reach a handler"]
pub struct Status {
    severity: Severity,
    code: Code,
    errno: i32,
}

impl Status {
    /// Success.
    pub const OK: Self = Self {
        severity: Severity::Ok,
        code: Code::Ok,
        errno: 0,
    };

    /// Builds a non-fatal error status.
    pub const fn error(code: Code) -> Self {
        Self {
            severity: Severity::Error,
            code,
            errno: 0,
        }
    }

    /// Builds a fatal error status.
    pub const fn fatal(code: Code) -> Self {
        Self {
            severity: Severity::Fatal,
            code,
            errno: 0,
        }
    }

    /// Attaches the OS errno that produced this status.
    pub const fn with_errno(mut self, errno: i32) -> Self {
        self.errno = errno;
        self
    }

    /// Severity of the status.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.severity
    }

    /// Classification code.
    #[must_use]
    pub const fn code(&self) -> Code {
        self.code
    }

    /// OS errno if one was captured, 0 otherwise.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        self.errno
    }

    /// True when the operation succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.severity, Severity::Ok)
    }

    /// True when the status reports any failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// True when the failure poisons the stream or file it occurred on.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.severity, Severity::Fatal)
    }

    /// True for failures the stream retry policy or the file recovery path
    /// is allowed to absorb: redirects, stale sessions, transient socket
    /// conditions, and stateless disconnections.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        if self.is_fatal() {
            return false;
        }
        matches!(
            self.code,
            Code::Redirect
                | Code::RetryNeeded
                | Code::InvalidSession
                | Code::StreamDisconnect
                | Code::SocketTimeout
        )
    }

    /// Converts success into `Ok(())` and failure into `Err(self)`.
    pub const fn into_result(self) -> Result<(), Self> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Ok => write!(f, "[ok]"),
            Severity::Error => write!(f, "[error: {}]", self.code.as_str()),
            Severity::Fatal => write!(f, "[fatal: {}]", self.code.as_str()),
        }?;
        if self.errno != 0 {
            write!(f, " (errno {})", self.errno)?;
        }
        Ok(())
    }
}

impl Error for Status {}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let errno = err.raw_os_error().unwrap_or(0);
        let code = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Code::SocketTimeout,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Code::StreamDisconnect,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Code::InvalidArgs,
            _ => Code::SocketError,
        };
        Self::error(code).with_errno(errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status_reports_success() {
        let status = Status::OK;
        assert!(status.is_ok());
        assert!(!status.is_error());
        assert!(!status.is_fatal());
        assert_eq!(status.code(), Code::Ok);
    }

    #[test]
    fn error_status_reports_failure() {
        let status = Status::error(Code::SocketError).with_errno(104);
        assert!(status.is_error());
        assert!(!status.is_fatal());
        assert_eq!(status.errno(), 104);
    }

    #[test]
    fn fatal_status_is_never_recoverable() {
        let status = Status::fatal(Code::Redirect);
        assert!(status.is_fatal());
        assert!(!status.is_recoverable());
    }

    #[test]
    fn redirect_and_stale_session_are_recoverable() {
        assert!(Status::error(Code::Redirect).is_recoverable());
        assert!(Status::error(Code::InvalidSession).is_recoverable());
        assert!(Status::error(Code::StreamDisconnect).is_recoverable());
        assert!(!Status::error(Code::ServerError).is_recoverable());
        assert!(!Status::error(Code::AuthFailed).is_recoverable());
    }

    #[test]
    fn into_result_round_trips() {
        assert!(Status::OK.into_result().is_ok());
        let err = Status::error(Code::NotFound).into_result().unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn display_includes_code_and_errno() {
        let rendered = Status::error(Code::SocketError).with_errno(111).to_string();
        assert!(rendered.contains("socket-error"));
        assert!(rendered.contains("111"));
    }

    #[test]
    fn io_error_maps_to_transport_code() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        let status = Status::from(io);
        assert_eq!(status.code(), Code::StreamDisconnect);

        let io = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(Status::from(io).code(), Code::SocketTimeout);
    }
}
