//! Transport codec: per-scheme handshake and session policy.
//!
//! The stream owns sockets and framing; the codec owns what flows before
//! user traffic is allowed. For the XRootD scheme that is the fixed
//! preamble exchange followed by `login` on the first sub-stream and `bind`
//! on every additional one. Negotiated session state lives in the channel's
//! [`AnyBag`] so it survives sub-stream reconnects.

use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use xrd_core::{AnyBag, Code, Status, XrdResult};
use xrd_protocol::wire::SESSION_ID_LEN;
use xrd_protocol::{Message, ServerResponse, requests, responses};

/// What the stream should do next during a handshake.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Write this frame, then feed the reply back to the codec.
    Send(Message),
    /// The sub-stream is ready for user traffic.
    Done,
}

/// Queries answerable by a transport about a live channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportQuery {
    /// Negotiated protocol version, decimal.
    ProtocolVersion,
    /// Session id as lower-case hex.
    SessionId,
    /// Server role flags, decimal.
    ServerFlags,
}

/// Scheme-specific connection establishment and session policy.
pub trait TransportCodec: Send + Sync {
    /// Scheme name, e.g. `root`.
    fn name(&self) -> &'static str;

    /// Starts the handshake for `substream` on a fresh connection.
    fn handshake_start(&self, channel_data: &AnyBag, substream: usize) -> HandshakeStep;

    /// Feeds a complete reply frame to the handshake state machine.
    fn handshake_advance(
        &self,
        channel_data: &AnyBag,
        substream: usize,
        reply: &Message,
    ) -> XrdResult<HandshakeStep>;

    /// True when an idle stream has outlived its time-to-live and should be
    /// torn down by the tick task.
    fn is_stream_ttl_expired(&self, channel_data: &AnyBag, idle: Duration) -> bool;

    /// Number of sub-streams the stream should run against this endpoint.
    fn multiplex_substreams(&self, channel_data: &AnyBag) -> usize;

    /// Fills in a trace description for a frame that lacks one.
    fn set_description(&self, msg: &mut Message) {
        if msg.description().is_empty() {
            let label = msg
                .request_code()
                .map_or("frame", xrd_protocol::RequestCode::name);
            msg.set_description(label);
        }
    }

    /// Answers a query about the negotiated session.
    fn query(&self, what: TransportQuery, channel_data: &AnyBag) -> Option<String>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    AwaitHandshake,
    AwaitLogin,
    AwaitBind,
    Ready,
}

#[derive(Default)]
struct SessionInner {
    phases: FxHashMap<usize, Phase>,
    protocol_version: Option<i32>,
    server_type: Option<i32>,
    session_id: Option<[u8; SESSION_ID_LEN]>,
}

/// Session state the XRootD transport caches on the channel.
#[derive(Default)]
pub struct XrootdSession {
    inner: Mutex<SessionInner>,
}

impl XrootdSession {
    /// Session id negotiated at login, if the channel is logged in.
    #[must_use]
    pub fn session_id(&self) -> Option<[u8; SESSION_ID_LEN]> {
        self.inner.lock().expect("session lock poisoned").session_id
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn protocol_version(&self) -> Option<i32> {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .protocol_version
    }
}

/// The XRootD transport codec.
pub struct XrootdTransport {
    substreams: usize,
    stream_ttl: Duration,
    username: String,
}

impl XrootdTransport {
    /// Creates a codec running one sub-stream with a 5-minute idle TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_substreams(1)
    }

    /// Creates a codec that multiplexes over `substreams` connections.
    #[must_use]
    pub fn with_substreams(substreams: usize) -> Self {
        let username = std::env::var("USER").unwrap_or_else(|_| "anon".to_owned());
        Self {
            substreams: substreams.max(1),
            stream_ttl: Duration::from_secs(300),
            username,
        }
    }

    fn session(channel_data: &AnyBag) -> std::sync::Arc<XrootdSession> {
        if let Some(session) = channel_data.get::<XrootdSession>() {
            return session;
        }
        channel_data.set(XrootdSession::default());
        channel_data
            .get::<XrootdSession>()
            .expect("session stored above")
    }
}

impl Default for XrootdTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCodec for XrootdTransport {
    fn name(&self) -> &'static str {
        "root"
    }

    fn handshake_start(&self, channel_data: &AnyBag, substream: usize) -> HandshakeStep {
        let session = Self::session(channel_data);
        let mut inner = session.inner.lock().expect("session lock poisoned");
        inner.phases.insert(substream, Phase::AwaitHandshake);
        drop(inner);

        trace!(substream, "handshake preamble queued");
        let mut msg = Message::from_vec(requests::handshake());
        msg.set_description("handshake preamble");
        HandshakeStep::Send(msg)
    }

    fn handshake_advance(
        &self,
        channel_data: &AnyBag,
        substream: usize,
        reply: &Message,
    ) -> XrdResult<HandshakeStep> {
        let session = Self::session(channel_data);
        let mut inner = session.inner.lock().expect("session lock poisoned");
        let phase = *inner
            .phases
            .get(&substream)
            .ok_or_else(|| Status::error(Code::InternalError))?;

        let response =
            ServerResponse::parse(reply).map_err(|_| Status::error(Code::HandshakeFailed))?;

        match phase {
            Phase::AwaitHandshake => {
                let body = responses::parse_handshake(response.body())
                    .map_err(|_| Status::error(Code::HandshakeFailed))?;
                inner.protocol_version = Some(body.protocol_version);
                inner.server_type = Some(body.server_type);
                debug!(
                    substream,
                    protocol_version = body.protocol_version,
                    "handshake accepted"
                );

                if substream == 0 {
                    inner.phases.insert(substream, Phase::AwaitLogin);
                    drop(inner);
                    Ok(HandshakeStep::Send(requests::login(
                        std::process::id(),
                        &self.username,
                        &[],
                    )))
                } else {
                    let session_id = inner
                        .session_id
                        .ok_or_else(|| Status::error(Code::InvalidSession))?;
                    inner.phases.insert(substream, Phase::AwaitBind);
                    drop(inner);
                    Ok(HandshakeStep::Send(requests::bind(session_id)))
                }
            }
            Phase::AwaitLogin => {
                match response.status() {
                    xrd_protocol::ResponseStatus::Ok => {}
                    // The authentication loop is outside this stack.
                    xrd_protocol::ResponseStatus::AuthMore => {
                        return Err(Status::fatal(Code::AuthFailed));
                    }
                    _ => return Err(Status::error(Code::HandshakeFailed)),
                }
                let body = responses::parse_login(response.body())
                    .map_err(|_| Status::error(Code::HandshakeFailed))?;
                if !body.sec_token.is_empty() {
                    return Err(Status::fatal(Code::AuthFailed));
                }
                inner.session_id = Some(body.session_id);
                inner.phases.insert(substream, Phase::Ready);
                debug!(substream, "login complete, session established");
                Ok(HandshakeStep::Done)
            }
            Phase::AwaitBind => {
                if response.status() != xrd_protocol::ResponseStatus::Ok {
                    return Err(Status::error(Code::HandshakeFailed));
                }
                inner.phases.insert(substream, Phase::Ready);
                debug!(substream, "substream bound to session");
                Ok(HandshakeStep::Done)
            }
            Phase::Ready => Ok(HandshakeStep::Done),
        }
    }

    fn is_stream_ttl_expired(&self, _channel_data: &AnyBag, idle: Duration) -> bool {
        idle >= self.stream_ttl
    }

    fn multiplex_substreams(&self, _channel_data: &AnyBag) -> usize {
        self.substreams
    }

    fn query(&self, what: TransportQuery, channel_data: &AnyBag) -> Option<String> {
        let session = channel_data.get::<XrootdSession>()?;
        let inner = session.inner.lock().expect("session lock poisoned");
        match what {
            TransportQuery::ProtocolVersion => {
                inner.protocol_version.map(|v| v.to_string())
            }
            TransportQuery::ServerFlags => inner.server_type.map(|v| v.to_string()),
            TransportQuery::SessionId => inner.session_id.map(|sid| {
                sid.iter().map(|byte| format!("{byte:02x}")).collect()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrd_protocol::wire::{RESPONSE_HEADER_LEN, ResponseStatus, put_u16, put_u32, put_i32};

    fn reply(status: ResponseStatus, body: &[u8]) -> Message {
        let mut buf = vec![0u8; RESPONSE_HEADER_LEN];
        put_u16(&mut buf, 2, status.as_u16());
        put_u32(&mut buf, 4, body.len() as u32);
        buf.extend_from_slice(body);
        Message::from_vec(buf)
    }

    fn handshake_reply() -> Message {
        let mut body = vec![0u8; 8];
        put_i32(&mut body, 0, 0x0310);
        put_i32(&mut body, 4, 1);
        reply(ResponseStatus::Ok, &body)
    }

    fn login_reply() -> Message {
        let body: Vec<u8> = (0u8..16).collect();
        reply(ResponseStatus::Ok, &body)
    }

    #[test]
    fn substream_zero_handshakes_then_logs_in() {
        let transport = XrootdTransport::new();
        let bag = AnyBag::new();

        let step = transport.handshake_start(&bag, 0);
        let HandshakeStep::Send(preamble) = step else {
            panic!("expected preamble send");
        };
        assert_eq!(preamble.len(), 20);

        let step = transport
            .handshake_advance(&bag, 0, &handshake_reply())
            .expect("handshake accepted");
        let HandshakeStep::Send(login) = step else {
            panic!("expected login send");
        };
        assert_eq!(
            login.request_code(),
            Some(xrd_protocol::RequestCode::Login)
        );

        let step = transport
            .handshake_advance(&bag, 0, &login_reply())
            .expect("login accepted");
        assert!(matches!(step, HandshakeStep::Done));

        let session = bag.get::<XrootdSession>().expect("session cached");
        assert_eq!(session.protocol_version(), Some(0x0310));
        assert!(session.session_id().is_some());
    }

    #[test]
    fn additional_substream_binds_with_session_id() {
        let transport = XrootdTransport::with_substreams(2);
        let bag = AnyBag::new();

        // Establish the session on substream 0 first.
        let _ = transport.handshake_start(&bag, 0);
        let _ = transport.handshake_advance(&bag, 0, &handshake_reply()).unwrap();
        let _ = transport.handshake_advance(&bag, 0, &login_reply()).unwrap();

        let _ = transport.handshake_start(&bag, 1);
        let step = transport
            .handshake_advance(&bag, 1, &handshake_reply())
            .expect("handshake accepted");
        let HandshakeStep::Send(bind) = step else {
            panic!("expected bind send");
        };
        assert_eq!(bind.request_code(), Some(xrd_protocol::RequestCode::Bind));

        let step = transport
            .handshake_advance(&bag, 1, &reply(ResponseStatus::Ok, &[0]))
            .expect("bind accepted");
        assert!(matches!(step, HandshakeStep::Done));
    }

    #[test]
    fn bind_without_session_is_invalid() {
        let transport = XrootdTransport::with_substreams(2);
        let bag = AnyBag::new();
        let _ = transport.handshake_start(&bag, 1);
        let err = transport
            .handshake_advance(&bag, 1, &handshake_reply())
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidSession);
    }

    #[test]
    fn auth_demand_fails_fatally() {
        let transport = XrootdTransport::new();
        let bag = AnyBag::new();
        let _ = transport.handshake_start(&bag, 0);
        let _ = transport.handshake_advance(&bag, 0, &handshake_reply()).unwrap();

        let err = transport
            .handshake_advance(&bag, 0, &reply(ResponseStatus::AuthMore, b"krb5"))
            .unwrap_err();
        assert_eq!(err.code(), Code::AuthFailed);
        assert!(err.is_fatal());
    }

    #[test]
    fn queries_reflect_negotiated_state() {
        let transport = XrootdTransport::new();
        let bag = AnyBag::new();
        assert!(transport.query(TransportQuery::SessionId, &bag).is_none());

        let _ = transport.handshake_start(&bag, 0);
        let _ = transport.handshake_advance(&bag, 0, &handshake_reply()).unwrap();
        let _ = transport.handshake_advance(&bag, 0, &login_reply()).unwrap();

        assert_eq!(
            transport.query(TransportQuery::ProtocolVersion, &bag).as_deref(),
            Some("784")
        );
        let sid = transport.query(TransportQuery::SessionId, &bag).unwrap();
        assert_eq!(sid.len(), 32);
        assert!(sid.starts_with("000102"));
    }

    #[test]
    fn ttl_expiry_is_a_simple_threshold() {
        let transport = XrootdTransport::new();
        let bag = AnyBag::new();
        assert!(!transport.is_stream_ttl_expired(&bag, Duration::from_secs(10)));
        assert!(transport.is_stream_ttl_expired(&bag, Duration::from_secs(301)));
    }
}
