//! In-process XRootD endpoint used by the integration tests.
//!
//! Speaks just enough of the protocol for the client stack: it answers the
//! preamble, issues session ids at login, accepts binds, and delegates
//! every other request to a test-provided responder.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// One decoded client request.
#[derive(Clone, Debug)]
pub struct RequestFrame {
    pub sid: [u8; 2],
    pub code: u16,
    pub header: [u8; 24],
    pub payload: Vec<u8>,
}

/// What the responder wants sent back.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Final `Ok` with the given body.
    Ok(Vec<u8>),
    /// `Error` with a server error number and text.
    Error(i32, String),
    /// `Redirect` to `host:port`.
    Redirect { host: String, port: i32 },
    /// `Wait` for the given number of seconds.
    Wait(u32),
    /// Do not reply at all.
    Silence,
    /// Drop the TCP connection.
    Hangup,
}

pub type Responder = Arc<dyn Fn(&RequestFrame) -> Reply + Send + Sync>;

pub struct MockServer {
    addr: std::net::SocketAddr,
    shutdown: Arc<AtomicBool>,
    counts: Arc<Mutex<HashMap<u16, usize>>>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    /// Spawns a server answering with `responder`.
    pub fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = Arc::new(AtomicBool::new(false));
        let counts = Arc::new(Mutex::new(HashMap::new()));

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_counts = Arc::clone(&counts);
        let accept_thread = thread::spawn(move || {
            let mut connections = Vec::new();
            while !accept_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((socket, _peer)) => {
                        let responder = Arc::clone(&responder);
                        let counts = Arc::clone(&accept_counts);
                        connections.push(thread::spawn(move || {
                            let _ = serve_connection(socket, &responder, &counts);
                        }));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
            for connection in connections {
                let _ = connection.join();
            }
        });

        Self {
            addr,
            shutdown,
            counts,
            accept_thread: Some(accept_thread),
        }
    }

    /// Endpoint URL for this server.
    pub fn url(&self, path: &str) -> String {
        format!("root://{}{}", self.addr, path)
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// How many requests with `code` were received.
    pub fn count(&self, code: u16) -> usize {
        *self.counts.lock().unwrap().get(&code).unwrap_or(&0)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection(
    mut socket: TcpStream,
    responder: &Responder,
    counts: &Mutex<HashMap<u16, usize>>,
) -> std::io::Result<()> {
    socket.set_nodelay(true)?;

    // Preamble: 20 bytes in, 16 bytes (frame with 8-byte body) out.
    let mut preamble = [0u8; 20];
    socket.read_exact(&mut preamble)?;
    let mut handshake_body = Vec::with_capacity(8);
    handshake_body.extend_from_slice(&0x0310i32.to_be_bytes());
    handshake_body.extend_from_slice(&1i32.to_be_bytes());
    write_response(&mut socket, [0, 0], 0, &handshake_body)?;

    loop {
        let mut header = [0u8; 24];
        socket.read_exact(&mut header)?;
        let sid = [header[0], header[1]];
        let code = u16::from_be_bytes([header[2], header[3]]);
        let dlen = u32::from_be_bytes([header[20], header[21], header[22], header[23]]) as usize;
        let mut payload = vec![0u8; dlen];
        socket.read_exact(&mut payload)?;

        *counts.lock().unwrap().entry(code).or_insert(0) += 1;

        // Session plumbing is handled by the server itself.
        if code == 3007 {
            // login: hand out a fixed session id
            write_response(&mut socket, sid, 0, &[7u8; 16])?;
            continue;
        }
        if code == 3024 {
            // bind
            write_response(&mut socket, sid, 0, &[0u8])?;
            continue;
        }

        let frame = RequestFrame {
            sid,
            code,
            header,
            payload,
        };
        match responder(&frame) {
            Reply::Ok(body) => write_response(&mut socket, sid, 0, &body)?,
            Reply::Error(errnum, text) => {
                let mut body = Vec::new();
                body.extend_from_slice(&errnum.to_be_bytes());
                body.extend_from_slice(text.as_bytes());
                body.push(0);
                write_response(&mut socket, sid, 4003, &body)?;
            }
            Reply::Redirect { host, port } => {
                let mut body = Vec::new();
                body.extend_from_slice(&port.to_be_bytes());
                body.extend_from_slice(host.as_bytes());
                write_response(&mut socket, sid, 4004, &body)?;
            }
            Reply::Wait(seconds) => {
                let mut body = Vec::new();
                body.extend_from_slice(&seconds.to_be_bytes());
                write_response(&mut socket, sid, 4005, &body)?;
            }
            Reply::Silence => {}
            Reply::Hangup => return Ok(()),
        }
    }
}

fn write_response(
    socket: &mut TcpStream,
    sid: [u8; 2],
    status: u16,
    body: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&sid);
    frame.extend_from_slice(&status.to_be_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    socket.write_all(&frame)
}
