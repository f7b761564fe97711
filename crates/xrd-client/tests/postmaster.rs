//! End-to-end exercises of the post master over an in-process endpoint.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use support::{MockServer, Reply};
use xrd_core::{Code, Env, Url, env::keys};
use xrd_client::msgutil::{MessageSendParams, SyncResponseHandler};
use xrd_client::transport::TransportQuery;
use xrd_client::{ChannelEvent, ChannelEventHandler, FileSystem, PostMaster};
use xrd_protocol::requests;

fn fast_env() -> Arc<Env> {
    let env = Arc::new(Env::new());
    // One-second ticks so expiry tests finish quickly.
    env.put_int(keys::TICK_INTERVAL, 1);
    env
}

fn started_postmaster(env: &Arc<Env>) -> Arc<PostMaster> {
    let postmaster = PostMaster::new(Arc::clone(env)).expect("post master");
    postmaster.start().expect("start");
    postmaster
}

#[test]
fn ping_round_trips_through_handshake_and_login() {
    let server = MockServer::start(Arc::new(|_req| Reply::Ok(Vec::new())));
    let env = fast_env();
    let postmaster = started_postmaster(&env);

    let url = Url::parse(&server.url("//")).unwrap();
    let handler = Arc::new(SyncResponseHandler::new());
    postmaster
        .send(
            &url,
            requests::ping(),
            handler.clone(),
            MessageSendParams::with_timeout(Duration::from_secs(5), 16),
        )
        .expect("send accepted");

    let (status, _) = handler.wait_timeout(Duration::from_secs(10));
    assert!(status.is_ok(), "ping failed: {status}");
    assert_eq!(server.count(3011), 1);
    assert_eq!(postmaster.connected_substreams(&url), 1);

    // The login negotiated a session id the transport can report.
    let session = postmaster.query_transport(&url, TransportQuery::SessionId);
    assert_eq!(session.as_deref(), Some("07070707070707070707070707070707"));

    postmaster.stop().expect("stop");
}

#[test]
fn stateless_redirect_is_followed_transparently() {
    let target = MockServer::start(Arc::new(|req| match req.code {
        3017 => Reply::Ok(b"77 4096 0 1700000000".to_vec()),
        _ => Reply::Ok(Vec::new()),
    }));
    let target_addr = target.addr();

    let frontdoor = MockServer::start(Arc::new(move |req| match req.code {
        3017 => Reply::Redirect {
            host: target_addr.ip().to_string(),
            port: i32::from(target_addr.port()),
        },
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let url = Url::parse(&frontdoor.url("//")).unwrap();
    let fs = FileSystem::new(Arc::clone(&postmaster), url, Arc::clone(&env));

    let stat = fs
        .stat_sync("/store/f.root", Some(Duration::from_secs(10)))
        .expect("stat follows the redirect");
    assert_eq!(stat.size, 4096);
    assert_eq!(frontdoor.count(3017), 1);
    assert_eq!(target.count(3017), 1);

    postmaster.stop().expect("stop");
}

#[test]
fn unanswered_request_expires_and_quarantines_its_sid() {
    let server = MockServer::start(Arc::new(|req| match req.code {
        3017 => Reply::Silence,
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let url = Url::parse(&server.url("//")).unwrap();

    // Warm the channel up so the stat is the only outstanding request.
    let warm = Arc::new(SyncResponseHandler::new());
    postmaster
        .send(
            &url,
            requests::ping(),
            warm.clone(),
            MessageSendParams::with_timeout(Duration::from_secs(5), 16),
        )
        .unwrap();
    let (status, _) = warm.wait_timeout(Duration::from_secs(10));
    assert!(status.is_ok());

    let started = Instant::now();
    let handler = Arc::new(SyncResponseHandler::new());
    postmaster
        .send(
            &url,
            requests::stat_path("/never"),
            handler.clone(),
            MessageSendParams::with_timeout(Duration::from_secs(2), 16),
        )
        .unwrap();

    let (status, _) = handler.wait_timeout(Duration::from_secs(15));
    assert_eq!(status.code(), Code::OperationExpired);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(10),
        "expiry at {elapsed:?}"
    );

    // The channel itself stays connected.
    assert_eq!(postmaster.connected_substreams(&url), 1);

    postmaster.stop().expect("stop");
}

#[test]
fn wait_response_rearms_the_request() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let server_attempts = Arc::clone(&attempts);
    let server = MockServer::start(Arc::new(move |req| match req.code {
        3017 => {
            if server_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Wait(1)
            } else {
                Reply::Ok(b"5 10 0 1700000000".to_vec())
            }
        }
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let url = Url::parse(&server.url("//")).unwrap();
    let fs = FileSystem::new(Arc::clone(&postmaster), url, Arc::clone(&env));

    let stat = fs
        .stat_sync("/busy", Some(Duration::from_secs(20)))
        .expect("stat succeeds after wait");
    assert_eq!(stat.size, 10);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    postmaster.stop().expect("stop");
}

#[test]
fn server_error_maps_into_the_status_taxonomy() {
    let server = MockServer::start(Arc::new(|req| match req.code {
        3017 => Reply::Error(3011, "no such file".to_owned()),
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let url = Url::parse(&server.url("//")).unwrap();
    let fs = FileSystem::new(Arc::clone(&postmaster), url, Arc::clone(&env));

    let err = fs
        .stat_sync("/missing", Some(Duration::from_secs(10)))
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.errno(), 3011);

    postmaster.stop().expect("stop");
}

#[test]
fn channel_event_handler_sees_connected() {
    struct Recorder(AtomicUsize);
    impl ChannelEventHandler for Recorder {
        fn on_event(&self, event: ChannelEvent) -> bool {
            if event == ChannelEvent::Connected {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            true
        }
    }

    let server = MockServer::start(Arc::new(|_req| Reply::Ok(Vec::new())));
    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let url = Url::parse(&server.url("//")).unwrap();

    let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
    postmaster
        .register_event_handler(&url, recorder.clone())
        .unwrap();

    let handler = Arc::new(SyncResponseHandler::new());
    postmaster
        .send(
            &url,
            requests::ping(),
            handler.clone(),
            MessageSendParams::with_timeout(Duration::from_secs(5), 16),
        )
        .unwrap();
    let (status, _) = handler.wait_timeout(Duration::from_secs(10));
    assert!(status.is_ok());
    assert_eq!(recorder.0.load(Ordering::SeqCst), 1);

    postmaster.stop().expect("stop");
}

#[test]
fn connect_failure_enters_the_error_window_and_fails_fast() {
    let env = fast_env();
    // Shrink the error window so the test can observe both phases.
    env.put_int(keys::CONNECTION_WINDOW, 2);
    let postmaster = started_postmaster(&env);

    // A listener that is immediately dropped: connections are refused.
    let refused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    };
    let url = Url::parse(&format!("root://{refused}//")).unwrap();

    let first = Arc::new(SyncResponseHandler::new());
    postmaster
        .send(
            &url,
            requests::ping(),
            first.clone(),
            MessageSendParams::with_timeout(Duration::from_secs(5), 16),
        )
        .unwrap();
    let (status, _) = first.wait_timeout(Duration::from_secs(10));
    assert!(status.is_error(), "refused connect must fail: {status}");

    // Inside the window further sends fail fast with StreamBroken.
    let second = Arc::new(SyncResponseHandler::new());
    let err = postmaster
        .send(
            &url,
            requests::ping(),
            second,
            MessageSendParams::with_timeout(Duration::from_secs(5), 16),
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::StreamBroken);

    postmaster.stop().expect("stop");
}
