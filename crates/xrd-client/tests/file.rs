//! File-state-handler scenarios over in-process endpoints.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use support::{MockServer, Reply};
use xrd_core::{Code, Env, env::keys};
use xrd_client::msgutil::SyncResponseHandler;
use xrd_client::{FileStateHandler, FileStatus, PostMaster};
use xrd_protocol::requests::{OpenFlags, ReadChunk};

fn fast_env() -> Arc<Env> {
    let env = Arc::new(Env::new());
    env.put_int(keys::TICK_INTERVAL, 1);
    env
}

fn started_postmaster(env: &Arc<Env>) -> Arc<PostMaster> {
    let postmaster = PostMaster::new(Arc::clone(env)).expect("post master");
    postmaster.start().expect("start");
    postmaster
}

/// A data server holding one 64 KiB file whose byte at offset `i` is
/// `i as u8`.
fn data_server() -> MockServer {
    MockServer::start(Arc::new(|req| match req.code {
        // open -> 4-byte handle
        3010 => Reply::Ok(vec![1, 2, 3, 4]),
        // read -> pattern bytes for (offset, len)
        3013 => {
            let offset = u64::from_be_bytes(req.header[8..16].try_into().unwrap());
            let len = u32::from_be_bytes(req.header[16..20].try_into().unwrap());
            let data: Vec<u8> = (offset..offset + u64::from(len))
                .map(|i| i as u8)
                .collect();
            Reply::Ok(data)
        }
        // write, sync, truncate, close
        3019 | 3016 | 3028 | 3003 => Reply::Ok(Vec::new()),
        // stat
        3017 => Reply::Ok(b"9 65536 0 1700000000".to_vec()),
        _ => Reply::Ok(Vec::new()),
    }))
}

#[test]
fn open_read_write_close_accounts_metrics() {
    let server = data_server();
    let env = fast_env();
    let postmaster = started_postmaster(&env);

    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));
    file.open_sync(
        &server.url("//data/f.bin"),
        OpenFlags::UPDATE,
        0o644,
        Some(Duration::from_secs(10)),
    )
    .expect("open");
    assert_eq!(file.status(), FileStatus::Opened);
    assert!(file.session_id().is_some());

    let data = file
        .read_sync(16, 32, Some(Duration::from_secs(10)))
        .expect("read");
    assert_eq!(data.len(), 32);
    assert_eq!(data[0], 16);
    assert_eq!(data[31], 47);

    file.write_sync(0, b"fresh bytes", Some(Duration::from_secs(10)))
        .expect("write");

    let metrics = file.metrics();
    assert_eq!(metrics.read_count, 1);
    assert_eq!(metrics.bytes_read, 32);
    assert_eq!(metrics.write_count, 1);
    assert_eq!(metrics.bytes_written, 11);

    file.close_sync(Some(Duration::from_secs(10))).expect("close");
    assert_eq!(file.status(), FileStatus::Closed);

    // Closing an already-closed (but previously opened) file is a no-op.
    file.close_sync(Some(Duration::from_secs(10))).expect("idempotent close");

    postmaster.stop().expect("stop");
}

#[test]
fn close_before_any_open_is_an_error() {
    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));

    let err = file.close_sync(Some(Duration::from_secs(2))).unwrap_err();
    assert_eq!(err.code(), Code::FileClosed);

    postmaster.stop().expect("stop");
}

#[test]
fn open_follows_manager_redirect_and_records_both_urls() {
    let dataserver = data_server();
    let ds_addr = dataserver.addr();

    let manager = MockServer::start(Arc::new(move |req| match req.code {
        3010 => Reply::Redirect {
            host: ds_addr.ip().to_string(),
            port: i32::from(ds_addr.port()),
        },
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));

    file.open_sync(
        &manager.url("//store/f.root"),
        OpenFlags::READ,
        0,
        Some(Duration::from_secs(10)),
    )
    .expect("open lands after redirect");

    // The manager saw exactly one open and the data server one more.
    assert_eq!(manager.count(3010), 1);
    assert_eq!(dataserver.count(3010), 1);

    let data_url = file.data_server().expect("data server recorded");
    assert_eq!(data_url.host(), ds_addr.ip().to_string());
    assert_eq!(data_url.port(), ds_addr.port());

    let balancer = file.load_balancer().expect("load balancer recorded");
    assert_eq!(balancer.host_id(), manager.addr().to_string());

    postmaster.stop().expect("stop");
}

#[test]
fn open_refusal_is_file_open_failed() {
    let server = MockServer::start(Arc::new(|req| match req.code {
        3010 => Reply::Error(3010, "permission denied".to_owned()),
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));

    let err = file
        .open_sync(
            &server.url("//secret"),
            OpenFlags::READ,
            0,
            Some(Duration::from_secs(10)),
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::FileOpenFailed);
    assert_eq!(file.status(), FileStatus::Error);

    postmaster.stop().expect("stop");
}

#[test]
fn dropped_connection_recovers_and_reissues_the_read() {
    let read_attempts = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&read_attempts);

    let server = MockServer::start(Arc::new(move |req| match req.code {
        3010 => Reply::Ok(vec![9, 9, 9, 9]),
        3013 => {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                // First read: kill the connection mid-session.
                Reply::Hangup
            } else {
                Reply::Ok(b"recovered payload".to_vec())
            }
        }
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));

    file.open_sync(
        &server.url("//flaky/f.bin"),
        OpenFlags::READ,
        0,
        Some(Duration::from_secs(10)),
    )
    .expect("open");

    let data = file
        .read_sync(0, 17, Some(Duration::from_secs(20)))
        .expect("read survives the disconnect");
    assert_eq!(data, b"recovered payload");

    // One failed attempt, one successful re-issue, and a second open for
    // the recovery.
    assert_eq!(read_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(server.count(3010), 2);
    assert_eq!(file.status(), FileStatus::Opened);

    postmaster.stop().expect("stop");
}

#[test]
fn close_during_open_in_progress_defers_until_open_completes() {
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&opens);
    let server = MockServer::start(Arc::new(move |req| match req.code {
        3010 => {
            // The first open is held back for a second.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Wait(1)
            } else {
                Reply::Ok(vec![5, 5, 5, 5])
            }
        }
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));

    let open_handler = Arc::new(SyncResponseHandler::new());
    file.open(
        &server.url("//slow.bin"),
        OpenFlags::READ,
        0,
        open_handler.clone(),
        Some(Duration::from_secs(20)),
    )
    .expect("open accepted");

    // The server is still sitting on the open; the close must park
    // instead of failing.
    let close_handler = Arc::new(SyncResponseHandler::new());
    file.close(close_handler.clone(), Some(Duration::from_secs(10)))
        .expect("close defers");

    let (open_status, _) = open_handler.wait_timeout(Duration::from_secs(15));
    assert!(open_status.is_ok(), "open failed: {open_status}");
    let (close_status, _) = close_handler.wait_timeout(Duration::from_secs(15));
    assert!(close_status.is_ok(), "close failed: {close_status}");

    assert_eq!(file.status(), FileStatus::Closed);
    assert_eq!(server.count(3003), 1);

    postmaster.stop().expect("stop");
}

#[test]
fn vector_read_coalesces_adjacent_chunks() {
    let readv_payload = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&readv_payload);
    let server = MockServer::start(Arc::new(move |req| match req.code {
        3010 => Reply::Ok(vec![1, 2, 3, 4]),
        3025 => {
            seen.store(req.payload.len(), Ordering::SeqCst);
            Reply::Ok(vec![0u8; 250])
        }
        _ => Reply::Ok(Vec::new()),
    }));

    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));
    file.open_sync(
        &server.url("//v.bin"),
        OpenFlags::READ,
        0,
        Some(Duration::from_secs(10)),
    )
    .expect("open");

    let chunks = [
        ReadChunk {
            offset: 0,
            length: 100,
        },
        ReadChunk {
            offset: 100,
            length: 100,
        },
        ReadChunk {
            offset: 4096,
            length: 50,
        },
    ];
    let handler = Arc::new(SyncResponseHandler::new());
    file.vector_read(&chunks, handler.clone(), Some(Duration::from_secs(10)))
        .expect("vector read accepted");
    let (status, _) = handler.wait_timeout(Duration::from_secs(10));
    assert!(status.is_ok(), "vector read failed: {status}");

    // Three requested segments left the client as two 16-byte entries.
    assert_eq!(readv_payload.load(Ordering::SeqCst), 2 * 16);

    let metrics = file.metrics();
    assert_eq!(metrics.vread_count, 1);
    assert_eq!(metrics.vread_segments, 3);
    assert_eq!(metrics.merged_chunks, 1);

    postmaster.stop().expect("stop");
}

#[test]
fn operations_on_a_closed_file_fail() {
    let env = fast_env();
    let postmaster = started_postmaster(&env);
    let file = FileStateHandler::new(Arc::clone(&postmaster), Arc::clone(&env));

    let err = file
        .read_sync(0, 16, Some(Duration::from_secs(2)))
        .unwrap_err();
    assert_eq!(err.code(), Code::FileClosed);

    postmaster.stop().expect("stop");
}
