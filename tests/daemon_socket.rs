mod common;

use common::{commit_all, init_repo, write};

use std::io::{BufRead, BufReader, Write as _};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};

use code_indexer::config;
use code_indexer::daemon;
use code_indexer::daemon::protocol::{Request, ServerFrame};

fn wait_for_socket(root: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if daemon::is_running(root) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("daemon never bound its socket");
}

fn call(root: &Path, method: &str, call_id: u64) -> ServerFrame {
    let mut stream = UnixStream::connect(config::socket_path(root)).unwrap();
    let request = Request {
        method: method.into(),
        args: serde_json::json!({}),
        call_id,
        timeout_ms: None,
    };
    writeln!(stream, "{}", serde_json::to_string(&request).unwrap()).unwrap();
    stream.flush().unwrap();

    let reader = BufReader::new(stream.try_clone().unwrap());
    for line in reader.lines() {
        let line = line.unwrap();
        if line.trim().is_empty() {
            continue;
        }
        let frame: ServerFrame = serde_json::from_str(&line).unwrap();
        if frame.call_id() != call_id {
            continue;
        }
        match frame {
            ServerFrame::Progress { .. } => continue,
            terminal => return terminal,
        }
    }
    panic!("connection closed without a terminal frame");
}

#[test]
fn daemon_serves_status_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write(dir.path(), "a.py", "def auth():\n    return 1\n");
    commit_all(dir.path(), "content");

    let root = dir.path().canonicalize().unwrap();
    let daemon_root = root.clone();
    let handle = std::thread::spawn(move || daemon::run(&daemon_root));
    wait_for_socket(&root);

    match call(&root, "status", 1) {
        ServerFrame::Result { result, .. } => {
            assert_eq!(result["daemon_running"], true);
            assert_eq!(result["branch"], "main");
            assert_eq!(result["watch_active"], false);
        }
        other => panic!("status failed: {other:?}"),
    }

    // Unknown methods are typed errors, not hangups.
    match call(&root, "no_such_method", 2) {
        ServerFrame::Error { error, .. } => assert_eq!(error.error_kind, "InvalidArgument"),
        other => panic!("expected error frame, got {other:?}"),
    }

    match call(&root, "shutdown", 3) {
        ServerFrame::Result { .. } => {}
        other => panic!("shutdown failed: {other:?}"),
    }

    handle.join().unwrap().unwrap();
    // The socket file is unlinked on clean shutdown.
    assert!(!config::socket_path(&root).exists());
}

#[test]
fn stale_socket_is_recovered_by_the_next_daemon() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let root = dir.path().canonicalize().unwrap();

    // A crashed daemon leaves its socket file behind with nothing
    // listening: bind then leak the path without unlinking.
    std::fs::create_dir_all(config::config_dir(&root)).unwrap();
    let stale = UnixListener::bind(config::socket_path(&root)).unwrap();
    drop(stale);
    assert!(config::socket_path(&root).exists());
    assert!(!daemon::is_running(&root));

    let daemon_root = root.clone();
    let handle = std::thread::spawn(move || daemon::run(&daemon_root));
    wait_for_socket(&root);

    match call(&root, "shutdown", 1) {
        ServerFrame::Result { .. } => {}
        other => panic!("shutdown failed: {other:?}"),
    }
    handle.join().unwrap().unwrap();
}

#[test]
fn second_daemon_refuses_to_bind_while_first_lives() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let root = dir.path().canonicalize().unwrap();

    let daemon_root = root.clone();
    let handle = std::thread::spawn(move || daemon::run(&daemon_root));
    wait_for_socket(&root);

    let err = daemon::run(&root).unwrap_err();
    assert!(err.to_string().contains("already running"), "got: {err}");

    match call(&root, "shutdown", 1) {
        ServerFrame::Result { .. } => {}
        other => panic!("shutdown failed: {other:?}"),
    }
    handle.join().unwrap().unwrap();
}
