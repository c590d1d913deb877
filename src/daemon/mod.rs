pub mod cache;
pub mod protocol;

use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::ops;
use crate::pool::CancelToken;
use crate::progress::ProgressReporter;
use crate::watch;

pub use cache::{CacheEntry, RwGate};
pub use protocol::{Request, ServerFrame, WireError};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Run the daemon for one repository until a shutdown RPC arrives (or the
/// idle auto-shutdown fires). Binding the socket doubles as the
/// cross-process lock: a second daemon cannot bind while this one lives.
pub fn run(root: &Path) -> Result<()> {
    let root = root
        .canonicalize()
        .map_err(|e| Error::Internal(format!("resolving {}: {e}", root.display())))?;
    let repo_config = Config::load(&root)?;

    std::fs::create_dir_all(config::config_dir(&root))?;
    let sock_path = config::socket_path(&root);
    let listener = bind_socket(&sock_path)?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::Internal(format!("socket setup: {e}")))?;
    let _cleanup = SocketCleanup(sock_path.clone());

    let entry = Arc::new(CacheEntry::new(&root));
    let shutdown = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let eviction = spawn_eviction_sweep(&repo_config, entry.clone(), shutdown.clone());

    info!(root = %root.display(), socket = %sock_path.display(), "daemon listening");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let entry = entry.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || handle_connection(stream, entry, shutdown, started));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }

    entry.stop_watch();
    let _ = eviction.join();
    info!("daemon stopped");
    Ok(())
}

/// Is a daemon currently serving this repository?
pub fn is_running(root: &Path) -> bool {
    UnixStream::connect(config::socket_path(root)).is_ok()
}

struct SocketCleanup(PathBuf);

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Bind the socket, recovering from a stale file left by a crashed daemon:
/// if the address is in use but nothing answers, unlink and retry exactly
/// once.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                return Err(Error::Internal(format!(
                    "daemon already running on {}",
                    path.display()
                )));
            }
            warn!(socket = %path.display(), "removing stale socket");
            let _ = std::fs::remove_file(path);
            UnixListener::bind(path)
                .map_err(|e| Error::Internal(format!("binding {}: {e}", path.display())))
        }
        Err(e) => Err(Error::Internal(format!("binding {}: {e}", path.display()))),
    }
}

fn spawn_eviction_sweep(
    repo_config: &Config,
    entry: Arc<CacheEntry>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let ttl = Duration::from_secs(repo_config.daemon.ttl_minutes * 60);
    let interval = Duration::from_secs(repo_config.daemon.eviction_check_interval_seconds.max(1));
    let auto_shutdown = repo_config.daemon.auto_shutdown_on_idle;

    std::thread::spawn(move || {
        let mut since_sweep = Duration::ZERO;
        while !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(250));
            since_sweep += Duration::from_millis(250);
            if since_sweep < interval {
                continue;
            }
            since_sweep = Duration::ZERO;
            entry.evict_if_idle(ttl);
            if auto_shutdown && entry.idle_for() > ttl && !entry.watch_active() {
                info!("idle past TTL, shutting down");
                shutdown.store(true, Ordering::SeqCst);
            }
        }
    })
}

type SharedWriter = Arc<Mutex<UnixStream>>;

fn send_frame(writer: &SharedWriter, frame: &ServerFrame) {
    if let Ok(raw) = serde_json::to_string(frame) {
        let mut stream = writer.lock();
        let _ = writeln!(stream, "{raw}");
        let _ = stream.flush();
    }
}

fn handle_connection(
    stream: UnixStream,
    entry: Arc<CacheEntry>,
    shutdown: Arc<AtomicBool>,
    started: Instant,
) {
    let reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(_) => return,
    };
    let writer: SharedWriter = Arc::new(Mutex::new(stream));

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                send_frame(
                    &writer,
                    &ServerFrame::Error {
                        call_id: 0,
                        error: WireError {
                            error_kind: "InvalidArgument".into(),
                            message: format!("unparseable request: {e}"),
                            detail: None,
                        },
                    },
                );
                continue;
            }
        };

        if request.method == "shutdown" {
            shutdown.store(true, Ordering::SeqCst);
            send_frame(
                &writer,
                &ServerFrame::Result {
                    call_id: request.call_id,
                    result: serde_json::json!({ "ok": true }),
                },
            );
            break;
        }

        let frame = match handle_request(&request, &entry, &writer, started) {
            Ok(result) => ServerFrame::Result { call_id: request.call_id, result },
            Err(e) => {
                ServerFrame::Error { call_id: request.call_id, error: WireError::from_error(&e) }
            }
        };
        send_frame(&writer, &frame);
    }
}

fn handle_request(
    request: &Request,
    entry: &Arc<CacheEntry>,
    writer: &SharedWriter,
    started: Instant,
) -> Result<serde_json::Value> {
    let cancel = CancelToken::new();
    if let Some(ms) = request.timeout_ms {
        let deadline_cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ms));
            deadline_cancel.cancel();
        });
    }

    match request.method.as_str() {
        "query_semantic" | "query_fts" | "query_hybrid" => {
            entry.touch();
            let ctx = entry.context()?;
            let gate = entry.gate();
            let _read = gate.read();
            ops::dispatch(&ctx, &request.method, &request.args, &ProgressReporter::disabled(), &cancel)
        }
        "index" => {
            entry.touch();
            let ctx = entry.context()?;
            let progress = forwarding_reporter(writer.clone(), request.call_id);
            let result = ops::dispatch(&ctx, "index", &request.args, &progress, &cancel);
            // Drain progress before the terminal frame goes out.
            progress.finish();
            result
        }
        "clean" | "clean_data" => {
            entry.touch();
            let ctx = entry.context()?;
            let result =
                ops::dispatch(&ctx, &request.method, &request.args, &ProgressReporter::disabled(), &cancel)?;
            entry.invalidate();
            Ok(result)
        }
        "status" => {
            entry.touch();
            let ctx = entry.context()?;
            let gate = entry.gate();
            let _read = gate.read();
            let mut value = serde_json::to_value(ops::status(&ctx)?)?;
            if let Some(map) = value.as_object_mut() {
                map.insert("daemon_running".into(), serde_json::json!(true));
                map.insert("daemon_uptime_seconds".into(), serde_json::json!(started.elapsed().as_secs()));
                map.insert("cache_loaded".into(), serde_json::json!(entry.is_loaded()));
                map.insert("access_count".into(), serde_json::json!(entry.access_count()));
                map.insert("watch_active".into(), serde_json::json!(entry.watch_active()));
            }
            Ok(value)
        }
        "clear_cache" => {
            entry.invalidate();
            Ok(serde_json::json!({ "ok": true }))
        }
        "watch_start" => {
            entry.touch();
            let ctx = entry.context()?;
            let handle = watch::spawn(ctx, watch::DEFAULT_DEBOUNCE)?;
            entry.set_watch(handle);
            Ok(serde_json::json!({ "watching": true }))
        }
        "watch_stop" => {
            let stopped = entry.stop_watch();
            Ok(serde_json::json!({ "stopped": stopped }))
        }
        other => Err(Error::InvalidArgument(format!("unknown method: {other}"))),
    }
}

fn forwarding_reporter(writer: SharedWriter, call_id: u64) -> ProgressReporter {
    ProgressReporter::new(Box::new(move |ev| {
        send_frame(
            &writer,
            &ServerFrame::Progress {
                call_id,
                current: ev.current,
                total: ev.total,
                path: ev.path.clone(),
                info: ev.info.clone(),
            },
        );
    }))
}
