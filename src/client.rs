use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::daemon::protocol::{Request, ServerFrame};
use crate::error::{Error, Result};
use crate::ops::RepoContext;
use crate::pool::CancelToken;
use crate::progress::{ProgressEvent, ProgressFn, ProgressReporter};

static CALL_ID: AtomicU64 = AtomicU64::new(1);

const MAX_DAEMON_RESTARTS: u32 = 2;

/// Dispatches user intents either to the repository's daemon or to an
/// in-process execution of the same operations. Detects a missing daemon
/// and spawns one; treats mid-call transport failures as crashes and falls
/// back after bounded restarts. Never rewrites the requested method, so a
/// missing FTS index surfaces as `IndexMissing` rather than a silent
/// semantic query.
pub struct Client {
    root: PathBuf,
    config: Config,
}

enum CallFailure {
    Transport(String),
    Rpc(Error),
}

impl Client {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::Internal(format!("resolving {}: {e}", root.display())))?;
        let config = Config::load(&root)?;
        Ok(Self { root, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn execute(&self, method: &str, args: Value, progress: Option<ProgressFn>) -> Result<Value> {
        if !self.config.daemon.enabled {
            return self.run_in_process(method, &args, progress);
        }

        let mut restarts = 0u32;
        loop {
            let stream = match self.connect_with_retry() {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "daemon unreachable, falling back to in-process");
                    return self.run_in_process(method, &args, progress);
                }
            };

            match self.call_over_socket(stream, method, &args, &progress) {
                Ok(value) => return Ok(value),
                Err(CallFailure::Rpc(e)) => return Err(e),
                Err(CallFailure::Transport(reason)) => {
                    restarts += 1;
                    if restarts > MAX_DAEMON_RESTARTS {
                        warn!(reason = %reason, "daemon kept failing, falling back to in-process");
                        return self.run_in_process(method, &args, progress);
                    }
                    warn!(reason = %reason, attempt = restarts, "daemon call failed, restarting");
                }
            }
        }
    }

    /// Connect to the daemon socket, spawning a daemon when nothing is
    /// listening, with the configured capped backoff.
    fn connect_with_retry(&self) -> Result<UnixStream> {
        let sock = config::socket_path(&self.root);
        if let Ok(stream) = UnixStream::connect(&sock) {
            return Ok(stream);
        }

        self.spawn_daemon()?;
        let delays = &self.config.daemon.retry_delays_ms;
        for attempt in 0..self.config.daemon.max_retries as usize {
            let delay = delays
                .get(attempt)
                .or(delays.last())
                .copied()
                .unwrap_or(1000);
            std::thread::sleep(Duration::from_millis(delay));
            if let Ok(stream) = UnixStream::connect(&sock) {
                return Ok(stream);
            }
        }
        Err(Error::BackendUnavailable("daemon did not come up".into()))
    }

    fn spawn_daemon(&self) -> Result<()> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::Internal(format!("locating binary: {e}")))?;
        Command::new(exe)
            .arg("daemon-run")
            .arg(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Internal(format!("spawning daemon: {e}")))?;
        info!(root = %self.root.display(), "spawned daemon");
        Ok(())
    }

    fn call_over_socket(
        &self,
        mut stream: UnixStream,
        method: &str,
        args: &Value,
        progress: &Option<ProgressFn>,
    ) -> std::result::Result<Value, CallFailure> {
        let call_id = CALL_ID.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            method: method.to_string(),
            args: args.clone(),
            call_id,
            timeout_ms: None,
        };
        let raw = serde_json::to_string(&request)
            .map_err(|e| CallFailure::Transport(e.to_string()))?;
        writeln!(stream, "{raw}").map_err(|e| CallFailure::Transport(e.to_string()))?;
        stream.flush().map_err(|e| CallFailure::Transport(e.to_string()))?;

        let reader = BufReader::new(
            stream.try_clone().map_err(|e| CallFailure::Transport(e.to_string()))?,
        );
        for line in reader.lines() {
            let line = line.map_err(|e| CallFailure::Transport(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: ServerFrame = match serde_json::from_str(&line) {
                Ok(f) => f,
                Err(e) => return Err(CallFailure::Transport(format!("bad frame: {e}"))),
            };
            if frame.call_id() != call_id {
                continue;
            }
            match frame {
                ServerFrame::Progress { current, total, path, info, .. } => {
                    if let Some(cb) = progress {
                        cb(&ProgressEvent {
                            current,
                            total,
                            path,
                            info,
                            files_per_second: 0.0,
                            kb_per_second: 0.0,
                            active_threads: 0,
                        });
                    }
                }
                ServerFrame::Result { result, .. } => return Ok(result),
                ServerFrame::Error { error, .. } => {
                    return Err(CallFailure::Rpc(error.into_error()));
                }
            }
        }
        Err(CallFailure::Transport("connection closed mid-call".into()))
    }

    fn run_in_process(
        &self,
        method: &str,
        args: &Value,
        progress: Option<ProgressFn>,
    ) -> Result<Value> {
        let ctx = RepoContext::open_in_process(&self.root, self.config.clone())?;
        let reporter = match progress {
            Some(cb) => ProgressReporter::new(cb),
            None => ProgressReporter::disabled(),
        };
        let result =
            crate::ops::dispatch(&ctx, method, args, &reporter, &CancelToken::new());
        reporter.finish();
        result
    }

    /// Send a shutdown RPC if a daemon is listening. Quiet no-op otherwise.
    pub fn shutdown_daemon(&self) -> Result<bool> {
        let sock = config::socket_path(&self.root);
        let Ok(stream) = UnixStream::connect(&sock) else {
            return Ok(false);
        };
        match self.call_over_socket(stream, "shutdown", &Value::Null, &None) {
            Ok(_) => Ok(true),
            Err(CallFailure::Rpc(e)) => Err(e),
            Err(CallFailure::Transport(_)) => Ok(true),
        }
    }
}
