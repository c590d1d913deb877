use notify::{RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::chunk::walker::to_repo_path;
use crate::error::{Error, Result};
use crate::ops::{self, RepoContext};
use crate::pool::CancelToken;
use crate::processor::IndexScope;
use crate::progress::ProgressReporter;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Running watch for one repository. Stopping is cooperative; the thread
/// finishes its in-flight batch first.
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Start watching the repository's working tree. Changed files are
/// re-indexed in debounced batches; deletions hide the file in the current
/// branch and purge its FTS docs. Per-file errors are logged and the watch
/// continues.
pub fn spawn(ctx: Arc<RepoContext>, debounce: Duration) -> Result<WatchHandle> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .map_err(|e| Error::Internal(format!("starting watcher: {e}")))?;
    watcher
        .watch(&ctx.root, RecursiveMode::Recursive)
        .map_err(|e| Error::Internal(format!("watching {}: {e}", ctx.root.display())))?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let thread = std::thread::spawn(move || {
        // Keep the watcher alive for the lifetime of the loop.
        let _watcher = watcher;
        let mut pending: HashSet<PathBuf> = HashSet::new();
        let mut last_event: Option<Instant> = None;

        info!(root = %ctx.root.display(), "watch started");
        loop {
            if stop_flag.load(Ordering::SeqCst) {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(event)) => {
                    pending.extend(event.paths);
                    last_event = Some(Instant::now());
                }
                Ok(Err(e)) => warn!(error = %e, "watch event error"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let quiet = last_event.is_some_and(|t| t.elapsed() >= debounce);
            if quiet && !pending.is_empty() {
                let batch: Vec<PathBuf> = pending.drain().collect();
                last_event = None;
                if let Err(e) = apply_batch(&ctx, batch) {
                    warn!(error = %e, "watch update failed");
                }
            }
        }
        info!("watch stopped");
    });

    Ok(WatchHandle { stop, thread: Some(thread) })
}

fn apply_batch(ctx: &RepoContext, paths: Vec<PathBuf>) -> Result<()> {
    let branch = ctx.git.current_branch()?;
    let mut changed = Vec::new();
    let mut removed = Vec::new();

    for abs in paths {
        let Ok(rel) = abs.strip_prefix(&ctx.root) else { continue };
        let rel = to_repo_path(rel);
        if rel.is_empty()
            || rel.starts_with(crate::config::CONFIG_DIR)
            || rel.starts_with(".git/")
            || rel == ".git"
        {
            continue;
        }
        if abs.is_file() {
            changed.push(rel);
        } else if !abs.exists() {
            removed.push(rel);
        }
    }

    changed.sort();
    changed.dedup();
    removed.sort();
    removed.dedup();

    if changed.is_empty() && removed.is_empty() {
        return Ok(());
    }
    info!(changed = changed.len(), removed = removed.len(), branch = %branch, "applying watch update");

    if !changed.is_empty() {
        let processor = ctx.processor();
        let cancel = CancelToken::new();
        let stats = processor.process_files(
            &changed,
            &branch,
            IndexScope::FileSet,
            &ProgressReporter::disabled(),
            &cancel,
        )?;
        if stats.files_failed > 0 {
            warn!(failed = stats.files_failed, "watch batch had failures");
        }
        for path in &changed {
            ctx.result_cache.flush_path(path);
        }
    }

    for path in &removed {
        if let Err(e) = ops::remove_file(ctx, path, &branch) {
            warn!(path = %path, error = %e, "failed to drop removed file");
        }
    }
    Ok(())
}
