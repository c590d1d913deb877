use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::ops::RepoContext;
use crate::processor::WriteGate;
use crate::watch::WatchHandle;

/// Reader/writer discipline for one repository: queries hold the read side,
/// index/clean/watch-updates take the write side. The processor sees it as
/// a `WriteGate`, so the lock is never held across embedding I/O.
pub struct RwGate(RwLock<()>);

impl RwGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(RwLock::new(())))
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.0.read()
    }
}

impl WriteGate for RwGate {
    fn with_write(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let _guard = self.0.write();
        f()
    }
}

/// Per-repository cached state owned by the daemon: the lazily-built
/// context (vector handle, FTS searcher, result cache), access bookkeeping
/// for TTL eviction, and the optional background watch.
pub struct CacheEntry {
    root: PathBuf,
    gate: Arc<RwGate>,
    context: Mutex<Option<Arc<RepoContext>>>,
    last_accessed: Mutex<Instant>,
    access_count: AtomicU64,
    watch: Mutex<Option<WatchHandle>>,
}

impl CacheEntry {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            gate: RwGate::new(),
            context: Mutex::new(None),
            last_accessed: Mutex::new(Instant::now()),
            access_count: AtomicU64::new(0),
            watch: Mutex::new(None),
        }
    }

    pub fn gate(&self) -> Arc<RwGate> {
        self.gate.clone()
    }

    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_accessed.lock().elapsed()
    }

    pub fn is_loaded(&self) -> bool {
        self.context.lock().is_some()
    }

    /// Lazy handle loading: the first query or write after startup (or after
    /// eviction) rebuilds the context from the on-disk config.
    pub fn context(&self) -> Result<Arc<RepoContext>> {
        let mut slot = self.context.lock();
        if let Some(ctx) = slot.as_ref() {
            return Ok(ctx.clone());
        }
        let config = Config::load(&self.root)?;
        let ctx = Arc::new(RepoContext::open(&self.root, config, self.gate.clone())?);
        *slot = Some(ctx.clone());
        Ok(ctx)
    }

    /// Drop cached handles. On-disk data is untouched; `access_count`
    /// survives for observability. A running watch is stopped as well: it
    /// holds the old context, and updates applied through a stale context
    /// would bypass the caches of the next one.
    pub fn invalidate(&self) {
        self.stop_watch();
        let mut slot = self.context.lock();
        if let Some(ctx) = slot.take() {
            ctx.result_cache.flush();
        }
    }

    /// Evict handles when idle past the TTL. Entries with an active watch
    /// are pinned: the watcher shares this context and must keep observing
    /// the same searcher handles that queries use.
    pub fn evict_if_idle(&self, ttl: Duration) -> bool {
        if self.idle_for() <= ttl || self.watch_active() {
            return false;
        }
        let mut slot = self.context.lock();
        if slot.is_some() {
            *slot = None;
            info!(root = %self.root.display(), "evicted idle cache entry");
            return true;
        }
        false
    }

    pub fn watch_active(&self) -> bool {
        self.watch.lock().as_ref().is_some_and(|w| w.is_running())
    }

    pub fn set_watch(&self, handle: WatchHandle) {
        let mut slot = self.watch.lock();
        if let Some(old) = slot.take() {
            old.stop();
        }
        *slot = Some(handle);
    }

    pub fn stop_watch(&self) -> bool {
        match self.watch.lock().take() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }
}
