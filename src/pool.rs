use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared between the orchestrator, the
/// worker pool, and RPC handlers. Workers observe it between tasks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() { Err(Error::Canceled) } else { Ok(()) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub embeddings_per_second: f64,
    pub inflight: u64,
    pub completed: u64,
    pub failed: u64,
}

type Job<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

/// Bounded FIFO queue with N worker threads. Each task represents one whole
/// file; submission blocks when the queue is full. Cancellation drops
/// pending tasks (they complete as `Canceled`) while inflight tasks finish.
pub struct WorkerPool<T: Send + 'static> {
    tx: Option<Sender<Job<T>>>,
    done_rx: Receiver<Result<T>>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancelToken,
    inflight: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    started: Instant,
    worker_count: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(worker_count: usize, queue_capacity: usize, cancel: CancelToken) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = bounded::<Job<T>>(queue_capacity.max(1));
        // Results are never a backpressure point: the task queue is the
        // bounded stage, and blocking workers on result delivery can
        // deadlock a submitter that drains lazily.
        let (done_tx, done_rx) = unbounded::<Result<T>>();

        let inflight = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = rx.clone();
            let done_tx = done_tx.clone();
            let cancel = cancel.clone();
            let inflight = inflight.clone();
            let completed = completed.clone();
            let failed = failed.clone();
            handles.push(std::thread::spawn(move || {
                for job in rx.iter() {
                    if cancel.is_canceled() {
                        let _ = done_tx.send(Err(Error::Canceled));
                        continue;
                    }
                    inflight.fetch_add(1, Ordering::SeqCst);
                    let outcome = job();
                    inflight.fetch_sub(1, Ordering::SeqCst);
                    match &outcome {
                        Ok(_) => completed.fetch_add(1, Ordering::SeqCst),
                        Err(_) => failed.fetch_add(1, Ordering::SeqCst),
                    };
                    if done_tx.send(outcome).is_err() {
                        break;
                    }
                }
            }));
        }

        Self {
            tx: Some(tx),
            done_rx,
            handles,
            cancel,
            inflight,
            completed,
            failed,
            started: Instant::now(),
            worker_count,
        }
    }

    /// Queue a task. Blocks while the queue is full; fails fast once the
    /// token fires so cancellation aborts pending submissions first.
    pub fn submit(&self, job: Job<T>) -> Result<()> {
        self.cancel.check()?;
        let tx = self.tx.as_ref().ok_or_else(|| Error::Internal("pool closed".into()))?;
        tx.send(job).map_err(|_| Error::Internal("worker pool hung up".into()))
    }

    /// Block for the next finished task.
    pub fn wait_one(&self) -> Result<T> {
        self.done_rx
            .recv()
            .map_err(|_| Error::Internal("worker pool hung up".into()))?
    }

    /// Non-blocking variant; None when nothing has finished yet.
    pub fn try_wait_one(&self) -> Option<Result<T>> {
        self.done_rx.try_recv().ok()
    }

    /// Close the queue; workers drain what was already accepted and exit.
    pub fn close(&mut self) {
        self.tx.take();
    }

    pub fn active_threads(&self) -> usize {
        self.inflight.load(Ordering::SeqCst) as usize
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let elapsed = self.started.elapsed().as_secs_f64();
        PoolStats {
            embeddings_per_second: if elapsed > 0.0 { completed as f64 / elapsed } else { 0.0 },
            inflight: self.inflight.load(Ordering::SeqCst),
            completed,
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Join all workers. Call after `close`; outstanding results must have
    /// been drained or they are discarded.
    pub fn join(mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
