use crossbeam_channel::{Sender, bounded};
use std::thread::JoinHandle;

/// Progress sample delivered to observers. The final event of every
/// operation carries `current == total` and `active_threads == 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub current: usize,
    pub total: usize,
    pub path: String,
    pub info: String,
    pub files_per_second: f64,
    pub kb_per_second: f64,
    pub active_threads: usize,
}

impl ProgressEvent {
    pub fn completed(total: usize, info: impl Into<String>) -> Self {
        Self {
            current: total,
            total,
            path: String::new(),
            info: info.into(),
            files_per_second: 0.0,
            kb_per_second: 0.0,
            active_threads: 0,
        }
    }

    pub fn is_final(&self) -> bool {
        self.current == self.total && self.active_threads == 0
    }
}

pub type ProgressFn = Box<dyn Fn(&ProgressEvent) + Send + 'static>;

/// Serializes progress callbacks through one reporter thread: workers post
/// events into a bounded channel, a single consumer invokes the callback.
/// No callback ever runs under the orchestrator's locks.
pub struct ProgressReporter {
    tx: Option<Sender<ProgressEvent>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn new(callback: ProgressFn) -> Self {
        let (tx, rx) = bounded::<ProgressEvent>(256);
        let handle = std::thread::spawn(move || {
            for event in rx.iter() {
                callback(&event);
            }
        });
        Self { tx: Some(tx), handle: Some(handle) }
    }

    /// Reporter that swallows everything; used when no observer registered.
    pub fn disabled() -> Self {
        Self { tx: None, handle: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Drain the queue and stop the reporter thread. Dropping does the same.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn events_are_delivered_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(Box::new(move |e| {
            sink.lock().unwrap().push((e.current, e.path.clone()));
        }));

        for i in 0..10 {
            reporter.emit(ProgressEvent {
                current: i,
                total: 10,
                path: format!("f{i}.py"),
                info: String::new(),
                files_per_second: 0.0,
                kb_per_second: 0.0,
                active_threads: 1,
            });
        }
        reporter.emit(ProgressEvent::completed(10, "done"));
        reporter.finish();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 11);
        assert_eq!(seen[0], (0, "f0.py".to_string()));
        assert_eq!(seen[10], (10, String::new()));
    }

    #[test]
    fn final_event_shape() {
        let e = ProgressEvent::completed(0, "empty");
        assert!(e.is_final());
        assert_eq!(e.current, 0);
        assert_eq!(e.total, 0);
        assert_eq!(e.active_threads, 0);
    }

    #[test]
    fn disabled_reporter_ignores_events() {
        let reporter = ProgressReporter::disabled();
        reporter.emit(ProgressEvent::completed(1, "x"));
        reporter.finish();
    }

    #[test]
    fn drop_flushes_queued_events() {
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        {
            let reporter = ProgressReporter::new(Box::new(move |_| {
                *sink.lock().unwrap() += 1;
            }));
            for _ in 0..50 {
                reporter.emit(ProgressEvent::completed(1, "x"));
            }
        }
        assert_eq!(*seen.lock().unwrap(), 50);
    }
}
