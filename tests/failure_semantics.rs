mod common;

use common::{KeywordEmbedder, commit_all, init_repo, write};

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use code_indexer::embed::Embedder;
use code_indexer::error::{Error, Result};
use code_indexer::git::GitAdapter;
use code_indexer::pool::CancelToken;
use code_indexer::processor::{BranchProcessor, IndexScope, NoGate, ProcessorOptions};
use code_indexer::progress::{ProgressEvent, ProgressReporter};
use code_indexer::store::{
    ContentPoint, PayloadPatch, PointFilter, PointId, ScoredPoint, ScrollPage, SqliteVectorStore,
    VectorStore,
};

/// Store wrapper that fails the first `failures` batch writes with a
/// retryable error, then behaves normally.
struct FlakyStore {
    inner: SqliteVectorStore,
    failures: AtomicU32,
    write_attempts: AtomicU32,
}

impl FlakyStore {
    fn new(inner: SqliteVectorStore, failures: u32) -> Self {
        Self { inner, failures: AtomicU32::new(failures), write_attempts: AtomicU32::new(0) }
    }
}

impl VectorStore for FlakyStore {
    fn upsert_batch(&self, points: &[ContentPoint]) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::BackendUnavailable("injected write failure".into()));
        }
        self.inner.upsert_batch(points)
    }

    fn get(&self, id: PointId) -> Result<Option<ContentPoint>> {
        self.inner.get(id)
    }

    fn delete(&self, ids: &[PointId]) -> Result<()> {
        self.inner.delete(ids)
    }

    fn patch_payload(&self, id: PointId, patch: &PayloadPatch) -> Result<()> {
        self.inner.patch_payload(id, patch)
    }

    fn scroll(&self, filter: &PointFilter, cursor: Option<u64>, limit: usize) -> Result<ScrollPage> {
        self.inner.scroll(filter, cursor, limit)
    }

    fn search_knn(&self, vector: &[f32], k: usize, filter: &PointFilter) -> Result<Vec<ScoredPoint>> {
        self.inner.search_knn(vector, k, filter)
    }

    fn count(&self) -> Result<u64> {
        self.inner.count()
    }

    fn create_collection(&self) -> Result<()> {
        self.inner.create_collection()
    }

    fn drop_collection(&self) -> Result<()> {
        self.inner.drop_collection()
    }
}

/// Embedder that rejects any text containing a poison marker.
struct PoisonEmbedder(KeywordEmbedder);

impl Embedder for PoisonEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("poison_marker") {
            return Err(Error::EmbedderFailure("injected embedder failure".into()));
        }
        self.0.embed(text)
    }

    fn dimensions(&self) -> usize {
        self.0.dimensions()
    }

    fn model_name(&self) -> &str {
        "poison"
    }
}

fn processor_with(
    root: &std::path::Path,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
) -> BranchProcessor {
    let git = Arc::new(GitAdapter::open(root).unwrap());
    BranchProcessor::new(
        git.root().to_path_buf(),
        git,
        store,
        None,
        embedder,
        Arc::new(NoGate),
        ProcessorOptions { batch_size: 4, max_file_bytes: 1024 * 1024, worker_count: 2 },
    )
}

#[test]
fn transient_store_failure_is_retried_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write(dir.path(), "a.py", "def auth():\n    return 1\n");
    commit_all(dir.path(), "content");

    let store_dir = dir.path().join(".harness/index");
    let flaky = Arc::new(FlakyStore::new(SqliteVectorStore::open(&store_dir).unwrap(), 2));
    let processor = processor_with(
        dir.path(),
        flaky.clone(),
        Arc::new(KeywordEmbedder::new()),
    );

    let stats = processor
        .process_files(
            &["a.py".to_string()],
            "main",
            IndexScope::FileSet,
            &ProgressReporter::disabled(),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(stats.files_processed, 1);
    // First try plus two retries: the third attempt landed.
    assert_eq!(flaky.write_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(flaky.count().unwrap(), 1);
}

#[test]
fn persistent_store_failure_aborts_with_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write(dir.path(), "a.py", "def auth():\n    return 1\n");
    commit_all(dir.path(), "content");

    let store_dir = dir.path().join(".harness/index");
    let flaky = Arc::new(FlakyStore::new(SqliteVectorStore::open(&store_dir).unwrap(), u32::MAX));
    let processor = processor_with(
        dir.path(),
        flaky.clone(),
        Arc::new(KeywordEmbedder::new()),
    );

    let events = Arc::new(std::sync::Mutex::new(Vec::<ProgressEvent>::new()));
    let sink = events.clone();
    let reporter = ProgressReporter::new(Box::new(move |e| sink.lock().unwrap().push(e.clone())));

    let err = processor
        .process_files(
            &["a.py".to_string()],
            "main",
            IndexScope::FileSet,
            &reporter,
            &CancelToken::new(),
        )
        .unwrap_err();
    reporter.finish();

    assert_eq!(err.kind(), "StoreWriteFailed");
    assert!(matches!(err, Error::StoreWriteFailed { ref failed_ids } if !failed_ids.is_empty()));
    // Retries are bounded: one initial try and two backoff retries.
    assert_eq!(flaky.write_attempts.load(Ordering::SeqCst), 3);
    // The final progress event fires even on a failed operation.
    let events = events.lock().unwrap();
    assert!(events.last().is_some_and(|e| e.is_final()));
}

#[test]
fn embedder_failure_isolates_to_the_file() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write(dir.path(), "good.py", "def auth():\n    return 1\n");
    write(dir.path(), "bad.py", "def poison_marker():\n    return 0\n");
    commit_all(dir.path(), "content");

    let store_dir = dir.path().join(".harness/index");
    let store = Arc::new(SqliteVectorStore::open(&store_dir).unwrap());
    let processor = processor_with(
        dir.path(),
        store.clone(),
        Arc::new(PoisonEmbedder(KeywordEmbedder::new())),
    );

    let stats = processor
        .process_files(
            &["bad.py".to_string(), "good.py".to_string()],
            "main",
            IndexScope::FullBranch,
            &ProgressReporter::disabled(),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(stats.files_processed, 1);
    assert_eq!(stats.files_failed, 1);
    assert_eq!(store.count().unwrap(), 1);

    let page = store.scroll(&PointFilter::visible_in("main"), None, 10).unwrap();
    assert_eq!(page.points.len(), 1);
    assert_eq!(page.points[0].payload.file_path, "good.py");
}
