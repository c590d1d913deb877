use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

use crate::chunk::{chunk_file, detect_language, is_binary_path};
use crate::content::{ContentRef, is_working_ref};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::fts::{FtsDoc, FtsManager};
use crate::git::GitAdapter;
use crate::pool::{CancelToken, WorkerPool};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::{
    ContentPoint, Payload, PayloadPatch, PointFilter, PointId, VectorStore, scroll_all,
};

const SCROLL_PAGE: usize = 256;
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(500)];

/// Whether an indexing pass covers the whole branch (and may therefore hide
/// content missing from it) or only an explicit file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexScope {
    FullBranch,
    FileSet,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub files_processed: usize,
    pub chunks_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub total_source_bytes: u64,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub canceled: bool,
}

/// Serializes index writes against concurrent readers. The daemon supplies a
/// gate backed by the cache entry's rw-lock; in-process runs use `NoGate`.
pub trait WriteGate: Send + Sync {
    fn with_write(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

pub struct NoGate;

impl WriteGate for NoGate {
    fn with_write(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        f()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub batch_size: usize,
    pub max_file_bytes: u64,
    pub worker_count: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_file_bytes: 1024 * 1024,
            worker_count: crate::config::default_worker_count(),
        }
    }
}

/// The single indexing engine. All indexing intents funnel through it:
/// full-branch passes, explicit file sets, branch switches, and the
/// visibility bookkeeping that keeps one point per `(path, chunk, branch)`.
pub struct BranchProcessor {
    root: PathBuf,
    git: Arc<GitAdapter>,
    store: Arc<dyn VectorStore>,
    fts: Option<Arc<FtsManager>>,
    embedder: Arc<dyn Embedder>,
    gate: Arc<dyn WriteGate>,
    options: ProcessorOptions,
}

enum FileResult {
    Done(FileOutcome),
    Skipped { path: String, reason: String },
}

struct FileOutcome {
    path: String,
    upserts: Vec<ContentPoint>,
    patches: Vec<(PointId, PayloadPatch)>,
    fts_docs: Vec<FtsDoc>,
    source_bytes: u64,
    chunk_count: usize,
}

#[derive(Default)]
struct Batch {
    upserts: Vec<ContentPoint>,
    patches: Vec<(PointId, PayloadPatch)>,
    fts_paths: Vec<String>,
    fts_docs: Vec<FtsDoc>,
    files: usize,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.files == 0 && self.patches.is_empty()
    }

    fn clear(&mut self) {
        self.upserts.clear();
        self.patches.clear();
        self.fts_paths.clear();
        self.fts_docs.clear();
        self.files = 0;
    }
}

impl BranchProcessor {
    pub fn new(
        root: PathBuf,
        git: Arc<GitAdapter>,
        store: Arc<dyn VectorStore>,
        fts: Option<Arc<FtsManager>>,
        embedder: Arc<dyn Embedder>,
        gate: Arc<dyn WriteGate>,
        options: ProcessorOptions,
    ) -> Self {
        Self { root, git, store, fts, embedder, gate, options }
    }

    /// Index a set of files into `branch`. With `IndexScope::FullBranch` the
    /// file list is taken as the branch's complete content and anything else
    /// is hidden afterwards. Idempotent: content ids are deterministic and
    /// duplicate inserts are no-ops, so re-running converges.
    pub fn process_files(
        &self,
        files: &[String],
        branch: &str,
        scope: IndexScope,
        progress: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<Stats> {
        let started = Instant::now();
        let mut stats = Stats { start_time: Some(SystemTime::now()), ..Default::default() };
        let total = files.len();

        let outcome = self.run_pipeline(files, branch, progress, cancel, started, &mut stats);

        if !stats.canceled && outcome.is_ok() && scope == IndexScope::FullBranch {
            let current: HashSet<String> = files.iter().cloned().collect();
            self.hide_files_not_in_branch(branch, &current)?;
        }

        if let Some(fts) = &self.fts {
            fts.commit()?;
            fts.reopen_searcher()?;
        }

        stats.end_time = Some(SystemTime::now());
        let info = if stats.canceled { "canceled" } else { "complete" };
        progress.emit(ProgressEvent::completed(total, info));
        outcome?;
        Ok(stats)
    }

    fn run_pipeline(
        &self,
        files: &[String],
        branch: &str,
        progress: &ProgressReporter,
        cancel: &CancelToken,
        started: Instant,
        stats: &mut Stats,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let queue = (self.options.worker_count * 2).max(4);
        let pool: WorkerPool<FileResult> =
            WorkerPool::new(self.options.worker_count, queue, cancel.clone());

        let mut batch = Batch::default();
        let mut submitted = 0usize;
        let mut drained = 0usize;
        let mut completed_files = 0usize;

        for path in files {
            if cancel.is_canceled() {
                stats.canceled = true;
                break;
            }
            while let Some(result) = pool.try_wait_one() {
                drained += 1;
                completed_files += 1;
                self.absorb(result, &mut batch, stats, progress, completed_files, files.len(), started, &pool)?;
                self.flush_if_full(&mut batch, cancel, stats)?;
            }
            match pool.submit(Box::new(self.file_job(path.clone(), branch.to_string()))) {
                Ok(()) => submitted += 1,
                Err(Error::Canceled) => {
                    stats.canceled = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        while drained < submitted {
            let result = pool.wait_one();
            drained += 1;
            completed_files += 1;
            self.absorb(result, &mut batch, stats, progress, completed_files, files.len(), started, &pool)?;
            self.flush_if_full(&mut batch, cancel, stats)?;
        }

        // Partial batches already accepted complete even on cancel.
        self.apply_batch(&mut batch)?;
        if cancel.is_canceled() {
            stats.canceled = true;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb(
        &self,
        result: Result<FileResult>,
        batch: &mut Batch,
        stats: &mut Stats,
        progress: &ProgressReporter,
        completed_files: usize,
        total: usize,
        started: Instant,
        pool: &WorkerPool<FileResult>,
    ) -> Result<()> {
        let (path, info) = match result {
            Ok(FileResult::Done(outcome)) => {
                stats.files_processed += 1;
                stats.chunks_processed += outcome.chunk_count;
                stats.total_source_bytes += outcome.source_bytes;
                let path = outcome.path.clone();
                batch.upserts.extend(outcome.upserts);
                batch.patches.extend(outcome.patches);
                if !outcome.fts_docs.is_empty() || outcome.chunk_count == 0 {
                    batch.fts_paths.push(outcome.path.clone());
                }
                batch.fts_docs.extend(outcome.fts_docs);
                batch.files += 1;
                (path, format!("indexed ({} chunks)", outcome.chunk_count))
            }
            Ok(FileResult::Skipped { path, reason }) => {
                stats.files_skipped += 1;
                warn!(path = %path, reason = %reason, "file skipped");
                (path, format!("skipped: {reason}"))
            }
            Err(Error::Canceled) => {
                return Ok(());
            }
            Err(e) => {
                stats.files_failed += 1;
                warn!(error = %e, "file failed");
                (String::new(), format!("failed: {e}"))
            }
        };

        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        progress.emit(ProgressEvent {
            current: completed_files,
            total,
            path,
            info,
            files_per_second: completed_files as f64 / elapsed,
            kb_per_second: stats.total_source_bytes as f64 / 1024.0 / elapsed,
            active_threads: pool.active_threads(),
        });
        Ok(())
    }

    fn flush_if_full(&self, batch: &mut Batch, cancel: &CancelToken, stats: &mut Stats) -> Result<()> {
        if batch.files >= self.options.batch_size {
            self.apply_batch(batch)?;
            if cancel.is_canceled() {
                stats.canceled = true;
            }
        }
        Ok(())
    }

    /// The per-file worker. Runs on a pool thread; reads the store but all
    /// writes are returned to the orchestrator for batched application.
    fn file_job(
        &self,
        path: String,
        branch: String,
    ) -> impl FnOnce() -> Result<FileResult> + Send + 'static {
        let root = self.root.clone();
        let git = self.git.clone();
        let store = self.store.clone();
        let embedder = self.embedder.clone();
        let fts_enabled = self.fts.is_some();
        let max_file_bytes = self.options.max_file_bytes;

        move || {
            let commit_ref = match git.file_commit(&path) {
                Ok(r) => r,
                Err(e) => {
                    return Ok(FileResult::Skipped { path, reason: format!("git: {e}") });
                }
            };

            let abs = root.join(&path);
            let bytes = match std::fs::read(&abs) {
                Ok(b) => b,
                Err(e) => {
                    return Ok(FileResult::Skipped { path, reason: format!("read: {e}") });
                }
            };
            if bytes.len() as u64 > max_file_bytes {
                return Ok(FileResult::Skipped {
                    path,
                    reason: format!("exceeds max file size ({} bytes)", bytes.len()),
                });
            }

            let source_bytes = bytes.len() as u64;
            let text = if is_binary_path(&path) { None } else { String::from_utf8(bytes).ok() };
            let language = detect_language(&path).map(String::from);
            let chunks = match &text {
                Some(t) => chunk_file(t, language.as_deref()),
                None => Vec::new(),
            };

            let mut outcome = FileOutcome {
                path: path.clone(),
                upserts: Vec::new(),
                patches: Vec::new(),
                fts_docs: Vec::new(),
                source_bytes,
                chunk_count: chunks.len(),
            };

            if chunks.is_empty() {
                // Binary or empty now: any stale points for this file must
                // not stay visible in the branch.
                outcome.patches = stale_point_patches(store.as_ref(), &path, &branch, "")?;
                return Ok(FileResult::Done(outcome));
            }

            let meta = std::fs::metadata(&abs).ok();
            let mtime_ns = meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as u64);
            let size_bytes = meta.as_ref().map(|m| m.len());
            let blob_hash =
                if is_working_ref(&commit_ref) { None } else { git.head_blob(&path) };

            for chunk in &chunks {
                let content_ref = ContentRef::new(path.clone(), commit_ref.clone(), chunk.chunk_index);
                let id = content_ref.content_id();

                match store.get(id)? {
                    Some(existing) => {
                        // Dedup across branches: the content is already
                        // embedded; only visibility may need repair.
                        if existing.payload.hidden_branches.contains(&branch) {
                            outcome.patches.push((id, PayloadPatch::show_in(&branch)));
                        }
                    }
                    None => {
                        let vector = embedder
                            .embed(&chunk.text)
                            .map_err(|e| Error::EmbedderFailure(format!("{path}: {e}")))?;
                        outcome.upserts.push(ContentPoint {
                            id,
                            vector,
                            payload: Payload {
                                file_path: path.clone(),
                                commit_ref: commit_ref.clone(),
                                chunk_index: chunk.chunk_index,
                                language: language.clone(),
                                hidden_branches: Default::default(),
                                git_blob_hash: blob_hash.clone(),
                                mtime_ns,
                                size_bytes,
                                content_text: chunk.text.clone(),
                                start_line: chunk.start_line,
                                end_line: chunk.end_line,
                                chunk_kind: chunk.kind.clone(),
                                symbol: chunk.name.clone(),
                            },
                        });
                    }
                }

                if fts_enabled {
                    outcome.fts_docs.push(FtsDoc {
                        path: path.clone(),
                        language: language.clone(),
                        line: chunk.start_line as u64,
                        column: 1,
                        snippet: chunk.text.lines().take(5).collect::<Vec<_>>().join("\n"),
                        content_text: chunk.text.clone(),
                        doc_id: id.to_string(),
                    });
                }
            }

            // Point-in-time snapshot: any version of this file other than the
            // one just resolved must become invisible in this branch. That
            // hides committed points when the worktree is dirty and the old
            // working-dir points after a commit, in one rule.
            outcome
                .patches
                .extend(stale_point_patches(store.as_ref(), &path, &branch, &commit_ref)?);

            Ok(FileResult::Done(outcome))
        }
    }

    /// Apply one batch atomically with respect to readers: upserts first,
    /// then visibility patches, then the FTS mutations for the same files.
    fn apply_batch(&self, batch: &mut Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let store = &self.store;
        let fts = &self.fts;
        let upserts = std::mem::take(&mut batch.upserts);
        let patches = std::mem::take(&mut batch.patches);
        let fts_paths = std::mem::take(&mut batch.fts_paths);
        let fts_docs = std::mem::take(&mut batch.fts_docs);

        self.gate.with_write(&mut || {
            write_with_retry(store.as_ref(), &upserts)?;
            for (id, patch) in &patches {
                store.patch_payload(*id, patch)?;
            }
            if let Some(fts) = fts {
                for path in &fts_paths {
                    fts.delete_by_path(path)?;
                }
                for doc in &fts_docs {
                    fts.add_doc(doc)?;
                }
            }
            Ok(())
        })?;

        batch.clear();
        debug!(upserts = upserts.len(), patches = patches.len(), "batch applied");
        Ok(())
    }

    /// Branch switch: reprocess changed files, repair visibility of
    /// unchanged ones, then hide everything the new branch does not have.
    pub fn process_branch_change(
        &self,
        _old_branch: &str,
        new_branch: &str,
        changed_files: &[String],
        unchanged_files: &[String],
        progress: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<Stats> {
        for path in unchanged_files {
            cancel.check()?;
            self.ensure_file_visible_in_branch(path, new_branch)?;
        }

        let stats =
            self.process_files(changed_files, new_branch, IndexScope::FileSet, progress, cancel)?;

        if !stats.canceled {
            let current: HashSet<String> = changed_files
                .iter()
                .chain(unchanged_files.iter())
                .cloned()
                .collect();
            self.hide_files_not_in_branch(new_branch, &current)?;
        }
        Ok(stats)
    }

    pub fn hide_file_in_branch(&self, file_path: &str, branch: &str) -> Result<u64> {
        let mut patches = Vec::new();
        let filter = PointFilter {
            file_path: Some(file_path.to_string()),
            hidden_not_contains: Some(branch.to_string()),
            ..Default::default()
        };
        scroll_all(self.store.as_ref(), &filter, SCROLL_PAGE, |p| {
            patches.push((p.id, PayloadPatch::hide_in(branch)));
            Ok(())
        })?;
        self.apply_patches(patches)
    }

    pub fn ensure_file_visible_in_branch(&self, file_path: &str, branch: &str) -> Result<u64> {
        let mut patches = Vec::new();
        let filter = PointFilter {
            file_path: Some(file_path.to_string()),
            hidden_contains: Some(branch.to_string()),
            ..Default::default()
        };
        scroll_all(self.store.as_ref(), &filter, SCROLL_PAGE, |p| {
            patches.push((p.id, PayloadPatch::show_in(branch)));
            Ok(())
        })?;
        self.apply_patches(patches)
    }

    /// Hide every point whose path is not in `current_files` and which is
    /// still visible in `branch`.
    pub fn hide_files_not_in_branch(
        &self,
        branch: &str,
        current_files: &HashSet<String>,
    ) -> Result<u64> {
        let mut patches = Vec::new();
        scroll_all(self.store.as_ref(), &PointFilter::visible_in(branch), SCROLL_PAGE, |p| {
            if !current_files.contains(&p.payload.file_path) {
                patches.push((p.id, PayloadPatch::hide_in(branch)));
            }
            Ok(())
        })?;
        let hidden = self.apply_patches(patches)?;
        if hidden > 0 {
            debug!(branch, hidden, "hid points absent from branch");
        }
        Ok(hidden)
    }

    /// Hide all content in a branch. Safe to call on a deleted branch; the
    /// points stay alive for other branches until garbage collection.
    pub fn cleanup_branch(&self, branch: &str) -> Result<u64> {
        let mut patches = Vec::new();
        scroll_all(self.store.as_ref(), &PointFilter::visible_in(branch), SCROLL_PAGE, |p| {
            patches.push((p.id, PayloadPatch::hide_in(branch)));
            Ok(())
        })?;
        self.apply_patches(patches)
    }

    /// Delete every point hidden in all known branches. Git refs are the
    /// ground truth for "known". Interruptible: re-running completes.
    pub fn garbage_collect(&self) -> Result<u64> {
        let known: HashSet<String> = self.git.list_branches()?.into_iter().collect();
        if known.is_empty() {
            return Ok(0);
        }
        let mut garbage: Vec<PointId> = Vec::new();
        scroll_all(self.store.as_ref(), &PointFilter::default(), SCROLL_PAGE, |p| {
            if known.iter().all(|b| p.payload.hidden_branches.contains(b)) {
                garbage.push(p.id);
            }
            Ok(())
        })?;

        let total = garbage.len() as u64;
        for ids in garbage.chunks(SCROLL_PAGE) {
            self.gate.with_write(&mut || self.store.delete(ids))?;
        }
        if total > 0 {
            debug!(deleted = total, "garbage collected");
        }
        Ok(total)
    }

    fn apply_patches(&self, patches: Vec<(PointId, PayloadPatch)>) -> Result<u64> {
        let count = patches.len() as u64;
        for page in patches.chunks(SCROLL_PAGE) {
            self.gate.with_write(&mut || {
                for (id, patch) in page {
                    self.store.patch_payload(*id, patch)?;
                }
                Ok(())
            })?;
        }
        Ok(count)
    }
}

/// Patches hiding every point of `file_path` in `branch` whose commit ref
/// differs from `current_ref`. An empty `current_ref` hides all of them.
fn stale_point_patches(
    store: &dyn VectorStore,
    file_path: &str,
    branch: &str,
    current_ref: &str,
) -> Result<Vec<(PointId, PayloadPatch)>> {
    let filter = PointFilter {
        file_path: Some(file_path.to_string()),
        hidden_not_contains: Some(branch.to_string()),
        ..Default::default()
    };
    let mut patches = Vec::new();
    scroll_all(store, &filter, SCROLL_PAGE, |p| {
        if p.payload.commit_ref != current_ref {
            patches.push((p.id, PayloadPatch::hide_in(branch)));
        }
        Ok(())
    })?;
    Ok(patches)
}

fn write_with_retry(store: &dyn VectorStore, points: &[ContentPoint]) -> Result<()> {
    if points.is_empty() {
        return Ok(());
    }
    let mut failed_ids = Vec::new();
    for (attempt, delay) in
        std::iter::once(None).chain(RETRY_DELAYS.iter().map(Some)).enumerate()
    {
        if let Some(delay) = delay {
            warn!(attempt, "store write failed, retrying");
            std::thread::sleep(*delay);
        }
        match store.upsert_batch(points) {
            Ok(()) => return Ok(()),
            Err(Error::StoreWriteFailed { failed_ids: ids }) => failed_ids = ids,
            Err(Error::BackendUnavailable(_)) => {
                failed_ids = points.iter().map(|p| p.id).collect();
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::StoreWriteFailed { failed_ids })
}
