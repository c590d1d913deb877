#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use code_indexer::embed::Embedder;
use code_indexer::error::Result;
use code_indexer::fts::FtsManager;
use code_indexer::git::GitAdapter;
use code_indexer::pool::CancelToken;
use code_indexer::processor::{BranchProcessor, IndexScope, NoGate, ProcessorOptions, Stats};
use code_indexer::progress::{ProgressEvent, ProgressReporter};
use code_indexer::query::QueryEngine;
use code_indexer::store::SqliteVectorStore;

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git runs");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "test"]);
    std::fs::write(dir.join(".gitignore"), ".harness/\n").unwrap();
}

pub fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn commit_all(dir: &Path, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// Embedder over a fixed vocabulary: each known token owns one dimension,
/// unknown tokens are dropped. Orthogonal by construction, which makes the
/// branch-visibility assertions exact.
pub struct KeywordEmbedder {
    vocab: Vec<&'static str>,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            vocab: vec![
                "auth", "feat", "util", "v1", "v2", "helper", "login", "walk", "parse",
            ],
        }
    }
}

impl Embedder for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.vocab.len()];
        for token in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
            if let Some(i) = self.vocab.iter().position(|v| *v == token.to_lowercase()) {
                vector[i] += 1.0;
            }
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.vocab.len()
    }

    fn model_name(&self) -> &str {
        "keyword"
    }
}

/// Core harness wired straight to the components, bypassing config and
/// daemon layers: a real git repo, the SQLite vector store, a tantivy index,
/// and the keyword embedder.
pub struct Harness {
    pub root: std::path::PathBuf,
    pub git: Arc<GitAdapter>,
    pub store: Arc<SqliteVectorStore>,
    pub fts: Arc<FtsManager>,
    pub processor: BranchProcessor,
    pub engine: QueryEngine,
}

impl Harness {
    pub fn open(root: &Path) -> Self {
        let git = Arc::new(GitAdapter::open(root).unwrap());
        let root = git.root().to_path_buf();
        let store = Arc::new(SqliteVectorStore::open(&root.join(".harness/index")).unwrap());
        let fts = Arc::new(FtsManager::open_or_create(&root.join(".harness/fts")).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(KeywordEmbedder::new());

        let processor = BranchProcessor::new(
            root.clone(),
            git.clone(),
            store.clone(),
            Some(fts.clone()),
            embedder.clone(),
            Arc::new(NoGate),
            ProcessorOptions { batch_size: 4, max_file_bytes: 1024 * 1024, worker_count: 2 },
        );
        let engine = QueryEngine::new(store.clone(), Some(fts.clone()), embedder, 5);

        Self { root, git, store, fts, processor, engine }
    }

    /// Index the given files into the current branch as a full-branch pass.
    pub fn index(&self, files: &[&str]) -> Stats {
        let files: Vec<String> = files.iter().map(|s| s.to_string()).collect();
        let branch = self.git.current_branch().unwrap();
        self.processor
            .process_files(&files, &branch, IndexScope::FullBranch, &ProgressReporter::disabled(), &CancelToken::new())
            .unwrap()
    }

    pub fn index_with_progress(&self, files: &[&str]) -> (Stats, Vec<ProgressEvent>) {
        use std::sync::Mutex;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = ProgressReporter::new(Box::new(move |e| {
            sink.lock().unwrap().push(e.clone());
        }));

        let files: Vec<String> = files.iter().map(|s| s.to_string()).collect();
        let branch = self.git.current_branch().unwrap();
        let stats = self
            .processor
            .process_files(&files, &branch, IndexScope::FullBranch, &reporter, &CancelToken::new())
            .unwrap();
        reporter.finish();

        let events = Arc::try_unwrap(events).unwrap().into_inner().unwrap();
        (stats, events)
    }

    /// Paths returned by a semantic query on a branch, in rank order.
    pub fn semantic_paths(&self, text: &str, branch: &str) -> Vec<String> {
        let filters = code_indexer::query::QueryFilters { limit: 10, ..Default::default() };
        let opts = code_indexer::query::QueryOptions::default();
        self.engine
            .semantic(text, &filters, &opts, branch)
            .unwrap()
            .into_iter()
            .filter(|r| r.score > 0.01)
            .map(|r| r.path)
            .collect()
    }

    /// Visible `(file_path, commit_ref, chunk_index)` triples in a branch.
    pub fn visible(&self, branch: &str) -> Vec<(String, String, u32)> {
        let mut out = Vec::new();
        code_indexer::store::scroll_all(
            self.store.as_ref(),
            &code_indexer::store::PointFilter::visible_in(branch),
            64,
            |p| {
                out.push((p.payload.file_path.clone(), p.payload.commit_ref.clone(), p.payload.chunk_index));
                Ok(())
            },
        )
        .unwrap();
        out.sort();
        out
    }
}
