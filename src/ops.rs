use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::chunk::walker::{WalkConfig, walk_files};
use crate::config::{self, Config};
use crate::embed::{self, Embedder};
use crate::error::{Error, Result};
use crate::fts::FtsManager;
use crate::git::GitAdapter;
use crate::pool::CancelToken;
use crate::processor::{BranchProcessor, IndexScope, NoGate, ProcessorOptions, Stats, WriteGate};
use crate::progress::ProgressReporter;
use crate::query::{
    QueryEngine, QueryFilters, QueryMode, QueryOptions, QueryResult, ResultCache, cache,
};
use crate::store::{PointFilter, SqliteVectorStore, VectorStore, scroll_all};

/// Everything needed to run operations against one repository. The daemon
/// keeps one of these alive per repo inside its cache entry; the in-process
/// path builds one per command.
pub struct RepoContext {
    pub root: PathBuf,
    pub config: Config,
    pub git: Arc<GitAdapter>,
    pub store: Arc<SqliteVectorStore>,
    pub fts: Option<Arc<FtsManager>>,
    pub gate: Arc<dyn WriteGate>,
    pub result_cache: Arc<ResultCache>,
    embedder: Arc<DeferredEmbedder>,
}

/// Defers backend construction until the first embedding: the Ollama
/// backend probes its endpoint when built, and operations like status or
/// clean must work with the endpoint down.
struct DeferredEmbedder {
    config: crate::config::EmbeddingConfig,
    model_name: String,
    inner: Mutex<Option<Arc<dyn Embedder>>>,
}

impl DeferredEmbedder {
    fn new(config: crate::config::EmbeddingConfig) -> Self {
        let model_name = match &config {
            crate::config::EmbeddingConfig::Ollama { model, .. } => model.clone(),
            crate::config::EmbeddingConfig::Hash { .. } => "hash".to_string(),
        };
        Self { config, model_name, inner: Mutex::new(None) }
    }

    fn backend(&self) -> Result<Arc<dyn Embedder>> {
        let mut slot = self.inner.lock();
        if let Some(e) = slot.as_ref() {
            return Ok(e.clone());
        }
        let built: Arc<dyn Embedder> = embed::from_config(&self.config)?.into();
        *slot = Some(built.clone());
        Ok(built)
    }
}

impl Embedder for DeferredEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.backend()?.embed(text)
    }

    fn dimensions(&self) -> usize {
        self.inner.lock().as_ref().map(|e| e.dimensions()).unwrap_or(0)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl RepoContext {
    pub fn open(root: &Path, config: Config, gate: Arc<dyn WriteGate>) -> Result<Self> {
        let git = Arc::new(GitAdapter::open(root)?);
        let root = git.root().to_path_buf();
        let store = Arc::new(SqliteVectorStore::open(&config::vector_dir(&root))?);

        let fts_dir = config::fts_dir(&root);
        let fts = if config.fts.enabled {
            Some(Arc::new(FtsManager::open_or_create(&fts_dir)?))
        } else if FtsManager::exists(&fts_dir) {
            // Built previously; keep serving it even if config flipped off.
            Some(Arc::new(FtsManager::open(&fts_dir)?))
        } else {
            None
        };

        let result_cache = Arc::new(ResultCache::new(Duration::from_secs(
            config.query.result_cache_ttl_seconds,
        )));

        let embedder = Arc::new(DeferredEmbedder::new(config.embedding.clone()));
        Ok(Self { root, config, git, store, fts, gate, result_cache, embedder })
    }

    pub fn open_in_process(root: &Path, config: Config) -> Result<Self> {
        Self::open(root, config, Arc::new(NoGate))
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    pub fn processor(&self) -> BranchProcessor {
        BranchProcessor::new(
            self.root.clone(),
            self.git.clone(),
            self.store.clone(),
            self.fts.clone(),
            self.embedder(),
            self.gate.clone(),
            ProcessorOptions {
                batch_size: self.config.indexing.batch_size,
                max_file_bytes: self.config.indexing.max_file_bytes,
                worker_count: self.config.effective_workers(),
            },
        )
    }

    pub fn query_engine(&self) -> QueryEngine {
        QueryEngine::new(
            self.store.clone(),
            self.fts.clone(),
            self.embedder(),
            self.config.query.over_fetch_multiplier,
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexArgs {
    pub clear: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReport {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_processed: usize,
    pub total_source_bytes: u64,
    pub canceled: bool,
}

impl From<&Stats> for IndexReport {
    fn from(stats: &Stats) -> Self {
        Self {
            files_processed: stats.files_processed,
            files_skipped: stats.files_skipped,
            files_failed: stats.files_failed,
            chunks_processed: stats.chunks_processed,
            total_source_bytes: stats.total_source_bytes,
            canceled: stats.canceled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryArgs {
    pub text: String,
    pub mode: QueryMode,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryReport {
    pub results: Vec<QueryResult>,
    pub fts_missing_warning: bool,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub root: String,
    pub branch: String,
    pub branches: Vec<String>,
    pub point_count: u64,
    pub visible_point_count: u64,
    pub fts_available: bool,
    pub fts_doc_count: u64,
    pub languages: BTreeMap<String, u64>,
    pub generated_at: String,
}

/// Full indexing pass over the working tree of the current branch.
pub fn index(
    ctx: &RepoContext,
    args: &IndexArgs,
    progress: &ProgressReporter,
    cancel: &CancelToken,
) -> Result<IndexReport> {
    if args.clear {
        let store = ctx.store.clone();
        let fts = ctx.fts.clone();
        ctx.gate.with_write(&mut || {
            store.drop_collection()?;
            if let Some(fts) = &fts {
                fts.clear()?;
            }
            Ok(())
        })?;
    }

    let branch = ctx.git.current_branch()?;
    let files = walk_files(
        &ctx.root,
        &WalkConfig {
            max_threads: ctx.config.effective_workers(),
            max_file_bytes: ctx.config.indexing.max_file_bytes,
        },
    )
    .map_err(Error::internal)?;

    info!(branch = %branch, files = files.len(), "indexing");
    let processor = ctx.processor();
    let stats = processor.process_files(&files, &branch, IndexScope::FullBranch, progress, cancel)?;

    ctx.result_cache.flush();
    Ok(IndexReport::from(&stats))
}

/// One entry point for all three query modes, with the result cache in
/// front. Cached entries are only served within their TTL; every write path
/// flushes the cache before this can observe stale data.
pub fn query(ctx: &RepoContext, args: &QueryArgs) -> Result<QueryReport> {
    let branch = ctx.git.current_branch()?;
    let key = cache::fingerprint(args.mode, &args.text, &args.filters, &args.options, &branch);

    if let Some(results) = ctx.result_cache.get(key) {
        return Ok(QueryReport { results, fts_missing_warning: false, branch });
    }

    let engine = ctx.query_engine();
    let (results, fts_missing_warning) = match args.mode {
        QueryMode::Semantic => {
            (engine.semantic(&args.text, &args.filters, &args.options, &branch)?, false)
        }
        QueryMode::Fts => (engine.fts(&args.text, &args.filters, &args.options)?, false),
        QueryMode::Hybrid => engine.hybrid(&args.text, &args.filters, &args.options, &branch)?,
    };

    // Degraded hybrid responses are not cached: the warning flag would be
    // lost on a cache hit.
    if !fts_missing_warning {
        ctx.result_cache.put(key, results.clone());
    }
    Ok(QueryReport { results, fts_missing_warning, branch })
}

/// Clear vector data. The caller is responsible for dropping cached handles
/// (the daemon rebuilds its context afterwards).
pub fn clean(ctx: &RepoContext) -> Result<()> {
    let store = ctx.store.clone();
    ctx.gate.with_write(&mut || store.drop_collection())?;
    ctx.result_cache.flush();
    info!("vector data cleared");
    Ok(())
}

/// Drop everything: vector data, FTS directory, and the local index files.
pub fn clean_data(ctx: &RepoContext) -> Result<()> {
    let store = ctx.store.clone();
    ctx.gate.with_write(&mut || store.drop_collection())?;
    ctx.result_cache.flush();

    let fts_dir = config::fts_dir(&ctx.root);
    if fts_dir.exists() {
        std::fs::remove_dir_all(&fts_dir)?;
    }
    info!("index data removed");
    Ok(())
}

pub fn status(ctx: &RepoContext) -> Result<StatusReport> {
    let branch = ctx.git.current_branch()?;
    let branches = ctx.git.list_branches()?;
    let point_count = ctx.store.count()?;

    let mut visible = 0u64;
    let mut languages: BTreeMap<String, u64> = BTreeMap::new();
    scroll_all(ctx.store.as_ref(), &PointFilter::visible_in(&branch), 512, |p| {
        visible += 1;
        if let Some(lang) = &p.payload.language {
            *languages.entry(lang.clone()).or_default() += 1;
        }
        Ok(())
    })?;

    Ok(StatusReport {
        root: ctx.root.display().to_string(),
        branch,
        branches,
        point_count,
        visible_point_count: visible,
        fts_available: ctx.fts.is_some(),
        fts_doc_count: ctx.fts.as_ref().map(|f| f.doc_count()).unwrap_or(0),
        languages,
        generated_at: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
struct QueryWire {
    text: String,
    #[serde(default)]
    filters: QueryFilters,
    #[serde(default)]
    options: QueryOptions,
}

/// Shared RPC dispatch: the daemon handlers and the client's in-process
/// fallback execute the same code path. Lock acquisition is the caller's
/// concern (the daemon holds its read gate around query methods).
pub fn dispatch(
    ctx: &RepoContext,
    method: &str,
    args: &serde_json::Value,
    progress: &ProgressReporter,
    cancel: &CancelToken,
) -> Result<serde_json::Value> {
    match method {
        "query_semantic" | "query_fts" | "query_hybrid" => {
            let wire: QueryWire = serde_json::from_value(args.clone())
                .map_err(|e| Error::InvalidArgument(format!("bad query args: {e}")))?;
            let mode = match method {
                "query_semantic" => QueryMode::Semantic,
                "query_fts" => QueryMode::Fts,
                _ => QueryMode::Hybrid,
            };
            let report = query(
                ctx,
                &QueryArgs { text: wire.text, mode, filters: wire.filters, options: wire.options },
            )?;
            Ok(serde_json::to_value(report)?)
        }
        "index" => {
            let index_args: IndexArgs = serde_json::from_value(args.clone())
                .map_err(|e| Error::InvalidArgument(format!("bad index args: {e}")))?;
            let report = index(ctx, &index_args, progress, cancel)?;
            if report.canceled {
                return Err(Error::Canceled);
            }
            Ok(serde_json::to_value(report)?)
        }
        "clean" => {
            clean(ctx)?;
            Ok(serde_json::json!({ "ok": true }))
        }
        "clean_data" => {
            clean_data(ctx)?;
            Ok(serde_json::json!({ "ok": true }))
        }
        "status" => Ok(serde_json::to_value(status(ctx)?)?),
        other => Err(Error::InvalidArgument(format!("unknown method: {other}"))),
    }
}

/// Hide a deleted or branch-foreign file and flush the caches that could
/// still reference it.
pub fn remove_file(ctx: &RepoContext, rel_path: &str, branch: &str) -> Result<()> {
    let processor = ctx.processor();
    processor.hide_file_in_branch(rel_path, branch)?;
    if let Some(fts) = &ctx.fts {
        let fts = fts.clone();
        let path = rel_path.to_string();
        ctx.gate.with_write(&mut || {
            fts.delete_by_path(&path)?;
            fts.commit()?;
            fts.reopen_searcher()
        })?;
    }
    ctx.result_cache.flush_path(rel_path);
    Ok(())
}
