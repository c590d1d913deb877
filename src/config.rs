use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const CONFIG_DIR: &str = ".code-indexer";
pub const CONFIG_FILE: &str = "config.json";
pub const SOCKET_FILE: &str = "daemon.sock";
pub const FTS_DIR: &str = "tantivy_index";
pub const VECTOR_DIR: &str = "index";

/// Repository configuration, loaded from `.code-indexer/config.json`.
/// Every field has a default so a missing file means "defaults everywhere".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub indexing: IndexingConfig,
    pub fts: FtsConfig,
    pub query: QueryConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub ttl_minutes: u64,
    pub eviction_check_interval_seconds: u64,
    pub max_retries: u32,
    pub retry_delays_ms: Vec<u64>,
    pub auto_shutdown_on_idle: bool,
    pub startup_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_minutes: 10,
            eviction_check_interval_seconds: 60,
            max_retries: 4,
            retry_delays_ms: vec![100, 500, 1000, 2000],
            auto_shutdown_on_idle: false,
            startup_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub max_file_bytes: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: 64,
            max_file_bytes: 1024 * 1024,
        }
    }
}

pub fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 8)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtsConfig {
    pub enabled: bool,
    pub diff_context_lines: u32,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self { enabled: true, diff_context_lines: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub over_fetch_multiplier: usize,
    pub result_cache_ttl_seconds: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { over_fetch_multiplier: 5, result_cache_ttl_seconds: 60 }
    }
}

/// Embedding backend selection. `Hash` is a deterministic offline backend
/// used by tests and air-gapped setups; `Ollama` is the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum EmbeddingConfig {
    Ollama { model: String, url: String },
    Hash { dimensions: usize },
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig::Ollama {
            model: "nomic-embed-text".into(),
            url: "http://localhost:11434".into(),
        }
    }
}

impl Config {
    /// Load from `<root>/.code-indexer/config.json`. A missing file yields
    /// defaults; a malformed file is a `ConfigInvalid` error.
    pub fn load(root: &Path) -> Result<Self> {
        let path = config_file(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = config_dir(root);
        std::fs::create_dir_all(&dir)?;
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(config_file(root), raw)?;
        Ok(())
    }

    pub fn effective_workers(&self) -> usize {
        self.indexing.worker_count.clamp(1, 8)
    }
}

pub fn config_dir(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR)
}

pub fn config_file(root: &Path) -> PathBuf {
    config_dir(root).join(CONFIG_FILE)
}

pub fn socket_path(root: &Path) -> PathBuf {
    config_dir(root).join(SOCKET_FILE)
}

pub fn fts_dir(root: &Path) -> PathBuf {
    config_dir(root).join(FTS_DIR)
}

pub fn vector_dir(root: &Path) -> PathBuf {
    config_dir(root).join(VECTOR_DIR)
}
