pub mod ollama;

use crate::config::EmbeddingConfig;
use crate::error::Result;

pub use ollama::OllamaEmbedder;

pub type Embedding = Vec<f32>;

/// External embedding provider: maps text to a fixed-dimension vector. The
/// core never assumes anything about the model beyond determinism per text.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Embedding>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Build the configured backend.
pub fn from_config(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config {
        EmbeddingConfig::Ollama { model, url } => {
            Ok(Box::new(OllamaEmbedder::new(url, model)?))
        }
        EmbeddingConfig::Hash { dimensions } => Ok(Box::new(HashEmbedder::new(*dimensions))),
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len().min(b.len()) {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

/// Deterministic offline embedder: token-hash bag-of-words vectors. No
/// semantic quality, but stable across hosts, which is what tests and
/// air-gapped smoke runs need.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(8) }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
            if token.is_empty() {
                continue;
            }
            let digest = blake3::hash(token.to_lowercase().as_bytes());
            let bytes = digest.as_bytes();
            let bucket = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                % self.dimensions;
            let sign = if bytes[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
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
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hash"
    }
}
