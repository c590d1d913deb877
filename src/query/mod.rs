pub mod cache;
pub mod filters;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::fts::{FtsManager, FtsSearchOpts};
use crate::store::{PointFilter, VectorStore};

pub use cache::{ResultCache, fingerprint};
pub use filters::{CompiledFilters, QueryFilters, language_extensions};

pub const DEFAULT_SEMANTIC_WEIGHT: f32 = 0.5;
pub const DEFAULT_FTS_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Semantic,
    Fts,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub path: String,
    pub line: u64,
    pub column: u64,
    pub score: f32,
    pub semantic_score: Option<f32>,
    pub fts_score: Option<f32>,
    pub combined_score: Option<f32>,
    pub snippet: String,
    pub language: Option<String>,
    pub symbol: Option<String>,
    pub from_semantic: bool,
    pub from_fts: bool,
}

/// Per-call knobs beyond the shared filter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub case_sensitive: bool,
    pub edit_distance: u8,
    pub regex: bool,
    pub snippet_lines: usize,
    pub semantic_weight: f32,
    pub fts_weight: f32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            edit_distance: 0,
            regex: false,
            snippet_lines: 5,
            semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
            fts_weight: DEFAULT_FTS_WEIGHT,
        }
    }
}

/// Search over the vector store and FTS index. Filter composition is shared
/// by every mode and applied post-search so semantics stay identical.
pub struct QueryEngine {
    store: Arc<dyn VectorStore>,
    fts: Option<Arc<FtsManager>>,
    embedder: Arc<dyn Embedder>,
    over_fetch: usize,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        fts: Option<Arc<FtsManager>>,
        embedder: Arc<dyn Embedder>,
        over_fetch: usize,
    ) -> Self {
        Self { store, fts, embedder, over_fetch: over_fetch.max(1) }
    }

    fn limit(filters: &QueryFilters) -> usize {
        if filters.limit == 0 { 20 } else { filters.limit }
    }

    pub fn semantic(
        &self,
        text: &str,
        filters: &QueryFilters,
        opts: &QueryOptions,
        branch: &str,
    ) -> Result<Vec<QueryResult>> {
        let compiled = CompiledFilters::compile(filters)?;
        let limit = Self::limit(filters);

        let query_vector = self
            .embedder
            .embed(text)
            .map_err(|e| Error::EmbedderFailure(format!("query embedding: {e}")))?;

        let candidates = self.store.search_knn(
            &query_vector,
            limit * self.over_fetch,
            &PointFilter::visible_in(branch),
        )?;

        let mut results = Vec::new();
        for hit in candidates {
            let payload = &hit.point.payload;
            if !compiled.accept(&payload.file_path) {
                continue;
            }
            if let Some(min) = filters.min_score {
                if hit.score < min {
                    continue;
                }
            }
            results.push(QueryResult {
                path: payload.file_path.clone(),
                line: payload.start_line as u64,
                column: 1,
                score: hit.score,
                semantic_score: Some(hit.score),
                fts_score: None,
                combined_score: None,
                snippet: first_lines(&payload.content_text, opts.snippet_lines),
                language: payload.language.clone(),
                symbol: payload.symbol.clone(),
                from_semantic: true,
                from_fts: false,
            });
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    pub fn fts(&self, text: &str, filters: &QueryFilters, opts: &QueryOptions) -> Result<Vec<QueryResult>> {
        let fts = self
            .fts
            .as_ref()
            .ok_or_else(|| Error::IndexMissing("full-text index is not built".into()))?;
        let compiled = CompiledFilters::compile(filters)?;
        let limit = Self::limit(filters);

        let hits = fts.search(
            text,
            &FtsSearchOpts {
                case_sensitive: opts.case_sensitive,
                edit_distance: opts.edit_distance,
                regex: opts.regex,
                snippet_lines: opts.snippet_lines,
                limit: limit * self.over_fetch,
            },
        )?;

        // Normalize relevance to [0,1] over the batch so scores are
        // comparable during hybrid merge.
        let max = hits.iter().map(|h| h.score).fold(f32::MIN, f32::max);
        let min = hits.iter().map(|h| h.score).fold(f32::MAX, f32::min);
        let range = (max - min).max(f32::EPSILON);

        let mut results = Vec::new();
        for hit in hits {
            if !compiled.accept(&hit.doc.path) {
                continue;
            }
            let normalized = if hits_len_one(max, min) { 1.0 } else { (hit.score - min) / range };
            results.push(QueryResult {
                path: hit.doc.path,
                line: hit.doc.line,
                column: hit.doc.column,
                score: normalized,
                semantic_score: None,
                fts_score: Some(normalized),
                combined_score: None,
                snippet: hit.doc.snippet,
                language: hit.doc.language,
                symbol: None,
                from_semantic: false,
                from_fts: true,
            });
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Semantic and FTS in parallel, merged by result key with weighted
    /// scores. A missing FTS index degrades to semantic-only with the
    /// warning flag set rather than an error.
    pub fn hybrid(
        &self,
        text: &str,
        filters: &QueryFilters,
        opts: &QueryOptions,
        branch: &str,
    ) -> Result<(Vec<QueryResult>, bool)> {
        let limit = Self::limit(filters);

        let mut wide = filters.clone();
        wide.limit = limit * self.over_fetch;

        let (semantic_result, fts_result) = std::thread::scope(|scope| {
            let semantic = scope.spawn(|| self.semantic(text, &wide, opts, branch));
            let fts = scope.spawn(|| self.fts(text, &wide, opts));
            (
                semantic.join().unwrap_or_else(|_| Err(Error::Internal("semantic task panicked".into()))),
                fts.join().unwrap_or_else(|_| Err(Error::Internal("fts task panicked".into()))),
            )
        });

        let semantic = semantic_result?;
        let (fts, fts_missing) = match fts_result {
            Ok(r) => (r, false),
            Err(Error::IndexMissing(_)) => (Vec::new(), true),
            Err(e) => return Err(e),
        };

        let merged = merge_hybrid(semantic, fts, opts.semantic_weight, opts.fts_weight, limit);
        Ok((merged, fts_missing))
    }
}

/// Merge law: join by `(path, line, column)`; absent scores contribute 0;
/// sort by combined score descending with a stable `(path, line, column)`
/// tie-break; keep single-sided results.
pub fn merge_hybrid(
    semantic: Vec<QueryResult>,
    fts: Vec<QueryResult>,
    semantic_weight: f32,
    fts_weight: f32,
    limit: usize,
) -> Vec<QueryResult> {
    // BTreeMap keys give the deterministic tie-break ordering for free.
    let mut merged: BTreeMap<(String, u64, u64), QueryResult> = BTreeMap::new();

    for r in semantic {
        merged.insert((r.path.clone(), r.line, r.column), r);
    }
    for r in fts {
        match merged.get_mut(&(r.path.clone(), r.line, r.column)) {
            Some(existing) => {
                existing.fts_score = r.fts_score;
                existing.from_fts = true;
                if existing.snippet.is_empty() {
                    existing.snippet = r.snippet;
                }
            }
            None => {
                merged.insert((r.path.clone(), r.line, r.column), r);
            }
        }
    }

    let mut results: Vec<QueryResult> = merged
        .into_values()
        .map(|mut r| {
            let combined = semantic_weight * r.semantic_score.unwrap_or(0.0)
                + fts_weight * r.fts_score.unwrap_or(0.0);
            r.combined_score = Some(combined);
            r.score = combined;
            r
        })
        .collect();

    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(limit);
    results
}

fn first_lines(text: &str, n: usize) -> String {
    text.lines().take(n.max(1)).collect::<Vec<_>>().join("\n")
}

fn hits_len_one(max: f32, min: f32) -> bool {
    (max - min).abs() < f32::EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semantic_result(path: &str, score: f32) -> QueryResult {
        QueryResult {
            path: path.into(),
            line: 1,
            column: 1,
            score,
            semantic_score: Some(score),
            fts_score: None,
            combined_score: None,
            snippet: "sem".into(),
            language: Some("python".into()),
            symbol: Some("f".into()),
            from_semantic: true,
            from_fts: false,
        }
    }

    fn fts_result(path: &str, score: f32) -> QueryResult {
        QueryResult {
            path: path.into(),
            line: 1,
            column: 1,
            score,
            semantic_score: None,
            fts_score: Some(score),
            combined_score: None,
            snippet: "fts".into(),
            language: Some("python".into()),
            symbol: None,
            from_semantic: false,
            from_fts: true,
        }
    }

    #[test]
    fn hybrid_merge_weighted_ordering() {
        // Seed scenario: one-sided results score w * s; a both-sided result
        // sums its halves and wins here.
        let semantic = vec![semantic_result("x.py", 0.9), semantic_result("z.py", 0.6)];
        let fts = vec![fts_result("y.py", 0.95), fts_result("z.py", 0.6)];

        let merged = merge_hybrid(semantic, fts, 0.5, 0.5, 3);
        let order: Vec<(&str, f32)> = merged
            .iter()
            .map(|r| (r.path.as_str(), r.combined_score.unwrap()))
            .collect();

        assert_eq!(order.len(), 3);
        assert_eq!(order[0].0, "z.py");
        assert!((order[0].1 - 0.6).abs() < 1e-6);
        assert_eq!(order[1].0, "y.py");
        assert!((order[1].1 - 0.475).abs() < 1e-6);
        assert_eq!(order[2].0, "x.py");
        assert!((order[2].1 - 0.45).abs() < 1e-6);
    }

    #[test]
    fn hybrid_merge_keeps_provenance() {
        let merged = merge_hybrid(
            vec![semantic_result("a.py", 0.8)],
            vec![fts_result("a.py", 0.9)],
            0.5,
            0.5,
            10,
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].from_semantic);
        assert!(merged[0].from_fts);
        assert_eq!(merged[0].semantic_score, Some(0.8));
        assert_eq!(merged[0].fts_score, Some(0.9));
    }

    #[test]
    fn hybrid_tie_break_is_stable_by_key() {
        let merged = merge_hybrid(
            vec![semantic_result("b.py", 0.5), semantic_result("a.py", 0.5)],
            Vec::new(),
            0.5,
            0.5,
            10,
        );
        assert_eq!(merged[0].path, "a.py");
        assert_eq!(merged[1].path, "b.py");
    }

    #[test]
    fn hybrid_merge_respects_limit() {
        let semantic = (0..10).map(|i| semantic_result(&format!("f{i}.py"), i as f32 / 10.0)).collect();
        let merged = merge_hybrid(semantic, Vec::new(), 0.5, 0.5, 3);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn custom_weights_shift_ordering() {
        let semantic = vec![semantic_result("s.py", 0.9)];
        let fts = vec![fts_result("f.py", 0.9)];
        let merged = merge_hybrid(semantic, fts, 1.0, 0.1, 2);
        assert_eq!(merged[0].path, "s.py");
        let merged = merge_hybrid(
            vec![semantic_result("s.py", 0.9)],
            vec![fts_result("f.py", 0.9)],
            0.1,
            1.0,
            2,
        );
        assert_eq!(merged[0].path, "f.py");
    }
}
