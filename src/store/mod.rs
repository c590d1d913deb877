pub mod local;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::Result;

pub use local::SqliteVectorStore;

pub type PointId = Uuid;

/// Payload stored next to each vector. `hidden_branches` is the branch
/// visibility set: empty means visible everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub file_path: String,
    pub commit_ref: String,
    pub chunk_index: u32,
    pub language: Option<String>,
    #[serde(default)]
    pub hidden_branches: BTreeSet<String>,
    pub git_blob_hash: Option<String>,
    pub mtime_ns: Option<u64>,
    pub size_bytes: Option<u64>,
    pub content_text: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub chunk_kind: String,
    #[serde(default)]
    pub symbol: Option<String>,
}

impl Payload {
    pub fn visible_in(&self, branch: &str) -> bool {
        !self.hidden_branches.contains(branch)
    }
}

#[derive(Debug, Clone)]
pub struct ContentPoint {
    pub id: PointId,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// Partial payload update. Only the listed mutations are supported; the
/// store merges them into the existing payload and never replaces it.
#[derive(Debug, Clone, Default)]
pub struct PayloadPatch {
    pub add_hidden_branch: Option<String>,
    pub remove_hidden_branch: Option<String>,
    pub content_text: Option<String>,
}

impl PayloadPatch {
    pub fn hide_in(branch: &str) -> Self {
        Self { add_hidden_branch: Some(branch.to_string()), ..Default::default() }
    }

    pub fn show_in(branch: &str) -> Self {
        Self { remove_hidden_branch: Some(branch.to_string()), ..Default::default() }
    }

    pub fn apply(&self, payload: &mut Payload) {
        if let Some(b) = &self.add_hidden_branch {
            payload.hidden_branches.insert(b.clone());
        }
        if let Some(b) = &self.remove_hidden_branch {
            payload.hidden_branches.remove(b);
        }
        if let Some(t) = &self.content_text {
            payload.content_text = t.clone();
        }
    }
}

/// Payload filter understood by scroll and k-NN search: equality on path,
/// language, and commit ref; membership tests on `hidden_branches`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointFilter {
    pub file_path: Option<String>,
    pub language: Option<String>,
    pub commit_ref: Option<String>,
    pub hidden_contains: Option<String>,
    pub hidden_not_contains: Option<String>,
}

impl PointFilter {
    pub fn visible_in(branch: &str) -> Self {
        Self { hidden_not_contains: Some(branch.to_string()), ..Default::default() }
    }

    pub fn for_file(file_path: &str) -> Self {
        Self { file_path: Some(file_path.to_string()), ..Default::default() }
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        if let Some(p) = &self.file_path {
            if &payload.file_path != p {
                return false;
            }
        }
        if let Some(l) = &self.language {
            if payload.language.as_deref() != Some(l.as_str()) {
                return false;
            }
        }
        if let Some(c) = &self.commit_ref {
            if &payload.commit_ref != c {
                return false;
            }
        }
        if let Some(b) = &self.hidden_contains {
            if !payload.hidden_branches.contains(b) {
                return false;
            }
        }
        if let Some(b) = &self.hidden_not_contains {
            if payload.hidden_branches.contains(b) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub point: ContentPoint,
    pub score: f32,
}

/// One page of a scroll. `next_cursor` is None once the collection is
/// exhausted; a page may carry fewer matches than the scan limit.
#[derive(Debug)]
pub struct ScrollPage {
    pub points: Vec<ContentPoint>,
    pub next_cursor: Option<u64>,
}

/// Capability contract the core depends on. Any store satisfying it is
/// acceptable; the shipped backend is a local SQLite file.
pub trait VectorStore: Send + Sync {
    /// Idempotent: an id that already exists is left untouched.
    fn upsert_batch(&self, points: &[ContentPoint]) -> Result<()>;

    fn get(&self, id: PointId) -> Result<Option<ContentPoint>>;

    fn delete(&self, ids: &[PointId]) -> Result<()>;

    /// Merges into the existing payload; unknown ids are a no-op.
    fn patch_payload(&self, id: PointId, patch: &PayloadPatch) -> Result<()>;

    /// Restartable pagination. Pass the previous page's cursor to continue.
    fn scroll(&self, filter: &PointFilter, cursor: Option<u64>, limit: usize) -> Result<ScrollPage>;

    /// Up to `k` candidates passing the filter, by descending similarity.
    fn search_knn(&self, vector: &[f32], k: usize, filter: &PointFilter) -> Result<Vec<ScoredPoint>>;

    fn count(&self) -> Result<u64>;

    fn create_collection(&self) -> Result<()>;

    /// Drops all points. Idempotent.
    fn drop_collection(&self) -> Result<()>;
}

/// Existence probe used by the indexer to skip re-embedding content that is
/// already present. Errors other than not-found propagate.
pub fn exists(store: &dyn VectorStore, id: PointId) -> Result<bool> {
    Ok(store.get(id)?.is_some())
}

/// Drain an entire scroll, applying `f` to each matching point. Cancellation
/// between pages is the caller's concern; this helper just loops.
pub fn scroll_all<F>(store: &dyn VectorStore, filter: &PointFilter, page_size: usize, mut f: F) -> Result<()>
where
    F: FnMut(&ContentPoint) -> Result<()>,
{
    let mut cursor = None;
    loop {
        let page = store.scroll(filter, cursor, page_size)?;
        for point in &page.points {
            f(point)?;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(path: &str, commit: &str) -> Payload {
        Payload {
            file_path: path.into(),
            commit_ref: commit.into(),
            chunk_index: 0,
            language: Some("python".into()),
            hidden_branches: BTreeSet::new(),
            git_blob_hash: None,
            mtime_ns: None,
            size_bytes: None,
            content_text: "def f(): pass".into(),
            start_line: 1,
            end_line: 1,
            chunk_kind: "function".into(),
            symbol: Some("f".into()),
        }
    }

    #[test]
    fn patch_mutations_compose() {
        let mut p = payload("a.py", "c1");
        PayloadPatch::hide_in("main").apply(&mut p);
        assert!(!p.visible_in("main"));
        assert!(p.visible_in("feature"));
        PayloadPatch::show_in("main").apply(&mut p);
        assert!(p.visible_in("main"));
    }

    #[test]
    fn filter_membership_semantics() {
        let mut p = payload("a.py", "c1");
        assert!(PointFilter::visible_in("main").matches(&p));
        p.hidden_branches.insert("main".into());
        assert!(!PointFilter::visible_in("main").matches(&p));
        assert!(
            PointFilter { hidden_contains: Some("main".into()), ..Default::default() }.matches(&p)
        );
        assert!(!PointFilter { file_path: Some("b.py".into()), ..Default::default() }.matches(&p));
        assert!(
            PointFilter { commit_ref: Some("c1".into()), ..Default::default() }.matches(&p)
        );
    }
}
