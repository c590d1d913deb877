use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use super::{QueryMode, QueryOptions, QueryResult};
use crate::query::filters::QueryFilters;

/// In-memory result cache keyed by the full query fingerprint. Flushed on
/// every write that changes the index; entries also expire after the TTL.
pub struct ResultCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, Slot>>,
}

struct Slot {
    stored_at: Instant,
    results: Vec<QueryResult>,
    paths: HashSet<String>,
}

/// Fingerprint over everything that affects the candidate set.
pub fn fingerprint(
    mode: QueryMode,
    text: &str,
    filters: &QueryFilters,
    options: &QueryOptions,
    branch: &str,
) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    mode.hash(&mut hasher);
    text.hash(&mut hasher);
    branch.hash(&mut hasher);
    // Filters and options carry f32 fields; hash their canonical JSON form
    // instead of requiring Hash on the structs.
    serde_json::to_string(filters).unwrap_or_default().hash(&mut hasher);
    serde_json::to_string(options).unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: u64) -> Option<Vec<QueryResult>> {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(slot) if slot.stored_at.elapsed() <= self.ttl => Some(slot.results.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: u64, results: Vec<QueryResult>) {
        let paths = results.iter().map(|r| r.path.clone()).collect();
        self.entries
            .lock()
            .insert(key, Slot { stored_at: Instant::now(), results, paths });
    }

    pub fn flush(&self) {
        self.entries.lock().clear();
    }

    /// Drop only the entries whose results reference `path`; used by
    /// watch-mode incremental updates.
    pub fn flush_path(&self, path: &str) {
        self.entries.lock().retain(|_, slot| !slot.paths.contains(path));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(path: &str) -> QueryResult {
        QueryResult {
            path: path.into(),
            line: 1,
            column: 1,
            score: 0.5,
            semantic_score: Some(0.5),
            fts_score: None,
            combined_score: None,
            snippet: String::new(),
            language: None,
            symbol: None,
            from_semantic: true,
            from_fts: false,
        }
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = ResultCache::new(Duration::from_millis(50));
        let opts = QueryOptions::default();
        let key = fingerprint(QueryMode::Semantic, "auth", &QueryFilters::default(), &opts, "main");
        cache.put(key, vec![result("a.py")]);
        assert!(cache.get(key).is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn fingerprint_varies_with_inputs() {
        let f = QueryFilters::default();
        let o = QueryOptions::default();
        let base = fingerprint(QueryMode::Semantic, "auth", &f, &o, "main");
        assert_ne!(base, fingerprint(QueryMode::Fts, "auth", &f, &o, "main"));
        assert_ne!(base, fingerprint(QueryMode::Semantic, "auth2", &f, &o, "main"));
        assert_ne!(base, fingerprint(QueryMode::Semantic, "auth", &f, &o, "feature"));
        let mut f2 = QueryFilters::default();
        f2.languages.push("python".into());
        assert_ne!(base, fingerprint(QueryMode::Semantic, "auth", &f2, &o, "main"));
        let mut o2 = QueryOptions::default();
        o2.edit_distance = 2;
        assert_ne!(base, fingerprint(QueryMode::Semantic, "auth", &f, &o2, "main"));
    }

    #[test]
    fn flush_path_only_evicts_referencing_entries() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.put(1, vec![result("a.py")]);
        cache.put(2, vec![result("b.py")]);
        cache.flush_path("a.py");
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn flush_clears_everything() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.put(1, vec![result("a.py")]);
        cache.flush();
        assert!(cache.is_empty());
    }
}
