use uuid::Uuid;

/// Namespace for content ids. Frozen per deployment: changing it invalidates
/// every existing index.
pub const CONTENT_NAMESPACE: Uuid = Uuid::from_u128(0x8b1d_64f0_3c5a_4e89_9f27_a6d1_c402_7b53);

pub const WORKING_PREFIX: &str = "working_dir_";

/// The natural key of an indexable chunk: a repo-relative path, a commit ref
/// (40-hex hash or synthetic working-dir token), and the chunk's index
/// within the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef {
    pub file_path: String,
    pub commit_ref: String,
    pub chunk_index: u32,
}

impl ContentRef {
    pub fn new(file_path: impl Into<String>, commit_ref: impl Into<String>, chunk_index: u32) -> Self {
        Self {
            file_path: file_path.into(),
            commit_ref: commit_ref.into(),
            chunk_index,
        }
    }

    /// Canonical encoding hashed into the content id. NUL separators keep
    /// the three components unambiguous for any path or ref value.
    pub fn canonical(&self) -> String {
        format!("{}\0{}\0{}", self.file_path, self.commit_ref, self.chunk_index)
    }

    /// Deterministic UUID v5 of the canonical encoding. Identical refs yield
    /// identical ids on any host.
    pub fn content_id(&self) -> Uuid {
        Uuid::new_v5(&CONTENT_NAMESPACE, self.canonical().as_bytes())
    }
}

/// Synthetic commit ref for uncommitted working-tree bytes.
pub fn working_dir_ref(mtime_ns: u128, size_bytes: u64) -> String {
    format!("{WORKING_PREFIX}{mtime_ns}_{size_bytes}")
}

pub fn is_working_ref(commit_ref: &str) -> bool {
    commit_ref.starts_with(WORKING_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_deterministic() {
        let a = ContentRef::new("src/lib.rs", "a".repeat(40), 0);
        let b = ContentRef::new("src/lib.rs", "a".repeat(40), 0);
        assert_eq!(a.content_id(), b.content_id());
    }

    #[test]
    fn distinct_refs_get_distinct_ids() {
        let base = ContentRef::new("src/lib.rs", "a".repeat(40), 0);
        let other_chunk = ContentRef::new("src/lib.rs", "a".repeat(40), 1);
        let other_path = ContentRef::new("src/main.rs", "a".repeat(40), 0);
        let other_ref = ContentRef::new("src/lib.rs", working_dir_ref(12, 34), 0);
        assert_ne!(base.content_id(), other_chunk.content_id());
        assert_ne!(base.content_id(), other_path.content_id());
        assert_ne!(base.content_id(), other_ref.content_id());
    }

    #[test]
    fn canonical_encoding_is_unambiguous() {
        // Components containing digits must not collide via concatenation.
        let a = ContentRef::new("a", "b1", 0);
        let b = ContentRef::new("a", "b", 10);
        assert_ne!(a.content_id(), b.content_id());
    }

    #[test]
    fn working_ref_form() {
        let r = working_dir_ref(1_700_000_000_000_000_000, 512);
        assert!(is_working_ref(&r));
        assert_eq!(r, "working_dir_1700000000000000000_512");
        assert!(!is_working_ref(&"c".repeat(40)));
    }
}
