use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

pub struct WalkConfig {
    pub max_threads: usize,
    /// Files larger than this are skipped by the walk entirely.
    pub max_file_bytes: u64,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_threads: 2,
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// Walk a directory respecting .gitignore, returning repo-relative paths
/// with forward slashes, sorted for deterministic scheduling.
pub fn walk_files(root: &Path, config: &WalkConfig) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkBuilder::new(root)
        .threads(config.max_threads)
        .standard_filters(true)
        .build();

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if meta.len() > config.max_file_bytes {
                continue;
            }
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        files.push(to_repo_path(&rel));
    }

    files.sort();
    Ok(files)
}

/// Normalize a path to the repo-relative, forward-slash form used everywhere
/// in payloads and FTS docs.
pub fn to_repo_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp",
    "mp3", "mp4", "wav", "avi", "mov", "mkv", "flac",
    "zip", "tar", "gz", "bz2", "xz", "7z", "rar",
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
    "exe", "dll", "so", "dylib", "o", "a", "lib",
    "wasm", "pyc", "class", "jar",
    "ttf", "otf", "woff", "woff2", "eot",
    "sqlite", "db", "db3",
];

/// Extension-blacklist check; content-level UTF-8 validation happens at read
/// time in the processor.
pub fn is_binary_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Guess language from file extension. Returns None for unknown extensions.
pub fn detect_language(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    match ext.to_lowercase().as_str() {
        "rs" => Some("rust"),
        "py" | "pyw" | "pyi" => Some("python"),
        "js" | "mjs" | "cjs" => Some("javascript"),
        "ts" | "mts" | "cts" => Some("typescript"),
        "tsx" => Some("tsx"),
        "jsx" => Some("jsx"),
        "go" => Some("go"),
        "c" | "h" => Some("c"),
        "cpp" | "cc" | "cxx" | "hpp" | "hxx" => Some("cpp"),
        "java" => Some("java"),
        "rb" => Some("ruby"),
        "php" => Some("php"),
        "swift" => Some("swift"),
        "kt" | "kts" => Some("kotlin"),
        "scala" => Some("scala"),
        "zig" => Some("zig"),
        "lua" => Some("lua"),
        "sh" | "bash" | "zsh" => Some("shell"),
        "sql" => Some("sql"),
        "html" | "htm" => Some("html"),
        "css" => Some("css"),
        "scss" | "sass" => Some("scss"),
        "json" => Some("json"),
        "yaml" | "yml" => Some("yaml"),
        "toml" => Some("toml"),
        "xml" => Some("xml"),
        "md" | "markdown" => Some("markdown"),
        "txt" => Some("text"),
        "proto" => Some("protobuf"),
        "graphql" | "gql" => Some("graphql"),
        "nix" => Some("nix"),
        "tf" | "hcl" => Some("hcl"),
        "ex" | "exs" => Some("elixir"),
        "erl" | "hrl" => Some("erlang"),
        "hs" => Some("haskell"),
        "ml" | "mli" => Some("ocaml"),
        "r" => Some("r"),
        "dart" => Some("dart"),
        "vue" => Some("vue"),
        "svelte" => Some("svelte"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_is_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/b.rs"), "fn b() {}\n").unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        let files = walk_files(dir.path(), &WalkConfig::default()).unwrap();
        assert_eq!(files, vec!["a.rs".to_string(), "src/b.rs".to_string()]);
    }

    #[test]
    fn oversized_files_are_excluded_from_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.rs"), "x".repeat(2048)).unwrap();
        std::fs::write(dir.path().join("small.rs"), "fn s() {}\n").unwrap();
        let config = WalkConfig { max_file_bytes: 1024, ..Default::default() };
        let files = walk_files(dir.path(), &config).unwrap();
        assert_eq!(files, vec!["small.rs".to_string()]);
    }

    #[test]
    fn binary_extension_detection() {
        assert!(is_binary_path("logo.PNG"));
        assert!(is_binary_path("lib/native.so"));
        assert!(!is_binary_path("src/main.rs"));
        assert!(!is_binary_path("Makefile"));
    }

    #[test]
    fn language_detection_is_extension_based() {
        assert_eq!(detect_language("a/b/c.py"), Some("python"));
        assert_eq!(detect_language("x.pyi"), Some("python"));
        assert_eq!(detect_language("mod.rs"), Some("rust"));
        assert_eq!(detect_language("index.tsx"), Some("tsx"));
        assert_eq!(detect_language("noext"), None);
    }
}
