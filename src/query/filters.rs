use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};

/// Raw filter inputs, shared by semantic, FTS, and hybrid modes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    pub languages: Vec<String>,
    pub exclude_languages: Vec<String>,
    pub path_filters: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub min_score: Option<f32>,
    pub limit: usize,
}

/// Fixed language-name to extension-set table. Unknown names map to empty
/// sets, so an include list of only unknown names matches nothing.
pub fn language_extensions(name: &str) -> &'static [&'static str] {
    match name.to_lowercase().as_str() {
        "python" => &["py", "pyw", "pyi"],
        "javascript" => &["js", "jsx", "mjs", "cjs"],
        "typescript" => &["ts", "tsx", "mts", "cts"],
        "go" => &["go"],
        "rust" => &["rs"],
        "c" => &["c", "h"],
        "cpp" => &["cpp", "cc", "cxx", "hpp", "hxx"],
        "java" => &["java"],
        "ruby" => &["rb"],
        "php" => &["php"],
        "kotlin" => &["kt", "kts"],
        "swift" => &["swift"],
        "scala" => &["scala"],
        "shell" => &["sh", "bash", "zsh"],
        "html" => &["html", "htm"],
        "css" => &["css", "scss", "sass"],
        "markdown" => &["md", "markdown"],
        _ => &[],
    }
}

/// Compiled form of the filter set. Evaluation order is fixed and
/// short-circuits: language excludes, language includes, path excludes,
/// path includes.
pub struct CompiledFilters {
    include_exts: Option<HashSet<&'static str>>,
    exclude_exts: HashSet<&'static str>,
    include_paths: Option<GlobSet>,
    exclude_paths: Option<GlobSet>,
}

impl CompiledFilters {
    pub fn compile(filters: &QueryFilters) -> Result<Self> {
        let include_exts = if filters.languages.is_empty() {
            None
        } else {
            Some(
                filters
                    .languages
                    .iter()
                    .flat_map(|l| language_extensions(l).iter().copied())
                    .collect(),
            )
        };
        let exclude_exts = filters
            .exclude_languages
            .iter()
            .flat_map(|l| language_extensions(l).iter().copied())
            .collect();

        let include_paths = build_glob_set(&filters.path_filters)?;
        let exclude_paths = build_glob_set(&filters.exclude_paths)?;

        Ok(Self { include_exts, exclude_exts, include_paths, exclude_paths })
    }

    pub fn accept(&self, path: &str) -> bool {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        if self.exclude_exts.contains(ext.as_str()) {
            return false;
        }
        if let Some(include) = &self.include_exts {
            if !include.contains(ext.as_str()) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude_paths {
            if exclude.is_match(path) {
                return false;
            }
        }
        if let Some(include) = &self.include_paths {
            if !include.is_match(path) {
                return false;
            }
        }
        true
    }
}

/// Patterns within one side combine with OR. `*` is permissive across
/// separators (the dialect users expect from search CLIs); case sensitivity
/// follows the host's file-name policy.
fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .case_insensitive(host_case_insensitive())
            .build()
            .map_err(|e| Error::InvalidArgument(format!("bad path pattern {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| Error::InvalidArgument(format!("compiling path patterns: {e}")))?;
    Ok(Some(set))
}

fn host_case_insensitive() -> bool {
    cfg!(any(windows, target_os = "macos"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(
        languages: &[&str],
        exclude_languages: &[&str],
        path_filters: &[&str],
        exclude_paths: &[&str],
    ) -> CompiledFilters {
        let filters = QueryFilters {
            languages: languages.iter().map(|s| s.to_string()).collect(),
            exclude_languages: exclude_languages.iter().map(|s| s.to_string()).collect(),
            path_filters: path_filters.iter().map(|s| s.to_string()).collect(),
            exclude_paths: exclude_paths.iter().map(|s| s.to_string()).collect(),
            min_score: None,
            limit: 10,
        };
        CompiledFilters::compile(&filters).unwrap()
    }

    #[test]
    fn no_filters_accept_everything() {
        let f = compile(&[], &[], &[], &[]);
        assert!(f.accept("src/main.rs"));
        assert!(f.accept("README"));
    }

    #[test]
    fn exclusions_beat_inclusions() {
        // Included twice, excluded once: exclusion wins.
        let f = compile(&["python", "javascript"], &["javascript"], &[], &[]);
        assert!(f.accept("app.py"));
        assert!(f.accept("types.pyi"));
        assert!(!f.accept("app.js"));
        assert!(!f.accept("component.jsx"));
        assert!(!f.accept("main.rs"));
    }

    #[test]
    fn unknown_language_include_matches_nothing() {
        let f = compile(&["cobol9000"], &[], &[], &[]);
        assert!(!f.accept("main.py"));
        assert!(!f.accept("main.rs"));
    }

    #[test]
    fn unknown_language_exclude_is_inert() {
        let f = compile(&[], &["cobol9000"], &[], &[]);
        assert!(f.accept("main.py"));
    }

    #[test]
    fn path_exclude_beats_path_include() {
        let f = compile(&[], &[], &["*/src/*"], &["*/src/legacy/*"]);
        assert!(f.accept("app/src/new.py"));
        assert!(!f.accept("app/src/legacy/old.py"));
    }

    #[test]
    fn path_patterns_or_within_a_side() {
        let f = compile(&[], &[], &["src/*", "lib/*"], &[]);
        assert!(f.accept("src/a.py"));
        assert!(f.accept("lib/b.py"));
        assert!(!f.accept("docs/c.py"));
    }

    #[test]
    fn glob_dialect_star_question_and_class() {
        let f = compile(&[], &[], &["src/**/*.r?", "tests/[ab].py"], &[]);
        assert!(f.accept("src/deep/nested/mod.rs"));
        assert!(f.accept("tests/a.py"));
        assert!(!f.accept("tests/c.py"));
    }

    #[test]
    fn language_then_path_order_is_observable() {
        // A path-included file still falls to language exclusion.
        let f = compile(&[], &["python"], &["src/*"], &[]);
        assert!(!f.accept("src/app.py"));
        assert!(f.accept("src/app.rs"));
    }
}
