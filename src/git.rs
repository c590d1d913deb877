use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::UNIX_EPOCH;

use crate::content::working_dir_ref;
use crate::error::{Error, Result};

/// Synthetic branch name used when the directory is not a git repository.
pub const NO_GIT_BRANCH: &str = "__no_git__";

/// Adapter over the surrounding git repository. All operations shell out to
/// the `git` binary; a non-git directory degrades to a single synthetic
/// branch with working-dir refs everywhere.
pub struct GitAdapter {
    root: PathBuf,
    is_repo: bool,
}

impl GitAdapter {
    pub fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::Internal(format!("resolving {}: {e}", root.display())))?;
        let is_repo = match Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&root)
            .output()
        {
            Ok(out) => out.status.success(),
            Err(_) => false,
        };
        Ok(Self { root, is_repo })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_repo(&self) -> bool {
        self.is_repo
    }

    /// Current branch name, or `__no_git__` outside a repository. Works on
    /// unborn branches (fresh repo, no commits); a detached HEAD reports the
    /// literal `HEAD`, which is a usable branch key.
    pub fn current_branch(&self) -> Result<String> {
        if !self.is_repo {
            return Ok(NO_GIT_BRANCH.into());
        }
        let out = match self.git(&["symbolic-ref", "--short", "HEAD"]) {
            Ok(o) => o,
            // Detached HEAD has no symbolic ref.
            Err(_) => self.git(&["rev-parse", "--abbrev-ref", "HEAD"])?,
        };
        let name = out.trim().to_string();
        if name.is_empty() {
            return Err(Error::Internal("git reported no branch".into()));
        }
        Ok(name)
    }

    /// All local branch names. Outside a repository this is the synthetic
    /// branch alone; these are the ground truth for garbage collection.
    pub fn list_branches(&self) -> Result<Vec<String>> {
        if !self.is_repo {
            return Ok(vec![NO_GIT_BRANCH.into()]);
        }
        let out = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        let mut branches: Vec<String> = out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if branches.is_empty() {
            // Repo with no commits yet: treat the current symbolic ref as a branch.
            branches.push(self.current_branch()?);
        }
        Ok(branches)
    }

    /// Resolve a repo-relative path to either the last commit that touched it
    /// (clean, tracked, committed content) or a synthetic working-dir token.
    pub fn file_commit(&self, rel_path: &str) -> Result<String> {
        let abs = self.root.join(rel_path);
        if !self.is_repo {
            return self.working_ref(&abs);
        }

        // Symlinks and submodules always index as working-dir content.
        if let Ok(meta) = std::fs::symlink_metadata(&abs) {
            if meta.file_type().is_symlink() || meta.file_type().is_dir() {
                return self.working_ref(&abs);
            }
        }

        // Untracked files have no committed version.
        let tracked = Command::new("git")
            .args(["ls-files", "--error-unmatch", "--", rel_path])
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::Internal(format!("running git: {e}")))?;
        if !tracked.status.success() {
            return self.working_ref(&abs);
        }

        // Worktree or index differs from HEAD: synthetic token. Exit code 1
        // from --quiet means "differs"; anything above is a real failure.
        let diff = Command::new("git")
            .args(["diff", "--quiet", "HEAD", "--", rel_path])
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::Internal(format!("running git: {e}")))?;
        match diff.status.code() {
            Some(0) => {}
            Some(1) => return self.working_ref(&abs),
            _ => {
                let err = String::from_utf8_lossy(&diff.stderr);
                return Err(Error::Internal(format!("git diff --quiet {rel_path}: {err}")));
            }
        }

        let out = self.git(&["rev-list", "-1", "HEAD", "--", rel_path])?;
        let hash = out.trim().to_string();
        if hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(hash)
        } else {
            // Tracked but never committed (staged new file with no history).
            self.working_ref(&abs)
        }
    }

    /// Files reachable on a branch, repo-relative with forward slashes.
    pub fn list_files(&self, branch: &str) -> Result<Vec<String>> {
        if !self.is_repo {
            return Ok(Vec::new());
        }
        let out = self.git(&["ls-tree", "-r", "--name-only", "-z", branch])?;
        Ok(split_nul(&out))
    }

    /// Tracked files in the working tree (index view).
    pub fn list_tracked_files(&self) -> Result<Vec<String>> {
        if !self.is_repo {
            return Ok(Vec::new());
        }
        let out = self.git(&["ls-files", "-z"])?;
        Ok(split_nul(&out))
    }

    /// Map of path -> blob hash at HEAD, for payload bookkeeping.
    pub fn resolve_head_blobs(&self) -> Result<HashMap<String, String>> {
        if !self.is_repo {
            return Ok(HashMap::new());
        }
        let out = self.git(&["ls-tree", "-r", "-z", "HEAD"])?;
        let mut blobs = HashMap::new();
        for entry in out.split('\0').filter(|e| !e.is_empty()) {
            // Format: "<mode> <type> <hash>\t<path>"
            let Some((meta, path)) = entry.split_once('\t') else { continue };
            let mut parts = meta.split_whitespace();
            let (Some(_mode), Some(kind), Some(hash)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if kind == "blob" {
                blobs.insert(path.to_string(), hash.to_string());
            }
        }
        Ok(blobs)
    }

    /// Blob hash for one path at HEAD, if committed.
    pub fn head_blob(&self, rel_path: &str) -> Option<String> {
        if !self.is_repo {
            return None;
        }
        let out = self.git(&["rev-parse", &format!("HEAD:{rel_path}")]).ok()?;
        let hash = out.trim().to_string();
        (hash.len() == 40).then_some(hash)
    }

    fn working_ref(&self, abs: &Path) -> Result<String> {
        let meta = std::fs::metadata(abs)
            .map_err(|e| Error::Internal(format!("stat {}: {e}", abs.display())))?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(working_dir_ref(mtime_ns, meta.len()))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::Internal(format!("running git: {e}")))?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(&out.stderr);
            return Err(Error::Internal(format!("git {}: {}", args.join(" "), err.trim())));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn split_nul(raw: &str) -> Vec<String> {
    raw.split('\0')
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
