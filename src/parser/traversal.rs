//! File discovery under a source root.
//!
//! `.gitignore` files are honored through the `ignore` crate walker; the
//! workspace patterns are compiled into a [`GlobSet`] matched against paths
//! relative to the root.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::config::GitignoreBehavior;
use crate::error::{ParserError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalResult {
    pub absolute_path: PathBuf,
    /// Relative to the traversal root.
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TraversalService {
    root: PathBuf,
    behavior: GitignoreBehavior,
    workspace: Option<GlobSet>,
    follow_symlinks: bool,
}

impl TraversalService {
    pub fn new(
        root: &Path,
        behavior: GitignoreBehavior,
        workspace_patterns: &[String],
        follow_symlinks: bool,
    ) -> Result<Self> {
        if !root.is_dir() {
            return Err(ParserError::Traversal(format!(
                "traversal root must be an existing directory: {}",
                root.display()
            )));
        }
        let root = root.canonicalize().map_err(|e| ParserError::io(root, e))?;
        let workspace = match behavior {
            GitignoreBehavior::Workspace | GitignoreBehavior::Combined if !workspace_patterns.is_empty() => {
                Some(build_globset(workspace_patterns)?)
            }
            _ => None,
        };
        Ok(Self {
            root,
            behavior,
            workspace,
            follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_rules(&self) -> bool {
        matches!(self.behavior, GitignoreBehavior::Repo | GitignoreBehavior::Combined)
    }

    /// Files under the root, or under `scope` when it is not empty, sorted by
    /// relative path. Scope entries outside the root are skipped.
    pub fn iter_files(&self, scope: &[PathBuf]) -> Result<Vec<TraversalResult>> {
        let scope = self.normalize_scope(scope);
        let mut found = BTreeMap::new();

        let workspace = self.workspace.clone();
        let root = self.root.clone();
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .parents(false)
            .ignore(false)
            .git_global(false)
            .git_exclude(false)
            .git_ignore(self.repo_rules())
            .require_git(false)
            .follow_links(self.follow_symlinks)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if entry.file_name() == ".git" {
                    return false;
                }
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !matches_workspace(workspace.as_ref(), &root, entry.path(), is_dir)
            })
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("traversal skipped an entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !scope.is_empty() && !scope.iter().any(|s| path.starts_with(s)) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            found.insert(
                relative.to_path_buf(),
                TraversalResult {
                    absolute_path: path.to_path_buf(),
                    relative_path: relative.to_path_buf(),
                },
            );
        }

        debug!("traversal of {} found {} files", self.root.display(), found.len());
        Ok(found.into_values().collect())
    }

    fn normalize_scope(&self, scope: &[PathBuf]) -> Vec<PathBuf> {
        let mut normalized = Vec::new();
        for path in scope {
            let candidate = if path.is_absolute() {
                path.clone()
            } else {
                self.root.join(path)
            };
            let Ok(resolved) = candidate.canonicalize() else {
                debug!("scope path does not exist: {}", path.display());
                continue;
            };
            if !resolved.starts_with(&self.root) {
                warn!("scope path outside source root ignored: {}", path.display());
                continue;
            }
            if !normalized.contains(&resolved) {
                normalized.push(resolved);
            }
        }
        normalized
    }
}

/// Patterns without a slash match at any depth, like `.gitignore` entries.
fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let trimmed = pattern.trim().trim_end_matches('/');
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let anchored = trimmed.trim_start_matches('/');
        let mut variants = vec![anchored.to_string()];
        if !trimmed.contains('/') {
            variants.push(format!("**/{anchored}"));
        }
        for variant in variants {
            let glob = Glob::new(&variant)
                .map_err(|e| ParserError::Config(format!("invalid workspace pattern {pattern:?}: {e}")))?;
            builder.add(glob);
        }
    }
    builder
        .build()
        .map_err(|e| ParserError::Config(format!("invalid workspace patterns: {e}")))
}

fn matches_workspace(workspace: Option<&GlobSet>, root: &Path, path: &Path, is_dir: bool) -> bool {
    let Some(set) = workspace else {
        return false;
    };
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let candidate = relative.to_string_lossy().replace('\\', "/");
    set.is_match(&candidate) || (is_dir && set.is_match(format!("{candidate}/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(root: &Path, relative: &str, body: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn relative(results: &[TraversalResult]) -> Vec<String> {
        results
            .iter()
            .map(|r| r.relative_path.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    fn layout() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        write(dir.path(), ".gitignore", "build/\n*.log\n");
        write(dir.path(), "src/main.py", "print()\n");
        write(dir.path(), "src/nested/.gitignore", "secret.txt\n");
        write(dir.path(), "src/nested/secret.txt", "x\n");
        write(dir.path(), "src/nested/keep.md", "# hi\n");
        write(dir.path(), "build/out.js", "x\n");
        write(dir.path(), "debug.log", "x\n");
        write(dir.path(), "manifest.json", "{}\n");
        dir
    }

    fn patterns() -> Vec<String> {
        vec!["manifest.json".to_string()]
    }

    #[test]
    fn test_combined_honors_both_rule_sets() {
        let dir = layout();
        let service = TraversalService::new(dir.path(), GitignoreBehavior::Combined, &patterns(), false).unwrap();
        let files = relative(&service.iter_files(&[]).unwrap());
        assert_eq!(
            files,
            vec![".gitignore", "src/main.py", "src/nested/.gitignore", "src/nested/keep.md"]
        );
    }

    #[test]
    fn test_workspace_ignores_gitignore_files() {
        let dir = layout();
        let service = TraversalService::new(dir.path(), GitignoreBehavior::Workspace, &patterns(), false).unwrap();
        let files = relative(&service.iter_files(&[]).unwrap());
        assert!(files.contains(&"build/out.js".to_string()));
        assert!(files.contains(&"src/nested/secret.txt".to_string()));
        assert!(!files.contains(&"manifest.json".to_string()));
    }

    #[test]
    fn test_repo_ignores_workspace_patterns() {
        let dir = layout();
        let service = TraversalService::new(dir.path(), GitignoreBehavior::Repo, &patterns(), false).unwrap();
        let files = relative(&service.iter_files(&[]).unwrap());
        assert!(files.contains(&"manifest.json".to_string()));
        assert!(!files.contains(&"debug.log".to_string()));
    }

    #[test]
    fn test_scope_limits_and_skips_outside_paths() {
        let dir = layout();
        let outside = tempdir().unwrap();
        write(outside.path(), "other.py", "x\n");

        let service = TraversalService::new(dir.path(), GitignoreBehavior::Combined, &patterns(), false).unwrap();
        let scope = vec![
            PathBuf::from("src/nested"),
            outside.path().join("other.py"),
            PathBuf::from("missing"),
        ];
        let files = relative(&service.iter_files(&scope).unwrap());
        assert_eq!(files, vec!["src/nested/.gitignore", "src/nested/keep.md"]);
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempdir().unwrap();
        let err = TraversalService::new(&dir.path().join("nope"), GitignoreBehavior::Repo, &[], false).unwrap_err();
        assert!(matches!(err, ParserError::Traversal(_)));
    }
}
