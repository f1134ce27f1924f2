//! Git and GitHub client interfaces (spec §6) — consumed by the Worktree
//! Manager (§4.6) and Finalizer (§4.7). Only the operations those two
//! components actually call are exposed; concrete implementations (`git2`,
//! `octocrab`) live in the `quorum-cli` crate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git operation failed: {0}")]
    Failed(String),

    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("merge conflict on branch {0}")]
    MergeConflict(String),
}

pub type GitResult<T> = Result<T, GitError>;

/// Status of a worktree's working tree, used by output validation (spec
/// §4.5.1) and the Finalizer (§4.7).
#[derive(Debug, Clone, Default)]
pub struct GitChangesInfo {
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

impl GitChangesInfo {
    /// `modified = staged ∪ unstaged`, `added = untracked`, `deleted = ∅`
    /// (spec §4.5.1 — this design's `git status` read never surfaces
    /// deletions as a separate bucket).
    pub fn modified(&self) -> Vec<String> {
        let mut set: std::collections::BTreeSet<String> = self.staged.iter().cloned().collect();
        set.extend(self.unstaged.iter().cloned());
        set.into_iter().collect()
    }

    pub fn added(&self) -> &[String] {
        &self.untracked
    }

    pub fn has_changes(&self) -> bool {
        !self.modified().is_empty() || !self.added().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Sequential,
    Squash,
    Rebase,
}

/// Git plumbing consumed by the Worktree Manager and Finalizer.
#[async_trait]
pub trait GitClient: Send + Sync {
    fn repo_root(&self) -> PathBuf;
    async fn current_branch(&self, path: &Path) -> GitResult<String>;
    async fn status(&self, path: &Path) -> GitResult<GitChangesInfo>;

    async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> GitResult<()>;
    async fn worktree_remove(&self, path: &Path) -> GitResult<()>;
    async fn worktree_list(&self) -> GitResult<Vec<PathBuf>>;

    async fn create_branch(&self, name: &str, base: &str) -> GitResult<()>;
    async fn merge_branch(&self, path: &Path, from: &str, strategy: MergeStrategy) -> GitResult<()>;
    /// Force-delete a local branch (spec §4.6: `removeBranch=true` actually
    /// removes it, as opposed to retaining it for a pending merge).
    async fn delete_branch(&self, name: &str) -> GitResult<()>;

    async fn stage_all(&self, path: &Path) -> GitResult<()>;
    /// Commit staged changes; returns the new commit SHA.
    async fn commit(&self, path: &Path, message: &str) -> GitResult<String>;
    async fn push(&self, path: &Path, remote: &str, branch: &str) -> GitResult<()>;
}

#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrMergeStrategy {
    Merge,
    Squash,
    Rebase,
}

/// GitHub plumbing consumed by the Finalizer (spec §4.7 steps 6-7).
#[async_trait]
pub trait GitHubClient: Send + Sync {
    /// Returns the created PR number.
    async fn create_pr(&self, spec: PullRequestSpec) -> GitResult<u64>;
    async fn merge_pr(&self, number: u64, strategy: PrMergeStrategy) -> GitResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_dedupes_staged_and_unstaged() {
        let info = GitChangesInfo {
            staged: vec!["a.rs".into(), "b.rs".into()],
            unstaged: vec!["b.rs".into(), "c.rs".into()],
            untracked: vec!["d.rs".into()],
        };
        assert_eq!(info.modified(), vec!["a.rs".to_string(), "b.rs".to_string(), "c.rs".to_string()]);
        assert_eq!(info.added(), &["d.rs".to_string()]);
        assert!(info.has_changes());
    }

    #[test]
    fn empty_info_has_no_changes() {
        assert!(!GitChangesInfo::default().has_changes());
    }
}
