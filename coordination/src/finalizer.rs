//! Finalizer (spec §4.7) — commits a completed task's worktree, optionally
//! pushes, opens a PR, and merges it. Any error here fails the task; unlike
//! the Executor's agent fallback chain, there's no fallback for a broken
//! git/GitHub collaborator — the worktree is left intact for manual repair.

use std::path::Path;
use std::sync::Arc;

use crate::config::FinalizeConfig;
use crate::git::{GitClient, GitError, GitHubClient, PrMergeStrategy, PullRequestSpec};
use crate::state::TaskState;

#[derive(Debug, thiserror::Error)]
pub enum FinalizerError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("auto_push/auto_pr requested but no branch could be resolved for task {0:?}")]
    NoBranch(String),
}

pub type FinalizerResult<T> = Result<T, FinalizerError>;

pub struct Finalizer {
    git: Arc<dyn GitClient>,
    github: Option<Arc<dyn GitHubClient>>,
    config: FinalizeConfig,
}

impl Finalizer {
    pub fn new(git: Arc<dyn GitClient>, github: Option<Arc<dyn GitHubClient>>, config: FinalizeConfig) -> Self {
        Self { git, github, config }
    }

    /// Commit, push, open a PR and merge it, per `config` (spec §4.7). `task`
    /// is updated in place with `last_commit`/`branch`/`files_modified`/
    /// `resumable` regardless of which steps actually ran.
    pub async fn finalize(&self, task: &mut TaskState, work_dir: &Path) -> FinalizerResult<()> {
        let git_path = if task.worktree_path.is_some() {
            work_dir.to_path_buf()
        } else {
            self.git.repo_root()
        };

        let branch = self.resolve_branch(task, &git_path).await?;
        task.branch = branch.clone();

        let changes = self.git.status(&git_path).await?;
        task.files_modified = changes.modified().into_iter().chain(changes.added().iter().cloned()).collect();

        let mut committed = false;
        if self.config.auto_commit && changes.has_changes() {
            self.git.stage_all(&git_path).await?;
            let message = commit_message(task);
            let sha = self.git.commit(&git_path, &message).await?;
            task.last_commit = Some(sha);
            committed = true;
        }

        if self.config.auto_push && committed {
            let branch = branch.clone().ok_or_else(|| FinalizerError::NoBranch(task.id.clone()))?;
            self.git.push(&git_path, &self.config.remote, &branch).await?;
        }

        let mut pr_number: Option<u64> = None;
        if self.config.auto_pr {
            let head_branch = branch.clone().ok_or_else(|| FinalizerError::NoBranch(task.id.clone()))?;
            let base_branch = self.config.pr_base_branch.clone().unwrap_or_else(|| "main".to_string());
            if let Some(github) = &self.github {
                let spec = PullRequestSpec {
                    title: format!("feat(quorum): {}", task.name),
                    body: pr_body(task),
                    head_branch,
                    base_branch,
                };
                let number = github.create_pr(spec).await?;
                pr_number = Some(number);
            }
        }

        if self.config.auto_merge {
            if let (Some(number), Some(github)) = (pr_number, &self.github) {
                let strategy = match self.config.merge_strategy {
                    crate::config::MergeStrategyConfig::Sequential => PrMergeStrategy::Merge,
                    crate::config::MergeStrategyConfig::Squash => PrMergeStrategy::Squash,
                    crate::config::MergeStrategyConfig::Rebase => PrMergeStrategy::Rebase,
                };
                github.merge_pr(number, strategy).await?;
            }
        }

        task.resumable = task.last_commit.is_some();
        Ok(())
    }

    /// Branch resolution priority (spec §4.7 step 2): `TaskState.branch` >
    /// worktree's current branch > root repo's current branch.
    async fn resolve_branch(&self, task: &TaskState, git_path: &Path) -> FinalizerResult<Option<String>> {
        if let Some(branch) = &task.branch {
            return Ok(Some(branch.clone()));
        }
        if let Ok(branch) = self.git.current_branch(git_path).await {
            if !branch.is_empty() {
                return Ok(Some(branch));
            }
        }
        if let Ok(branch) = self.git.current_branch(&self.git.repo_root()).await {
            if !branch.is_empty() {
                return Ok(Some(branch));
            }
        }
        if self.config.auto_push || self.config.auto_pr {
            return Err(FinalizerError::NoBranch(task.id.clone()));
        }
        Ok(None)
    }
}

/// Spec §4.7 step 4's exact commit message template. `TaskState` carries no
/// description field (only `Name`), so the description paragraph is omitted
/// rather than left blank.
fn commit_message(task: &TaskState) -> String {
    format!(
        "feat(quorum): {}\n\nTask-ID: {}\nGenerated-By: quorum-ai",
        task.name, task.id
    )
}

fn pr_body(task: &TaskState) -> String {
    format!(
        "## Summary\n\n{}\n\nTask ID: {}\n\n---\nGenerated by quorum-ai",
        task.name, task.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitChangesInfo, MergeStrategy};
    use crate::state::TaskStatus;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct FakeGit {
        branch: String,
        changes: GitChangesInfo,
        commits: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GitClient for FakeGit {
        fn repo_root(&self) -> PathBuf {
            PathBuf::from("/repo")
        }
        async fn current_branch(&self, _path: &Path) -> Result<String, GitError> {
            Ok(self.branch.clone())
        }
        async fn status(&self, _path: &Path) -> Result<GitChangesInfo, GitError> {
            Ok(self.changes.clone())
        }
        async fn worktree_add(&self, _path: &Path, _branch: &str, _base: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn worktree_remove(&self, _path: &Path) -> Result<(), GitError> {
            Ok(())
        }
        async fn worktree_list(&self) -> Result<Vec<PathBuf>, GitError> {
            Ok(vec![])
        }
        async fn create_branch(&self, _name: &str, _base: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn delete_branch(&self, _name: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn merge_branch(&self, _path: &Path, _from: &str, _strategy: MergeStrategy) -> Result<(), GitError> {
            Ok(())
        }
        async fn stage_all(&self, _path: &Path) -> Result<(), GitError> {
            Ok(())
        }
        async fn commit(&self, _path: &Path, message: &str) -> Result<String, GitError> {
            self.commits.lock().unwrap().push(message.to_string());
            Ok("abc123".to_string())
        }
        async fn push(&self, _path: &Path, _remote: &str, _branch: &str) -> Result<(), GitError> {
            Ok(())
        }
    }

    fn finalizer(changes: GitChangesInfo, config: FinalizeConfig) -> (Finalizer, Arc<FakeGit>) {
        let git = Arc::new(FakeGit {
            branch: "quorum/tasks/t1".to_string(),
            changes,
            commits: Mutex::new(vec![]),
        });
        (Finalizer::new(git.clone(), None, config), git)
    }

    #[tokio::test]
    async fn commits_with_exact_message_template() {
        let changes = GitChangesInfo {
            staged: vec!["src/lib.rs".into()],
            unstaged: vec![],
            untracked: vec![],
        };
        let (finalizer, git) = finalizer(changes, FinalizeConfig::default());
        let mut task = TaskState::new("t1", "add the widget", "claude");
        task.status = TaskStatus::Running;

        finalizer.finalize(&mut task, Path::new("/repo")).await.unwrap();

        assert_eq!(task.last_commit.as_deref(), Some("abc123"));
        assert!(task.resumable);
        let commits = git.commits.lock().unwrap();
        assert_eq!(commits[0], "feat(quorum): add the widget\n\nTask-ID: t1\nGenerated-By: quorum-ai");
    }

    #[tokio::test]
    async fn skips_commit_when_tree_is_clean() {
        let (finalizer, _git) = finalizer(GitChangesInfo::default(), FinalizeConfig::default());
        let mut task = TaskState::new("t1", "no-op", "claude");

        finalizer.finalize(&mut task, Path::new("/repo")).await.unwrap();

        assert!(task.last_commit.is_none());
        assert!(!task.resumable);
    }

    #[tokio::test]
    async fn auto_push_without_resolvable_branch_fails() {
        let changes = GitChangesInfo::default();
        let config = FinalizeConfig {
            auto_push: true,
            ..FinalizeConfig::default()
        };
        let git = Arc::new(FakeGit {
            branch: String::new(),
            changes,
            commits: Mutex::new(vec![]),
        });
        let finalizer = Finalizer::new(git, None, config);
        let mut task = TaskState::new("t1", "no branch", "claude");
        task.branch = None;

        let result = finalizer.finalize(&mut task, Path::new("/repo")).await;
        assert!(matches!(result, Err(FinalizerError::NoBranch(_))));
    }
}
