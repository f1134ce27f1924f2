//! `GitClient` backed by shelled-out `git` subprocesses: `git worktree
//! add/remove/list`, `merge`, `commit`/`push` invocations, run asynchronously
//! via `tokio::process::Command`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use coordination::{GitChangesInfo, GitClient, GitError, GitResult, MergeStrategy};
use tokio::process::Command;

pub struct ShellGitClient {
    repo_root: PathBuf,
}

impl ShellGitClient {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> GitResult<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| GitError::Failed(format!("git {}: {e}", args.join(" "))))
    }

    async fn run_ok(&self, dir: &Path, args: &[&str]) -> GitResult<String> {
        let output = self.run(dir, args).await?;
        if !output.status.success() {
            return Err(GitError::Failed(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitClient for ShellGitClient {
    fn repo_root(&self) -> PathBuf {
        self.repo_root.clone()
    }

    async fn current_branch(&self, path: &Path) -> GitResult<String> {
        self.run_ok(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn status(&self, path: &Path) -> GitResult<GitChangesInfo> {
        let raw = self.run_ok(path, &["status", "--porcelain"]).await?;
        let mut staged = Vec::new();
        let mut unstaged = Vec::new();
        let mut untracked = Vec::new();
        for line in raw.lines() {
            if line.len() < 3 {
                continue;
            }
            let (index_status, worktree_status) = (line.as_bytes()[0], line.as_bytes()[1]);
            let file = line[3..].to_string();
            if index_status == b'?' && worktree_status == b'?' {
                untracked.push(file);
            } else {
                if index_status != b' ' {
                    staged.push(file.clone());
                }
                if worktree_status != b' ' {
                    unstaged.push(file);
                }
            }
        }
        Ok(GitChangesInfo { staged, unstaged, untracked })
    }

    async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> GitResult<()> {
        self.run_ok(
            &self.repo_root,
            &["worktree", "add", "-b", branch, &path.display().to_string(), base],
        )
        .await
        .map(|_| ())
    }

    async fn worktree_remove(&self, path: &Path) -> GitResult<()> {
        self.run_ok(&self.repo_root, &["worktree", "remove", "--force", &path.display().to_string()])
            .await
            .map(|_| ())
    }

    async fn worktree_list(&self) -> GitResult<Vec<PathBuf>> {
        let raw = self.run_ok(&self.repo_root, &["worktree", "list", "--porcelain"]).await?;
        Ok(raw
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    async fn create_branch(&self, name: &str, base: &str) -> GitResult<()> {
        self.run_ok(&self.repo_root, &["branch", name, base]).await.map(|_| ())
    }

    async fn delete_branch(&self, name: &str) -> GitResult<()> {
        self.run_ok(&self.repo_root, &["branch", "-D", name]).await.map(|_| ())
    }

    async fn merge_branch(&self, path: &Path, from: &str, strategy: MergeStrategy) -> GitResult<()> {
        let output = match strategy {
            MergeStrategy::Sequential => self.run(path, &["merge", "--no-ff", from]).await?,
            MergeStrategy::Squash => {
                let squash = self.run(path, &["merge", "--squash", from]).await?;
                if !squash.status.success() {
                    return Err(GitError::MergeConflict(from.to_string()));
                }
                self.run(path, &["commit", "-m", &format!("merge (squash): {from}")]).await?
            }
            MergeStrategy::Rebase => self.run(path, &["rebase", from]).await?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("conflict") || stderr.contains("CONFLICT") {
                return Err(GitError::MergeConflict(from.to_string()));
            }
            return Err(GitError::Failed(format!("merge of {from} failed: {stderr}")));
        }
        Ok(())
    }

    async fn stage_all(&self, path: &Path) -> GitResult<()> {
        self.run_ok(path, &["add", "-A"]).await.map(|_| ())
    }

    async fn commit(&self, path: &Path, message: &str) -> GitResult<String> {
        self.run_ok(path, &["commit", "-m", message]).await?;
        self.run_ok(path, &["rev-parse", "HEAD"]).await
    }

    async fn push(&self, path: &Path, remote: &str, branch: &str) -> GitResult<()> {
        self.run_ok(path, &["push", remote, branch]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command as TokioCommand;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "test"],
        ] {
            TokioCommand::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        TokioCommand::new("git").args(["add", "."]).current_dir(dir).output().await.unwrap();
        TokioCommand::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().await.unwrap();
    }

    #[tokio::test]
    async fn status_buckets_staged_unstaged_and_untracked() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("README.md"), "changed").unwrap();
        std::fs::write(dir.path().join("new.txt"), "new").unwrap();

        let client = ShellGitClient::new(dir.path().to_path_buf());
        let status = client.status(dir.path()).await.unwrap();

        assert!(status.unstaged.contains(&"README.md".to_string()));
        assert!(status.untracked.contains(&"new.txt".to_string()));
        assert!(status.has_changes());
    }

    #[tokio::test]
    async fn worktree_add_list_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let client = ShellGitClient::new(dir.path().to_path_buf());
        let wt_path = dir.path().join("wt1");

        client.worktree_add(&wt_path, "feature/wt1", "main").await.unwrap();
        assert!(wt_path.exists());

        let list = client.worktree_list().await.unwrap();
        assert!(list.iter().any(|p| p == &wt_path));

        client.worktree_remove(&wt_path).await.unwrap();
        let list = client.worktree_list().await.unwrap();
        assert!(!list.iter().any(|p| p == &wt_path));
    }

    #[tokio::test]
    async fn delete_branch_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let client = ShellGitClient::new(dir.path().to_path_buf());

        client.create_branch("throwaway", "main").await.unwrap();
        client.delete_branch("throwaway").await.unwrap();

        let output = client.run(dir.path(), &["branch", "--list", "throwaway"]).await.unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).trim().is_empty());
    }

    #[tokio::test]
    async fn commit_and_current_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let client = ShellGitClient::new(dir.path().to_path_buf());

        std::fs::write(dir.path().join("README.md"), "v2").unwrap();
        client.stage_all(dir.path()).await.unwrap();
        let sha = client.commit(dir.path(), "update readme").await.unwrap();
        assert_eq!(sha.len(), 40);

        let branch = client.current_branch(dir.path()).await.unwrap();
        assert_eq!(branch, "main");
    }
}
