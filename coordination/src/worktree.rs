//! Worktree Manager — per-task git worktree + branch lifecycle (spec §4.6).
//!
//! Two coexisting models: a legacy, single-branch-per-issue mode, and a
//! second, workflow-scoped mode for isolation across the whole run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::git::{GitClient, GitError, MergeStrategy};
use crate::state::{TaskId, TaskState, TaskStatus, WorkflowId};

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("no worktree found for task {0}")]
    NotFound(TaskId),

    #[error("worktree already exists for task {0}")]
    AlreadyExists(TaskId),
}

pub type WorktreeResult<T> = Result<T, WorktreeError>;

#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
}

/// Manages git worktrees for task execution, legacy and workflow-scoped.
pub struct WorktreeManager {
    git: Arc<dyn GitClient>,
    base_dir: PathBuf,
    /// task_id -> handle, for orphan scanning.
    active: RwLock<HashMap<TaskId, WorktreeHandle>>,
}

impl WorktreeManager {
    pub fn new(git: Arc<dyn GitClient>, base_dir: PathBuf) -> Self {
        Self {
            git,
            base_dir,
            active: RwLock::new(HashMap::new()),
        }
    }

    fn task_worktree_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    // ---------------------------------------------------------------
    // Legacy per-task model
    // ---------------------------------------------------------------

    /// Create a worktree from HEAD.
    pub async fn create(&self, task: &TaskState) -> WorktreeResult<WorktreeHandle> {
        self.create_from_branch(task, "HEAD").await
    }

    /// Create a worktree branching from `base` (spec §4.6 "Dependency
    /// inheritance"): picks the most recently completed dependency's
    /// branch, or HEAD if there are no completed dependencies.
    pub async fn create_from_branch(&self, task: &TaskState, base: &str) -> WorktreeResult<WorktreeHandle> {
        let path = self.task_worktree_path(&task.id);
        if self.active.read().await.contains_key(&task.id) {
            return Err(WorktreeError::AlreadyExists(task.id.clone()));
        }
        let branch = format!("quorum/tasks/{}", task.id);
        self.git.worktree_add(&path, &branch, base).await?;
        let handle = WorktreeHandle { path, branch };
        self.active.write().await.insert(task.id.clone(), handle.clone());
        Ok(handle)
    }

    /// Resolve the dependency-inheritance base branch: the most recently
    /// completed dependency's branch, arbitrary tie-break among
    /// concurrently-completed ones (spec §4.6).
    pub fn dependency_base_branch<'a>(
        &self,
        deps: &[TaskId],
        tasks: &'a HashMap<TaskId, TaskState>,
    ) -> Option<&'a str> {
        deps.iter()
            .filter_map(|id| tasks.get(id))
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.completed_at.zip(t.branch.as_deref()))
            .max_by_key(|(completed_at, _)| *completed_at)
            .map(|(_, branch)| branch)
    }

    pub async fn remove(&self, task_id: &str, auto_clean: bool) -> WorktreeResult<()> {
        let handle = self
            .active
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?;
        if auto_clean {
            self.git.worktree_remove(&handle.path).await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<(TaskId, WorktreeHandle)> {
        self.active
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect()
    }

    // ---------------------------------------------------------------
    // Workflow-scoped model
    // ---------------------------------------------------------------

    pub async fn create_workflow_branch(&self, workflow_id: &WorkflowId, default_branch: &str) -> WorktreeResult<String> {
        let branch = format!("quorum/workflows/{workflow_id}");
        self.git.create_branch(&branch, default_branch).await?;
        Ok(branch)
    }

    pub async fn create_task_worktree(
        &self,
        workflow_id: &WorkflowId,
        task: &TaskState,
        workflow_branch: &str,
    ) -> WorktreeResult<WorktreeHandle> {
        let path = self.task_worktree_path(&task.id);
        let branch = format!("quorum/workflows/{workflow_id}/tasks/{}", task.id);
        self.git.worktree_add(&path, &branch, workflow_branch).await?;
        let handle = WorktreeHandle { path, branch };
        self.active.write().await.insert(task.id.clone(), handle.clone());
        Ok(handle)
    }

    /// `remove_branch=false` retains the branch for a pending merge (spec
    /// §4.6), leaving `TaskState.merge_pending` as the signal orphan
    /// cleanup uses to skip this worktree. `remove_branch=true` deletes it.
    pub async fn remove_task_worktree(&self, task_id: &str, remove_branch: bool) -> WorktreeResult<()> {
        let handle = self
            .active
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?;
        self.git.worktree_remove(&handle.path).await?;
        if remove_branch {
            // Best-effort: the worktree is already gone, so a stray branch
            // left behind here is cleaned up later by orphan scanning.
            if let Err(e) = self.git.delete_branch(&handle.branch).await {
                warn!(branch = %handle.branch, error = %e, "failed to delete task branch, leaving it behind");
            }
        }
        Ok(())
    }

    pub async fn merge_task_to_workflow(
        &self,
        workflow_branch_path: &Path,
        task_branch: &str,
        strategy: MergeStrategy,
    ) -> WorktreeResult<()> {
        self.git
            .merge_branch(workflow_branch_path, task_branch, strategy)
            .await
            .map_err(WorktreeError::Git)
    }

    // ---------------------------------------------------------------
    // Orphan cleanup (spec §4.5 preliminary action, §4.6)
    // ---------------------------------------------------------------

    /// Remove every managed worktree whose `TaskState` is missing from
    /// `tasks` or not `Running`, unless `merge_pending` marks it resumable.
    pub async fn cleanup_orphans(&self, tasks: &HashMap<TaskId, TaskState>) -> WorktreeResult<usize> {
        let candidates: Vec<(TaskId, WorktreeHandle)> = self.list().await;
        let mut removed = 0;
        for (task_id, _handle) in candidates {
            let keep = match tasks.get(&task_id) {
                Some(state) => state.status == TaskStatus::Running || state.merge_pending,
                None => false,
            };
            if !keep {
                match self.remove(&task_id, true).await {
                    Ok(()) => {
                        removed += 1;
                        info!(task_id, "removed orphaned worktree");
                    }
                    Err(e) => warn!(task_id, error = %e, "failed to remove orphaned worktree, continuing"),
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitChangesInfo;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FakeGit {
        worktrees: Mutex<Vec<PathBuf>>,
        deleted_branches: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GitClient for FakeGit {
        fn repo_root(&self) -> PathBuf {
            PathBuf::from("/repo")
        }
        async fn current_branch(&self, _path: &Path) -> Result<String, GitError> {
            Ok("main".into())
        }
        async fn status(&self, _path: &Path) -> Result<GitChangesInfo, GitError> {
            Ok(GitChangesInfo::default())
        }
        async fn worktree_add(&self, path: &Path, _branch: &str, _base: &str) -> Result<(), GitError> {
            self.worktrees.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
        async fn worktree_remove(&self, path: &Path) -> Result<(), GitError> {
            self.worktrees.lock().unwrap().retain(|p| p != path);
            Ok(())
        }
        async fn worktree_list(&self) -> Result<Vec<PathBuf>, GitError> {
            Ok(self.worktrees.lock().unwrap().clone())
        }
        async fn create_branch(&self, _name: &str, _base: &str) -> Result<(), GitError> {
            Ok(())
        }
        async fn delete_branch(&self, name: &str) -> Result<(), GitError> {
            self.deleted_branches.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn merge_branch(&self, _path: &Path, _from: &str, _strategy: MergeStrategy) -> Result<(), GitError> {
            Ok(())
        }
        async fn stage_all(&self, _path: &Path) -> Result<(), GitError> {
            Ok(())
        }
        async fn commit(&self, _path: &Path, _message: &str) -> Result<String, GitError> {
            Ok("deadbeef".into())
        }
        async fn push(&self, _path: &Path, _remote: &str, _branch: &str) -> Result<(), GitError> {
            Ok(())
        }
    }

    fn manager() -> WorktreeManager {
        WorktreeManager::new(
            Arc::new(FakeGit {
                worktrees: Mutex::new(vec![]),
                deleted_branches: Mutex::new(vec![]),
            }),
            PathBuf::from("/tmp/wt"),
        )
    }

    #[tokio::test]
    async fn create_and_remove_round_trips() {
        let mgr = manager();
        let task = TaskState::new("t1", "do thing", "claude");
        let handle = mgr.create(&task).await.unwrap();
        assert_eq!(handle.branch, "quorum/tasks/t1");
        assert_eq!(mgr.list().await.len(), 1);
        mgr.remove("t1", true).await.unwrap();
        assert_eq!(mgr.list().await.len(), 0);
    }

    #[tokio::test]
    async fn dependency_base_branch_picks_most_recent_completion() {
        let mgr = manager();
        let mut tasks = HashMap::new();
        let mut older = TaskState::new("a", "a", "claude");
        older.status = TaskStatus::Completed;
        older.branch = Some("branch-a".into());
        older.completed_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let mut newer = TaskState::new("b", "b", "claude");
        newer.status = TaskStatus::Completed;
        newer.branch = Some("branch-b".into());
        newer.completed_at = Some(Utc::now());
        tasks.insert("a".to_string(), older);
        tasks.insert("b".to_string(), newer);

        let base = mgr.dependency_base_branch(&["a".to_string(), "b".to_string()], &tasks);
        assert_eq!(base, Some("branch-b"));
    }

    #[tokio::test]
    async fn cleanup_orphans_removes_non_running_and_keeps_merge_pending() {
        let mgr = manager();
        let t1 = TaskState::new("t1", "one", "claude");
        let t2 = TaskState::new("t2", "two", "claude");
        mgr.create(&t1).await.unwrap();
        mgr.create(&t2).await.unwrap();

        let mut tasks = HashMap::new();
        let mut running = TaskState::new("t1", "one", "claude");
        running.status = TaskStatus::Running;
        tasks.insert("t1".to_string(), running);
        // t2 absent from `tasks` entirely -> orphan, should be removed.

        let removed = mgr.cleanup_orphans(&tasks).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(mgr.list().await.len(), 1);
    }
}
