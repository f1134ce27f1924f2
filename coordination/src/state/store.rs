//! Persistent state store.
//!
//! `StateStore` is the narrow trait the engine depends on (spec §6);
//! `SledStateStore` is the one production implementation: a
//! column-family-via-prefix shape over `sled`, with `bincode` encoding, so
//! the CLI has no C++ toolchain build dependency.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use super::types::{WorkflowId, WorkflowState};

/// Error type for state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("lock for workflow {0} is already held")]
    LockHeld(String),

    #[error("lock for workflow {0} is not held by this process")]
    LockNotHeld(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to a `StateStore` implementation.
pub type SharedStateStore = Arc<dyn StateStore>;

/// The persistence boundary the engine depends on (spec §6 "State store interface").
///
/// Every mutator is synchronous by design: the engine always holds the
/// per-workflow lock (acquired via `acquire_lock`) while mutating, so there
/// is no concurrent-writer scenario the trait itself needs to arbitrate —
/// that's `ExecuteAtomically`'s job (a single critical section per call).
pub trait StateStore: Send + Sync {
    fn save(&self, state: &WorkflowState) -> StoreResult<()>;
    fn load(&self, id: &WorkflowId) -> StoreResult<WorkflowState>;
    fn load_by_id(&self, id: &str) -> StoreResult<WorkflowState> {
        self.load(&WorkflowId::parse(id).map_err(StoreError::Backend)?)
    }

    /// Acquire the per-workflow lock. Fails with `LockHeld` if another
    /// process already holds it.
    fn acquire_lock(&self, id: &WorkflowId) -> StoreResult<()>;
    fn release_lock(&self, id: &WorkflowId) -> StoreResult<()>;

    /// Acquire the process-wide lock used by the Runner before it even
    /// knows which workflow id it will operate on (e.g. during `purge`).
    fn acquire_global_lock(&self) -> StoreResult<()>;
    fn release_global_lock(&self) -> StoreResult<()>;

    fn update_heartbeat(&self, id: &WorkflowId) -> StoreResult<()>;

    /// Workflows whose heartbeat is older than `threshold` and that are not
    /// excluded by `owned_by_self` (the heartbeat reaper skips workflows this
    /// process actively owns — spec §5 "Heartbeat").
    fn find_zombie_workflows(&self, threshold: Duration) -> StoreResult<Vec<WorkflowId>>;

    fn purge_all_workflows(&self) -> StoreResult<()>;
    fn delete_workflow(&self, id: &WorkflowId) -> StoreResult<()>;

    /// Run `f` with the workflow lock held and persist whatever it returns,
    /// atomically with respect to other `execute_atomically` callers on the
    /// same store (spec §6 "Atomicity required for task-completion persistence").
    fn execute_atomically(
        &self,
        id: &WorkflowId,
        f: &mut dyn FnMut(&mut WorkflowState) -> StoreResult<()>,
    ) -> StoreResult<()> {
        self.acquire_lock(id)?;
        let result = (|| {
            let mut state = self.load(id)?;
            f(&mut state)?;
            self.save(&state)
        })();
        // Always release even if `f` or save failed, so a single failed
        // mutation doesn't permanently wedge the workflow.
        let _ = self.release_lock(id);
        result
    }
}

const WORKFLOWS_TREE: &str = "workflows";
const LOCKS_TREE: &str = "locks";
const GLOBAL_LOCK_KEY: &str = "__global__";

/// `sled`-backed implementation.
pub struct SledStateStore {
    db: sled::Db,
    #[allow(dead_code)]
    path: PathBuf,
}

impl SledStateStore {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let db = sled::open(&path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db, path })
    }

    fn tree(&self, name: &str) -> StoreResult<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn put<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> StoreResult<()> {
        let t = self.tree(tree)?;
        let bytes = bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        t.insert(key.as_bytes(), bytes)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        t.flush().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, tree: &str, key: &str) -> StoreResult<Option<T>> {
        let t = self.tree(tree)?;
        match t.get(key.as_bytes()).map_err(|e| StoreError::Backend(e.to_string()))? {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl StateStore for SledStateStore {
    fn save(&self, state: &WorkflowState) -> StoreResult<()> {
        self.put(WORKFLOWS_TREE, state.id().as_str(), state)
    }

    fn load(&self, id: &WorkflowId) -> StoreResult<WorkflowState> {
        self.get(WORKFLOWS_TREE, id.as_str())?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn acquire_lock(&self, id: &WorkflowId) -> StoreResult<()> {
        let t = self.tree(LOCKS_TREE)?;
        let key = id.as_str().as_bytes();
        let result = t.compare_and_swap(key, None::<&[u8]>, Some(b"locked".as_slice()));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(StoreError::LockHeld(id.to_string())),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    fn release_lock(&self, id: &WorkflowId) -> StoreResult<()> {
        let t = self.tree(LOCKS_TREE)?;
        t.remove(id.as_str().as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn acquire_global_lock(&self) -> StoreResult<()> {
        let t = self.tree(LOCKS_TREE)?;
        let result = t.compare_and_swap(
            GLOBAL_LOCK_KEY.as_bytes(),
            None::<&[u8]>,
            Some(b"locked".as_slice()),
        );
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(StoreError::LockHeld(GLOBAL_LOCK_KEY.to_string())),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    fn release_global_lock(&self) -> StoreResult<()> {
        let t = self.tree(LOCKS_TREE)?;
        t.remove(GLOBAL_LOCK_KEY.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn update_heartbeat(&self, id: &WorkflowId) -> StoreResult<()> {
        let mut state = self.load(id)?;
        state.run.heartbeat_at = chrono::Utc::now();
        self.save(&state)
    }

    fn find_zombie_workflows(&self, threshold: Duration) -> StoreResult<Vec<WorkflowId>> {
        let t = self.tree(WORKFLOWS_TREE)?;
        let now = chrono::Utc::now();
        let mut zombies = Vec::new();
        for item in t.iter() {
            let (_, bytes) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            let state: WorkflowState = bincode::deserialize(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let age = now.signed_duration_since(state.run.heartbeat_at);
            if age.to_std().unwrap_or_default() > threshold
                && matches!(
                    state.run.status,
                    super::types::WorkflowStatus::Running | super::types::WorkflowStatus::AwaitingReview
                )
            {
                zombies.push(state.definition.id.clone());
            }
        }
        Ok(zombies)
    }

    fn purge_all_workflows(&self) -> StoreResult<()> {
        self.tree(WORKFLOWS_TREE)?
            .clear()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.tree(LOCKS_TREE)?
            .clear()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn delete_workflow(&self, id: &WorkflowId) -> StoreResult<()> {
        self.tree(WORKFLOWS_TREE)?
            .remove(id.as_str().as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store used by tests and the `doctor` dry-run path.
pub struct InMemoryStateStore {
    inner: std::sync::Mutex<std::collections::HashMap<String, WorkflowState>>,
    locks: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(std::collections::HashMap::new()),
            locks: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn shared() -> SharedStateStore {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStateStore {
    fn save(&self, state: &WorkflowState) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .insert(state.id().to_string(), state.clone());
        Ok(())
    }

    fn load(&self, id: &WorkflowId) -> StoreResult<WorkflowState> {
        self.inner
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn acquire_lock(&self, id: &WorkflowId) -> StoreResult<()> {
        if self.locks.lock().unwrap().insert(id.to_string()) {
            Ok(())
        } else {
            Err(StoreError::LockHeld(id.to_string()))
        }
    }

    fn release_lock(&self, id: &WorkflowId) -> StoreResult<()> {
        self.locks.lock().unwrap().remove(id.as_str());
        Ok(())
    }

    fn acquire_global_lock(&self) -> StoreResult<()> {
        if self.locks.lock().unwrap().insert(GLOBAL_LOCK_KEY.to_string()) {
            Ok(())
        } else {
            Err(StoreError::LockHeld(GLOBAL_LOCK_KEY.to_string()))
        }
    }

    fn release_global_lock(&self) -> StoreResult<()> {
        self.locks.lock().unwrap().remove(GLOBAL_LOCK_KEY);
        Ok(())
    }

    fn update_heartbeat(&self, id: &WorkflowId) -> StoreResult<()> {
        let mut guard = self.inner.lock().unwrap();
        let state = guard
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        state.run.heartbeat_at = chrono::Utc::now();
        Ok(())
    }

    fn find_zombie_workflows(&self, threshold: Duration) -> StoreResult<Vec<WorkflowId>> {
        let now = chrono::Utc::now();
        Ok(self
            .inner
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                let age = now.signed_duration_since(s.run.heartbeat_at);
                age.to_std().unwrap_or_default() > threshold
                    && matches!(
                        s.run.status,
                        super::types::WorkflowStatus::Running | super::types::WorkflowStatus::AwaitingReview
                    )
            })
            .map(|s| s.definition.id.clone())
            .collect())
    }

    fn purge_all_workflows(&self) -> StoreResult<()> {
        self.inner.lock().unwrap().clear();
        Ok(())
    }

    fn delete_workflow(&self, id: &WorkflowId) -> StoreResult<()> {
        self.inner.lock().unwrap().remove(id.as_str());
        Ok(())
    }
}

/// Joins a run directory and a relative report path; used by callers that
/// need a concrete `PathBuf` for a workflow's on-disk artifacts.
pub fn run_dir(base: &Path, id: &WorkflowId) -> PathBuf {
    base.join(id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStateStore::open(dir.path()).unwrap();
        let state = WorkflowState::new("build a thing", None);
        store.save(&state).unwrap();
        let loaded = store.load(state.id()).unwrap();
        assert_eq!(loaded.definition.id, state.definition.id);
        assert_eq!(loaded.definition.prompt, state.definition.prompt);
        assert_eq!(loaded.run.status, state.run.status);
    }

    #[test]
    fn lock_is_exclusive() {
        let store = InMemoryStateStore::new();
        let id = WorkflowId::new();
        store.acquire_lock(&id).unwrap();
        assert!(matches!(store.acquire_lock(&id), Err(StoreError::LockHeld(_))));
        store.release_lock(&id).unwrap();
        assert!(store.acquire_lock(&id).is_ok());
    }

    #[test]
    fn zombie_detection_respects_threshold() {
        let store = InMemoryStateStore::new();
        let mut state = WorkflowState::new("p", None);
        state.run.status = super::super::types::WorkflowStatus::Running;
        state.run.heartbeat_at = chrono::Utc::now() - chrono::Duration::hours(1);
        store.save(&state).unwrap();

        let zombies = store.find_zombie_workflows(Duration::from_secs(60)).unwrap();
        assert_eq!(zombies, vec![state.definition.id]);

        let none = store
            .find_zombie_workflows(Duration::from_secs(60 * 60 * 24))
            .unwrap();
        assert!(none.is_empty());
    }
}
