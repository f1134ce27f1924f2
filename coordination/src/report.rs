//! Report writer — the filesystem layout under a run directory (spec §6).
//!
//! The trait is the boundary the engine depends on; [`FsReportWriter`] is a
//! reference filesystem implementation so the workspace runs end-to-end
//! without an external collaborator.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::file_enforce::{ensure_parent_dir, FileEnforceError};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    FileEnforce(#[from] FileEnforceError),

    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ReportResult<T> = Result<T, ReportError>;

/// Spec §6's filesystem layout, computed relative to a run directory.
pub trait ReportPaths {
    fn run_dir(&self) -> &Path;

    fn v1_analysis_path(&self, agent: &str, model: &str) -> PathBuf {
        self.run_dir()
            .join("analyze-phase/v1")
            .join(format!("{agent}-{model}.md"))
    }

    fn vn_analysis_path(&self, agent: &str, model: &str, round: u32) -> PathBuf {
        self.run_dir()
            .join(format!("analyze-phase/v{round}"))
            .join(format!("{agent}-{model}.md"))
    }

    fn moderator_attempt_path(&self, round: u32, attempt: u32, agent: &str) -> PathBuf {
        self.run_dir()
            .join("analyze-phase/moderator")
            .join(format!("round-{round}.attempt-{attempt}-{agent}.md"))
    }

    fn moderator_round_path(&self, round: u32) -> PathBuf {
        self.run_dir()
            .join("analyze-phase/moderator")
            .join(format!("round-{round}.md"))
    }

    fn consolidated_analysis_path(&self) -> PathBuf {
        self.run_dir().join("analyze-phase/consolidated.md")
    }

    fn task_spec_path(&self, id: &str, name: &str) -> PathBuf {
        self.run_dir().join("plan-phase/tasks").join(format!("{id}-{name}.md"))
    }

    fn tasks_dir(&self) -> PathBuf {
        self.run_dir().join("plan-phase/tasks")
    }

    fn execution_graph_path(&self) -> PathBuf {
        self.run_dir().join("plan-phase/execution-graph.json")
    }

    fn task_output_path(&self, id: &str) -> PathBuf {
        self.run_dir().join("execute-phase/outputs").join(format!("{id}.md"))
    }
}

/// Plain struct implementing [`ReportPaths`] for a given run directory.
pub struct RunLayout {
    pub run_dir: PathBuf,
}

impl ReportPaths for RunLayout {
    fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

/// Writes/reads report artifacts under a run directory.
#[async_trait]
pub trait ReportWriter: Send + Sync {
    async fn write(&self, path: &Path, content: &str) -> ReportResult<()>;
    async fn read(&self, path: &Path) -> ReportResult<String>;
    async fn exists(&self, path: &Path) -> bool;
}

/// Filesystem-backed [`ReportWriter`].
pub struct FsReportWriter;

#[async_trait]
impl ReportWriter for FsReportWriter {
    async fn write(&self, path: &Path, content: &str) -> ReportResult<()> {
        ensure_parent_dir(path).await?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ReportError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    async fn read(&self, path: &Path) -> ReportResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ReportError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_spec_paths() {
        let layout = RunLayout {
            run_dir: PathBuf::from("/runs/wf-1"),
        };
        assert_eq!(
            layout.v1_analysis_path("claude", "sonnet"),
            PathBuf::from("/runs/wf-1/analyze-phase/v1/claude-sonnet.md")
        );
        assert_eq!(
            layout.vn_analysis_path("claude", "sonnet", 3),
            PathBuf::from("/runs/wf-1/analyze-phase/v3/claude-sonnet.md")
        );
        assert_eq!(
            layout.moderator_round_path(2),
            PathBuf::from("/runs/wf-1/analyze-phase/moderator/round-2.md")
        );
        assert_eq!(
            layout.task_spec_path("t1", "setup-db"),
            PathBuf::from("/runs/wf-1/plan-phase/tasks/t1-setup-db.md")
        );
        assert_eq!(
            layout.task_output_path("t1"),
            PathBuf::from("/runs/wf-1/execute-phase/outputs/t1.md")
        );
    }

    #[tokio::test]
    async fn fs_writer_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsReportWriter;
        let path = dir.path().join("nested/out.md");
        assert!(!writer.exists(&path).await);
        writer.write(&path, "hello").await.unwrap();
        assert!(writer.exists(&path).await);
        assert_eq!(writer.read(&path).await.unwrap(), "hello");
    }
}
