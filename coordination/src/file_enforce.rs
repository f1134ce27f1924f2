//! File Enforcement — ensure directories exist and fall back stdout→file.
//!
//! The discipline spec §9 calls "File enforcement": before invoking an
//! agent expected to write a file, make sure its parent directory exists;
//! after invocation, if the agent didn't write the file but did print to
//! stdout, write stdout there instead so downstream readers (Planner
//! manifest scan, Moderator score parse) always have a file to read.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FileEnforceError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write fallback file {path}: {source}")]
    WriteFallback {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type FileEnforceResult<T> = Result<T, FileEnforceError>;

/// Ensure the parent directory of `path` exists, creating it (and any
/// ancestors) if necessary.
pub async fn ensure_parent_dir(path: &Path) -> FileEnforceResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| FileEnforceError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Verify that `path` exists; if not, write `fallback_stdout` there. Used
/// after invoking an agent that was asked to write `path` itself but may
/// have only printed to stdout (spec §4.1 step 6, §9 "File enforcement").
///
/// Returns `true` if the fallback write happened, `false` if the file
/// already existed (the agent behaved as expected).
pub async fn verify_or_write_fallback(path: &Path, fallback_stdout: &str) -> FileEnforceResult<bool> {
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(false);
    }
    ensure_parent_dir(path).await?;
    tokio::fs::write(path, fallback_stdout)
        .await
        .map_err(|source| FileEnforceError::WriteFallback {
            path: path.display().to_string(),
            source,
        })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_parent_dir_creates_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c/out.md");
        ensure_parent_dir(&nested).await.unwrap();
        assert!(nested.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn verify_or_write_fallback_only_writes_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round-2.md");

        let wrote = verify_or_write_fallback(&path, "fallback content").await.unwrap();
        assert!(wrote);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "fallback content");

        // Second call: file now exists, must not overwrite.
        let wrote_again = verify_or_write_fallback(&path, "different content").await.unwrap();
        assert!(!wrote_again);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "fallback content");
    }
}
