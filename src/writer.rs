//! Incoming file writer.
//!
//! Materializes the single in-flight incoming file for a connection.
//! The protocol offers no multiplexing identifier, so at most one
//! `(path, handle)` pair exists at a time: created on NEW_FILE_PATH,
//! appended on NEW_FILE_PART, destroyed on NEW_FILE_END.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Validate that a relative path is safe and resolve it under the root.
/// Empty paths, absolute paths, `..` and prefix components are rejected;
/// a peer that sends one fails the connection.
pub fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        anyhow::bail!("empty path not allowed");
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        anyhow::bail!("absolute paths not allowed: {}", relative);
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("path traversal not allowed: {}", relative);
            }
            Component::Prefix(_) => {
                anyhow::bail!("prefix paths not allowed: {}", relative);
            }
            _ => {}
        }
    }

    Ok(root.join(rel_path))
}

/// Create every missing ancestor directory of `relative` under `root`,
/// walking the path segments from the root downward. Already-existing
/// segments (including ones another connection created concurrently) are
/// success, so the walk is idempotent and restartable.
pub async fn ensure_ancestors(root: &Path, relative: &Path) -> Result<()> {
    let Some(parent) = relative.parent() else {
        return Ok(());
    };

    let mut dir = root.to_path_buf();
    for component in parent.components() {
        dir.push(component);
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).context(format!("failed to create directory {}", dir.display()))
            }
        }
    }
    Ok(())
}

/// State of the incoming transfer. Explicit so every consumer handles the
/// no-transfer case; the handle stays `None` until the first bytes arrive.
#[derive(Debug)]
enum Incoming {
    Idle,
    Active { path: String, file: Option<File> },
}

/// Streams one announced incoming file to disk.
#[derive(Debug)]
pub struct IncomingWriter {
    root: PathBuf,
    state: Incoming,
}

impl IncomingWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Incoming::Idle,
        }
    }

    /// Record `path` as the pending incoming file. Opens nothing yet, so an
    /// announcement immediately followed by a mismatched end never creates
    /// an empty file on disk. Any previous unfinished transfer is dropped
    /// without a flush guarantee.
    pub fn announce(&mut self, path: String) {
        self.state = Incoming::Active { path, file: None };
    }

    /// Append bytes to the pending file, opening it (and creating missing
    /// ancestor directories) on the first call. With no pending path the
    /// bytes are silently discarded: a malformed or out-of-order sequence
    /// is not worth failing the connection over.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        let Incoming::Active { path, file } = &mut self.state else {
            return Ok(());
        };

        if file.is_none() {
            let dest = resolve_path(&self.root, path)?;
            ensure_ancestors(&self.root, Path::new(path.as_str())).await?;
            let created = File::create(&dest)
                .await
                .with_context(|| format!("failed to create {}", dest.display()))?;
            *file = Some(created);
        }

        if let Some(f) = file {
            f.write_all(chunk)
                .await
                .with_context(|| format!("failed to write to {}", path))?;
        }
        Ok(())
    }

    /// Finish the pending transfer. Returns `true` only when `path` matches
    /// the announced one and the file was closed cleanly; the caller then
    /// records it as received. A mismatch signals crossed protocol signals:
    /// the open handle is discarded without flushing and nothing is
    /// recorded. A matching end with no parts still materializes the file,
    /// so zero-byte files sync like any other.
    pub async fn finalize(&mut self, path: &str) -> Result<bool> {
        match std::mem::replace(&mut self.state, Incoming::Idle) {
            Incoming::Idle => Ok(false),
            Incoming::Active { path: pending, file } if pending == path => {
                match file {
                    Some(mut f) => {
                        f.flush().await?;
                        f.sync_all().await?;
                    }
                    None => {
                        let dest = resolve_path(&self.root, path)?;
                        ensure_ancestors(&self.root, Path::new(path)).await?;
                        fs::write(&dest, b"")
                            .await
                            .with_context(|| format!("failed to create {}", dest.display()))?;
                    }
                }
                Ok(true)
            }
            Incoming::Active { path: pending, .. } => {
                tracing::warn!(
                    expected = %pending,
                    got = %path,
                    "mismatched file end, discarding transfer in progress"
                );
                Ok(false)
            }
        }
    }

    /// Whether a transfer is currently pending.
    pub fn is_active(&self) -> bool {
        matches!(self.state, Incoming::Active { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_basic_receive() {
        let tmp = TempDir::new().unwrap();
        let mut writer = IncomingWriter::new(tmp.path());

        writer.announce("docs/readme.txt".to_string());
        writer.append(b"hello ").await.unwrap();
        writer.append(b"world").await.unwrap();
        assert!(writer.finalize("docs/readme.txt").await.unwrap());

        let content = std::fs::read_to_string(tmp.path().join("docs/readme.txt")).unwrap();
        assert_eq!(content, "hello world");
        assert!(!writer.is_active());
    }

    #[tokio::test]
    async fn test_append_without_announce_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let mut writer = IncomingWriter::new(tmp.path());

        writer.append(b"orphan bytes").await.unwrap();
        assert!(!writer.is_active());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_finalize_is_isolated() {
        let tmp = TempDir::new().unwrap();
        let mut writer = IncomingWriter::new(tmp.path());

        writer.announce("a".to_string());
        writer.append(b"partial").await.unwrap();
        assert!(!writer.finalize("b").await.unwrap());
        assert!(!writer.is_active());

        // A subsequent correct sequence succeeds independently.
        writer.announce("c".to_string());
        writer.append(b"ok").await.unwrap();
        assert!(writer.finalize("c").await.unwrap());
        assert_eq!(std::fs::read(tmp.path().join("c")).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_mismatched_finalize_without_parts_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut writer = IncomingWriter::new(tmp.path());

        writer.announce("never-written.txt".to_string());
        assert!(!writer.finalize("other.txt").await.unwrap());
        assert!(!tmp.path().join("never-written.txt").exists());
        assert!(!tmp.path().join("other.txt").exists());
    }

    #[tokio::test]
    async fn test_zero_byte_file_is_materialized() {
        let tmp = TempDir::new().unwrap();
        let mut writer = IncomingWriter::new(tmp.path());

        writer.announce("nested/empty.bin".to_string());
        assert!(writer.finalize("nested/empty.bin").await.unwrap());

        let dest = tmp.path().join("nested/empty.bin");
        assert!(dest.exists());
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_ensure_ancestors_idempotent() {
        let tmp = TempDir::new().unwrap();
        let rel = Path::new("a/b/c/file.txt");

        ensure_ancestors(tmp.path(), rel).await.unwrap();
        assert!(tmp.path().join("a/b/c").is_dir());

        // Second run over the same path is a no-op, as is a run where the
        // ancestors already partially exist.
        ensure_ancestors(tmp.path(), rel).await.unwrap();
        ensure_ancestors(tmp.path(), Path::new("a/b/d/other.txt"))
            .await
            .unwrap();
        assert!(tmp.path().join("a/b/c").is_dir());
        assert!(tmp.path().join("a/b/d").is_dir());
    }

    #[tokio::test]
    async fn test_unsafe_paths_rejected() {
        let tmp = TempDir::new().unwrap();

        assert!(resolve_path(tmp.path(), "").is_err());
        assert!(resolve_path(tmp.path(), "/etc/passwd").is_err());
        assert!(resolve_path(tmp.path(), "../escape.txt").is_err());
        assert!(resolve_path(tmp.path(), "ok/../../escape.txt").is_err());
        assert!(resolve_path(tmp.path(), "docs/readme.txt").is_ok());

        let mut writer = IncomingWriter::new(tmp.path());
        writer.announce("../escape.txt".to_string());
        assert!(writer.append(b"data").await.is_err());
    }

    #[tokio::test]
    async fn test_announce_replaces_unfinished_transfer() {
        let tmp = TempDir::new().unwrap();
        let mut writer = IncomingWriter::new(tmp.path());

        writer.announce("first.txt".to_string());
        writer.append(b"abandoned").await.unwrap();

        writer.announce("second.txt".to_string());
        writer.append(b"kept").await.unwrap();
        assert!(writer.finalize("second.txt").await.unwrap());

        assert_eq!(std::fs::read(tmp.path().join("second.txt")).unwrap(), b"kept");
    }
}
