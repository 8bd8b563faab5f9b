//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! keep the write-to-temp-then-rename dance in one place.

use std::path::Path;

use crate::{Error, Result};

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path(op, path, e))
}

/// Write `contents` to `path` atomically using a sibling temp file.
///
/// Readers (ffmpeg polling a playlist, a restarted process loading a
/// checkpoint) never observe a half-written file.
pub async fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    let mut temp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    tokio::fs::write(&temp_path, contents)
        .await
        .map_err(|e| Error::io_path("writing", &temp_path, e))?;

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::io_path("renaming", &temp_path, e))
}

/// Returns the file size when `path` is a readable regular file.
pub async fn file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_dir_creates_nested_directories() {
        let temp = TempDir::new().unwrap();
        let nested_dir = temp.path().join("level1").join("level2");

        ensure_dir_all_with_op("creating cache directory", &nested_dir)
            .await
            .unwrap();
        assert!(nested_dir.is_dir());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("live.m3u8");

        write_atomic(&path, "first").await.unwrap();
        write_atomic(&path, "second").await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second");
        assert!(!temp.path().join("live.m3u8.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_size_missing_file() {
        let temp = TempDir::new().unwrap();
        assert_eq!(file_size(&temp.path().join("nope.ts")).await, None);
        assert_eq!(file_size(temp.path()).await, None);

        let path = temp.path().join("segment_1.ts");
        tokio::fs::write(&path, [0u8; 188]).await.unwrap();
        assert_eq!(file_size(&path).await, Some(188));
    }
}
