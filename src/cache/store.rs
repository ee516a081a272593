use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs as async_fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::CacheEntry;
use super::writer::{AtomicFileWriter, is_temp_file_name};
use crate::error::{CacheError, CacheResult};

/// Filesystem primitives for one storage root (a mounted volume).
///
/// Every mutation of a cache directory goes through here. Nothing is indexed:
/// listings always re-read the directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns `<root>/<dir_name>`, creating it when absent.
    ///
    /// The root itself is never created: a missing root means the volume is
    /// not mounted and the caller should fall back to another root.
    pub async fn resolve_dir(&self, dir_name: &str) -> CacheResult<PathBuf> {
        let meta = async_fs::metadata(&self.root).await.map_err(|err| {
            CacheError::storage_unavailable(&self.root, format!("storage root not available: {err}"))
        })?;
        if !meta.is_dir() {
            return Err(CacheError::storage_unavailable(
                &self.root,
                "storage root is not a directory",
            ));
        }

        let dir = self.root.join(dir_name);
        async_fs::create_dir_all(&dir).await.map_err(|err| {
            CacheError::storage_unavailable(&dir, format!("failed to create cache dir: {err}"))
        })?;
        let dir_meta = async_fs::metadata(&dir).await.map_err(|err| {
            CacheError::storage_unavailable(&dir, format!("cache dir not accessible: {err}"))
        })?;
        if dir_meta.permissions().readonly() {
            return Err(CacheError::storage_unavailable(&dir, "cache dir is read-only"));
        }
        Ok(dir)
    }

    /// Writes `bytes` to `dir/name` through a temp sibling and a rename.
    pub async fn write_atomic(
        dir: &Path,
        name: &str,
        bytes: &[u8],
        max_bytes: u64,
    ) -> CacheResult<CacheEntry> {
        let mut writer = AtomicFileWriter::create(dir, max_bytes).await?;
        if let Err(err) = writer.write_all(bytes).await {
            writer.discard().await;
            return Err(CacheError::io("write", dir.join(name), err));
        }
        Self::finish_write(writer, dir, name).await
    }

    /// Streams `reader` to `dir/name` through a temp sibling and a rename.
    /// A source longer than `max_bytes` fails with a `FileTooLarge` I/O error
    /// and leaves nothing behind.
    pub async fn write_atomic_stream<R>(
        dir: &Path,
        name: &str,
        reader: &mut R,
        max_bytes: u64,
    ) -> CacheResult<CacheEntry>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let writer = Self::stage_stream(dir, name, reader, max_bytes).await?;
        Self::finish_write(writer, dir, name).await
    }

    /// First half of [`FileStore::write_atomic_stream`]: copies `reader` into
    /// a temp file in `dir` and hands back the unfinished writer.
    pub(crate) async fn stage_stream<R>(
        dir: &Path,
        name: &str,
        reader: &mut R,
        max_bytes: u64,
    ) -> CacheResult<AtomicFileWriter>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut writer = AtomicFileWriter::create(dir, max_bytes).await?;
        if let Err(err) = tokio::io::copy(reader, &mut writer).await {
            let exceeded = writer.exceeded();
            writer.discard().await;
            let err = if exceeded {
                std::io::Error::new(ErrorKind::FileTooLarge, err.to_string())
            } else {
                err
            };
            return Err(CacheError::io("write", dir.join(name), err));
        }
        Ok(writer)
    }

    /// Second half: renames a staged writer to `dir/name`.
    pub(crate) async fn finish_write(
        writer: AtomicFileWriter,
        dir: &Path,
        name: &str,
    ) -> CacheResult<CacheEntry> {
        let final_path = dir.join(name);
        let size_bytes = writer.finish(&final_path).await?;
        let modified = async_fs::metadata(&final_path)
            .await
            .and_then(|meta| meta.modified())
            .unwrap_or_else(|_| SystemTime::now());
        Ok(CacheEntry {
            path: final_path,
            size_bytes,
            modified,
        })
    }

    /// Lists regular files in `dir`, skipping in-flight temp files. A missing
    /// directory lists as empty; files that vanish mid-scan are skipped.
    pub async fn list_entries(dir: &Path) -> CacheResult<Vec<CacheEntry>> {
        let mut read_dir = match async_fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io("list", dir, err)),
        };

        let mut entries = Vec::new();
        loop {
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(CacheError::io("list", dir, err)),
            };
            let name = entry.file_name();
            if is_temp_file_name(&name.to_string_lossy()) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(CacheError::io("stat", entry.path(), err)),
            };
            if !meta.is_file() {
                continue;
            }
            entries.push(CacheEntry {
                path: entry.path(),
                size_bytes: meta.len(),
                modified: meta.modified().unwrap_or_else(|_| SystemTime::now()),
            });
        }
        Ok(entries)
    }

    /// Removes `path`. A path that is already gone counts as success and
    /// returns `false`.
    pub async fn delete(path: &Path) -> CacheResult<bool> {
        match async_fs::remove_file(path).await {
            Ok(()) => {
                trace!(path = %path.display(), "deleted cache file");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CacheError::io("delete", path, err)),
        }
    }

    /// Removes `tmp_` files left behind by writers that never finished.
    pub async fn remove_temp_files(dir: &Path) -> CacheResult<usize> {
        let mut read_dir = match async_fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(CacheError::io("list", dir, err)),
        };

        let mut removed = 0;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|err| CacheError::io("list", dir, err))?
        {
            if !is_temp_file_name(&entry.file_name().to_string_lossy()) {
                continue;
            }
            match Self::delete(&entry.path()).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "failed to remove stale temp file"),
            }
        }
        if removed > 0 {
            debug!(dir = %dir.display(), removed, "removed stale temp files");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    #[tokio::test]
    async fn resolve_dir_creates_category_dir() -> Result<()> {
        let root = TempDir::new()?;
        let store = FileStore::new(root.path());
        let dir = store.resolve_dir("music_cache").await?;
        assert_eq!(dir, root.path().join("music_cache"));
        assert!(dir.is_dir());
        // Deterministic on repeat calls.
        assert_eq!(store.resolve_dir("music_cache").await?, dir);
        Ok(())
    }

    #[tokio::test]
    async fn resolve_dir_fails_when_root_missing() -> Result<()> {
        let root = TempDir::new()?;
        let store = FileStore::new(root.path().join("unmounted"));
        let err = store.resolve_dir("music_cache").await.unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable { .. }));
        assert!(!root.path().join("unmounted").exists());
        Ok(())
    }

    #[tokio::test]
    async fn resolve_dir_fails_when_root_is_a_file() -> Result<()> {
        let root = TempDir::new()?;
        let file_root = root.path().join("volume");
        std::fs::write(&file_root, b"x")?;
        let err = FileStore::new(&file_root)
            .resolve_dir("temp")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn list_skips_temp_files_and_directories() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("music_a.mp3"), b"abc")?;
        std::fs::write(dir.path().join("tmp_inflight"), b"partial")?;
        std::fs::create_dir(dir.path().join("nested"))?;

        let entries = FileStore::list_entries(dir.path()).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, dir.path().join("music_a.mp3"));
        assert_eq!(entries[0].size_bytes, 3);
        Ok(())
    }

    #[tokio::test]
    async fn list_of_missing_dir_is_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let entries = FileStore::list_entries(&dir.path().join("gone")).await?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("thumb_a.jpg");
        std::fs::write(&path, b"jpeg")?;

        assert!(FileStore::delete(&path).await?);
        assert!(!FileStore::delete(&path).await?);
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_reports_entry() -> Result<()> {
        let dir = TempDir::new()?;
        let entry = FileStore::write_atomic(dir.path(), "temp_a.bin", b"12345", 1024).await?;
        assert_eq!(entry.path, dir.path().join("temp_a.bin"));
        assert_eq!(entry.size_bytes, 5);
        assert_eq!(std::fs::read(&entry.path)?, b"12345");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_stream_leaves_nothing_behind() -> Result<()> {
        let dir = TempDir::new()?;
        let mut source: &[u8] = &[7u8; 64];
        let err = FileStore::write_atomic_stream(dir.path(), "music_b.mp3", &mut source, 16)
            .await
            .unwrap_err();
        match err {
            CacheError::Io { source, .. } => assert_eq!(source.kind(), ErrorKind::FileTooLarge),
            other => panic!("unexpected error: {other}"),
        }
        // Temp cleanup is synchronous on the error path.
        let mut read_dir = std::fs::read_dir(dir.path())?;
        assert!(read_dir.next().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn remove_temp_files_keeps_committed_files() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("tmp_1"), b"a")?;
        std::fs::write(dir.path().join("tmp_2"), b"b")?;
        std::fs::write(dir.path().join("music_a.mp3"), b"c")?;

        assert_eq!(FileStore::remove_temp_files(dir.path()).await?, 2);
        assert!(dir.path().join("music_a.mp3").exists());
        assert!(!dir.path().join("tmp_1").exists());
        Ok(())
    }
}
