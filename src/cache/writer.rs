use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{CacheError, CacheResult};

/// Prefix of in-flight files. Listings never report them.
pub(crate) const TEMP_FILE_PREFIX: &str = "tmp_";

pub(crate) fn is_temp_file_name(name: &str) -> bool {
    name.starts_with(TEMP_FILE_PREFIX)
}

/// Writes into a `tmp_` sibling and only becomes visible under its final name
/// once [`AtomicFileWriter::finish`] renames it. Dropping an unfinished writer
/// removes the temp file.
pub(crate) struct AtomicFileWriter {
    file: AsyncFile,
    temp_path: PathBuf,
    max_bytes: u64,
    written: u64,
    exceeded: bool,
    finished: bool,
}

impl AtomicFileWriter {
    pub(crate) async fn create(dir: &Path, max_bytes: u64) -> CacheResult<Self> {
        let temp_path = dir.join(format!("{TEMP_FILE_PREFIX}{}", uuid::Uuid::new_v4()));

        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options
            .open(&temp_path)
            .await
            .map_err(|err| CacheError::io("create", &temp_path, err))?;

        Ok(Self {
            file,
            temp_path,
            max_bytes,
            written: 0,
            exceeded: false,
            finished: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    /// True once a write was refused for crossing `max_bytes`.
    pub(crate) fn exceeded(&self) -> bool {
        self.exceeded
    }

    #[cfg(test)]
    pub(crate) fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Flushes and renames the temp file to `final_path`, returning the number
    /// of bytes written. On failure the temp file is removed.
    pub(crate) async fn finish(mut self, final_path: &Path) -> CacheResult<u64> {
        if let Err(err) = self.file.flush().await {
            self.discard().await;
            return Err(CacheError::io("flush", &self.temp_path, err));
        }
        if let Err(err) = async_fs::rename(&self.temp_path, final_path).await {
            self.discard().await;
            return Err(CacheError::io("rename", final_path, err));
        }
        self.finished = true;
        trace!(path = %final_path.display(), bytes = self.written, "committed cache file");
        Ok(self.written)
    }

    pub(crate) async fn discard(&mut self) {
        let _ = async_fs::remove_file(&self.temp_path).await;
        self.finished = true;
    }
}

impl AsyncWrite for AtomicFileWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Refuse before writing so an oversized item never lands partially.
        if self.written.saturating_add(buf.len() as u64) > self.max_bytes {
            self.exceeded = true;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::FileTooLarge,
                format!("cache item exceeds {} bytes", self.max_bytes),
            )));
        }

        match Pin::new(&mut self.file).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                self.written = self.written.saturating_add(written as u64);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let temp_path = self.temp_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(temp_path).await;
            });
        } else {
            let _ = std::fs::remove_file(&temp_path);
        }
    }
}
