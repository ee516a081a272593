use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub received: u64,
    /// Expected length when the source announced one.
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Whole percent complete, when the total is known.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total?;
        if total == 0 {
            return Some(100);
        }
        Some((self.received.min(total) * 100 / total) as u8)
    }
}

/// Passes reads through unchanged and publishes the running byte count.
pub struct ProgressReader<R> {
    inner: R,
    progress: DownloadProgress,
    tx: Option<watch::Sender<DownloadProgress>>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: Option<u64>, tx: Option<watch::Sender<DownloadProgress>>) -> Self {
        let progress = DownloadProgress { received: 0, total };
        if let Some(tx) = &tx {
            tx.send_replace(progress);
        }
        Self {
            inner,
            progress,
            tx,
        }
    }

    pub fn received(&self) -> u64 {
        self.progress.received
    }
}

impl<R> AsyncRead for ProgressReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                self.progress.received = self.progress.received.saturating_add(read);
                let progress = self.progress;
                if let Some(tx) = &self.tx {
                    // No receivers left is fine; keep reading.
                    tx.send_replace(progress);
                }
            }
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn reports_running_total() {
        let (tx, rx) = watch::channel(DownloadProgress::default());
        let source: &[u8] = b"0123456789";
        let mut reader = ProgressReader::new(source, Some(10), Some(tx));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"0123456789");
        assert_eq!(reader.received(), 10);
        let last = *rx.borrow();
        assert_eq!(last.received, 10);
        assert_eq!(last.percent(), Some(100));
    }

    #[test]
    fn percent_needs_total() {
        let progress = DownloadProgress {
            received: 5,
            total: None,
        };
        assert_eq!(progress.percent(), None);
        let progress = DownloadProgress {
            received: 5,
            total: Some(20),
        };
        assert_eq!(progress.percent(), Some(25));
    }
}
