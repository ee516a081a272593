use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info};

use crate::cache::{CacheCoordinator, CacheKey, CategoryKind};
use crate::error::CacheError;
use crate::io_util::{DownloadProgress, ProgressReader};
use crate::settings::Settings;

pub type ResourceBody = Pin<Box<dyn AsyncRead + Send>>;

/// A fetched but not yet consumed resource.
pub struct FetchedResource {
    pub content_length: Option<u64>,
    pub body: ResourceBody,
}

impl fmt::Debug for FetchedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedResource")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// The network side of a download. Errors here are the caller's errors:
/// the cache only decides where the bytes end up.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedResource>;
}

#[derive(Debug)]
pub enum DownloadOutcome {
    /// Already cached; nothing was fetched.
    Hit(PathBuf),
    /// Fetched and committed to the cache.
    Stored { path: PathBuf, bytes: u64 },
    /// The cache declined the item. The resource is untouched so the caller
    /// can stream it directly.
    Bypassed {
        reason: CacheError,
        resource: FetchedResource,
    },
    /// Writing to the cache failed after the body was consumed.
    Uncached { reason: CacheError },
}

impl DownloadOutcome {
    pub fn cached_path(&self) -> Option<&Path> {
        match self {
            DownloadOutcome::Hit(path) | DownloadOutcome::Stored { path, .. } => Some(path),
            DownloadOutcome::Bypassed { .. } | DownloadOutcome::Uncached { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DownloadOutcome::Hit(_) => "hit",
            DownloadOutcome::Stored { .. } => "stored",
            DownloadOutcome::Bypassed { .. } => "bypassed",
            DownloadOutcome::Uncached { .. } => "uncached",
        }
    }
}

/// Fetches resources into cache categories through admission control.
///
/// At most `download_concurrency` downloads run at once; the rest wait for
/// a permit.
pub struct Downloader {
    coordinator: CacheCoordinator,
    fetcher: Arc<dyn ResourceFetcher>,
    permits: Arc<Semaphore>,
    default_size_hint: u64,
}

impl Downloader {
    pub fn new(
        coordinator: CacheCoordinator,
        fetcher: Arc<dyn ResourceFetcher>,
        settings: &Settings,
    ) -> Self {
        Self::with_limits(
            coordinator,
            fetcher,
            settings.download_concurrency,
            settings.default_size_hint,
        )
    }

    pub fn with_limits(
        coordinator: CacheCoordinator,
        fetcher: Arc<dyn ResourceFetcher>,
        concurrency: usize,
        default_size_hint: u64,
    ) -> Self {
        Self {
            coordinator,
            fetcher,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            default_size_hint,
        }
    }

    pub async fn download(&self, category: CategoryKind, url: &str) -> Result<DownloadOutcome> {
        self.download_with_progress(category, url, None).await
    }

    pub async fn download_with_progress(
        &self,
        kind: CategoryKind,
        url: &str,
        progress: Option<watch::Sender<DownloadProgress>>,
    ) -> Result<DownloadOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("download pool closed")?;
        let outcome = self.run(kind, url, progress).await?;
        crate::metrics::record_download(kind.as_str(), outcome.label());
        Ok(outcome)
    }

    async fn run(
        &self,
        kind: CategoryKind,
        url: &str,
        progress: Option<watch::Sender<DownloadProgress>>,
    ) -> Result<DownloadOutcome> {
        let Some(category) = self.coordinator.category(kind) else {
            let resource = self.fetch(url).await?;
            return Ok(DownloadOutcome::Bypassed {
                reason: CacheError::storage_unavailable(
                    kind.default_dir_name(),
                    "cache category is not available",
                ),
                resource,
            });
        };

        if let Some(path) = category.lookup(url).await {
            debug!(category = %kind, path = %path.display(), "download served from cache");
            return Ok(DownloadOutcome::Hit(path));
        }

        let resource = self.fetch(url).await?;
        let estimated = resource.content_length.unwrap_or(self.default_size_hint);
        let admission = match category.admit(estimated).await {
            Ok(admission) => admission,
            Err(reason) => {
                info!(category = %kind, error = %reason, "download not cached");
                return Ok(DownloadOutcome::Bypassed { reason, resource });
            }
        };

        let key = CacheKey::new(kind, url);
        let FetchedResource {
            content_length,
            body,
        } = resource;
        let mut reader = ProgressReader::new(body, content_length, progress);
        match admission.commit_stream(&key, &mut reader).await {
            Ok(entry) => Ok(DownloadOutcome::Stored {
                path: entry.path,
                bytes: entry.size_bytes,
            }),
            Err(reason) => {
                info!(
                    category = %kind,
                    error = %reason,
                    received = reader.received(),
                    "download consumed but not cached"
                );
                Ok(DownloadOutcome::Uncached { reason })
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<FetchedResource> {
        self.fetcher
            .fetch(url)
            .await
            .with_context(|| format!("failed to fetch {url}"))
    }
}

/// Fetches `file://` URLs or bare paths from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileFetcher;

#[async_trait]
impl ResourceFetcher for LocalFileFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResource> {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let meta = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(FetchedResource {
            content_length: Some(meta.len()),
            body: Box::pin(file),
        })
    }
}
