use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs as async_fs;
use tokio::io::AsyncRead;
use tracing::{debug, info, trace, warn};

use super::policy::{Eviction, EvictionReason, select_for_eviction};
use super::store::FileStore;
use super::{CacheBudget, CacheEntry, CacheKey, CategoryKind, ItemCleanupResult, Usage};
use crate::error::{CacheError, CacheResult};

/// Candidate storage roots in preference order: an optional primary volume
/// (external storage) and an always-present fallback (internal storage).
#[derive(Debug, Clone)]
pub struct StorageRoots {
    pub primary: Option<PathBuf>,
    pub fallback: PathBuf,
}

impl StorageRoots {
    pub fn single(root: impl Into<PathBuf>) -> Self {
        Self {
            primary: None,
            fallback: root.into(),
        }
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Path> {
        self.primary
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.fallback.as_path()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryState {
    Idle,
    Sweeping,
}

#[derive(Debug, Default)]
struct Reserved {
    bytes: u64,
    files: usize,
}

/// One governed cache domain: a directory plus the budget enforced on it.
///
/// Admission and eviction are serialized by a per-category async lock. Bytes
/// reserved by admitted but uncommitted writes are kept out of the budget
/// that eviction works against, so a sweep can never delete room that was
/// already promised to a writer.
#[derive(Debug)]
pub struct CacheCategory {
    kind: CategoryKind,
    dir: PathBuf,
    budget: CacheBudget,
    lock: tokio::sync::Mutex<()>,
    reserved: Mutex<Reserved>,
    sweeping: AtomicBool,
}

impl CacheCategory {
    /// Resolves the category directory under the first usable root and
    /// removes temp files left behind by an earlier process.
    pub async fn open(
        kind: CategoryKind,
        roots: &StorageRoots,
        dir_name: &str,
        budget: CacheBudget,
    ) -> CacheResult<Arc<Self>> {
        let mut last_err = None;
        for root in roots.candidates() {
            match FileStore::new(root).resolve_dir(dir_name).await {
                Ok(dir) => {
                    if let Err(err) = FileStore::remove_temp_files(&dir).await {
                        warn!(category = %kind, error = %err, "failed to clean stale temp files");
                    }
                    debug!(category = %kind, dir = %dir.display(), "cache category opened");
                    return Ok(Arc::new(Self::with_dir(kind, dir, budget)));
                }
                Err(err) => {
                    warn!(
                        category = %kind,
                        root = %root.display(),
                        error = %err,
                        "storage root unavailable; trying next"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CacheError::storage_unavailable(&roots.fallback, "no storage root configured")
        }))
    }

    fn with_dir(kind: CategoryKind, dir: PathBuf, budget: CacheBudget) -> Self {
        Self {
            kind,
            dir,
            budget,
            lock: tokio::sync::Mutex::new(()),
            reserved: Mutex::new(Reserved::default()),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> CategoryKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn budget(&self) -> &CacheBudget {
        &self.budget
    }

    pub fn state(&self) -> CategoryState {
        if self.sweeping.load(Ordering::Acquire) {
            CategoryState::Sweeping
        } else {
            CategoryState::Idle
        }
    }

    pub fn path_for(&self, source: &str) -> PathBuf {
        self.dir.join(CacheKey::new(self.kind, source).file_name())
    }

    /// Path of the cached item for `source`, if one is on disk and non-empty.
    pub async fn lookup(&self, source: &str) -> Option<PathBuf> {
        let path = self.path_for(source);
        match async_fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            Ok(_) => None,
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!(category = %self.kind, path = %path.display(), error = %err, "cache lookup failed");
                None
            }
        }
    }

    pub async fn current_usage(&self) -> CacheResult<Usage> {
        let usage = Usage::of(&FileStore::list_entries(&self.dir).await?);
        crate::metrics::set_usage(self.kind.as_str(), usage.total_bytes, usage.file_count);
        Ok(usage)
    }

    /// Reserves room for an item of `estimated_bytes`, evicting first when
    /// the category would otherwise go over budget.
    pub async fn admit(self: &Arc<Self>, estimated_bytes: u64) -> CacheResult<Admission> {
        let budget = self.budget;
        let ceiling = budget.max_file_bytes.min(budget.max_total_bytes);
        if estimated_bytes > ceiling {
            return Err(self.deny(estimated_bytes, ceiling));
        }

        let _guard = self.lock.lock().await;
        let (reserved_bytes, reserved_files) = self.reserved();
        let needed_bytes = reserved_bytes.saturating_add(estimated_bytes);
        let needed_files = reserved_files + 1;
        let fits = |usage: &Usage| {
            usage.total_bytes.saturating_add(needed_bytes) <= budget.max_total_bytes
                && usage.file_count + needed_files <= budget.max_file_count
        };

        let entries = FileStore::list_entries(&self.dir).await?;
        let mut usage = Usage::of(&entries);
        // Reservations alone exceed the budget, so no eviction can fit this item.
        if needed_bytes > budget.max_total_bytes || needed_files > budget.max_file_count {
            let available = budget
                .max_total_bytes
                .saturating_sub(usage.total_bytes.saturating_add(reserved_bytes));
            return Err(self.deny(estimated_bytes, available));
        }
        let mut evicted = ItemCleanupResult::empty(self.kind);
        if !fits(&usage) {
            let room = budget.excluding(needed_bytes, needed_files);
            let selected = select_for_eviction(&entries, &room, SystemTime::now());
            evicted = self.delete_selected(selected).await;
            usage = Usage::of(&FileStore::list_entries(&self.dir).await?);
        }

        if !fits(&usage) {
            let available = budget
                .max_total_bytes
                .saturating_sub(usage.total_bytes.saturating_add(reserved_bytes));
            return Err(self.deny(estimated_bytes, available));
        }

        {
            let mut reserved = self.reserved.lock();
            reserved.bytes = reserved.bytes.saturating_add(estimated_bytes);
            reserved.files += 1;
        }
        crate::metrics::record_admission(self.kind.as_str(), true);
        trace!(
            category = %self.kind,
            estimated_bytes,
            evicted = evicted.deleted_count,
            "cache admission granted"
        );
        Ok(Admission {
            category: Arc::clone(self),
            reserved_bytes: estimated_bytes,
            released: false,
            evicted,
        })
    }

    fn deny(&self, requested: u64, available: u64) -> CacheError {
        crate::metrics::record_admission(self.kind.as_str(), false);
        debug!(category = %self.kind, requested, available, "cache admission denied");
        CacheError::CacheFull {
            category: self.kind,
            requested,
            available,
        }
    }

    fn reserved(&self) -> (u64, usize) {
        let reserved = self.reserved.lock();
        (reserved.bytes, reserved.files)
    }

    fn release(&self, bytes: u64) {
        let mut reserved = self.reserved.lock();
        reserved.bytes = reserved.bytes.saturating_sub(bytes);
        reserved.files = reserved.files.saturating_sub(1);
    }

    /// Bookkeeping for a committed file. State lives on disk; this only feeds
    /// metrics and logs.
    pub fn record_write(&self, path: &Path, size_bytes: u64) {
        crate::metrics::record_store(self.kind.as_str(), size_bytes);
        trace!(category = %self.kind, path = %path.display(), size_bytes, "cache file recorded");
    }

    pub async fn evict_to_budget(&self) -> ItemCleanupResult {
        self.evict_with_budget(self.budget).await
    }

    /// Evicts against `budget` instead of the configured one. Used for
    /// tightened emergency passes.
    pub async fn evict_with_budget(&self, budget: CacheBudget) -> ItemCleanupResult {
        let _guard = self.lock.lock().await;
        let _sweeping = SweepingGuard::enter(&self.sweeping);

        let entries = match FileStore::list_entries(&self.dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(category = %self.kind, error = %err, "failed to list cache dir");
                crate::metrics::record_cache_error(self.kind.as_str(), err.kind());
                return ItemCleanupResult::failed(self.kind, err);
            }
        };

        let (reserved_bytes, reserved_files) = self.reserved();
        let effective = budget.excluding(reserved_bytes, reserved_files);
        let selected = select_for_eviction(&entries, &effective, SystemTime::now());
        let result = self.delete_selected(selected).await;
        self.publish_usage(&entries, &result);
        result
    }

    /// Deletes every committed file in the category.
    pub async fn purge(&self) -> ItemCleanupResult {
        let _guard = self.lock.lock().await;
        let _sweeping = SweepingGuard::enter(&self.sweeping);

        let entries = match FileStore::list_entries(&self.dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(category = %self.kind, error = %err, "failed to list cache dir");
                crate::metrics::record_cache_error(self.kind.as_str(), err.kind());
                return ItemCleanupResult::failed(self.kind, err);
            }
        };
        let selected = entries
            .iter()
            .map(|entry| Eviction {
                path: entry.path.clone(),
                size_bytes: entry.size_bytes,
                reason: EvictionReason::Purged,
            })
            .collect();
        let result = self.delete_selected(selected).await;
        self.publish_usage(&entries, &result);
        info!(
            category = %self.kind,
            deleted = result.deleted_count,
            cleaned_bytes = result.cleaned_bytes,
            "cache category purged"
        );
        result
    }

    async fn delete_selected(&self, selected: Vec<Eviction>) -> ItemCleanupResult {
        let mut result = ItemCleanupResult::empty(self.kind);
        for eviction in selected {
            match FileStore::delete(&eviction.path).await {
                Ok(true) => {
                    result.cleaned_bytes = result.cleaned_bytes.saturating_add(eviction.size_bytes);
                    result.deleted_count += 1;
                    if eviction.reason == EvictionReason::Expired {
                        result.expired_count += 1;
                    }
                    crate::metrics::record_eviction(
                        self.kind.as_str(),
                        eviction.reason.as_str(),
                        eviction.size_bytes,
                    );
                }
                // Someone else removed it first.
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        category = %self.kind,
                        error = %err,
                        "failed to delete cache file"
                    );
                    crate::metrics::record_cache_error(self.kind.as_str(), err.kind());
                    if result.error.is_none() {
                        result.error = Some(err.to_string());
                    }
                }
            }
        }
        result
    }

    fn publish_usage(&self, before: &[CacheEntry], result: &ItemCleanupResult) {
        let usage = Usage::of(before);
        crate::metrics::set_usage(
            self.kind.as_str(),
            usage.total_bytes.saturating_sub(result.cleaned_bytes),
            usage.file_count.saturating_sub(result.deleted_count),
        );
    }
}

struct SweepingGuard<'a>(&'a AtomicBool);

impl<'a> SweepingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for SweepingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Room reserved in a category for one item. Commit it to write the file;
/// drop it to give the room back.
#[derive(Debug)]
pub struct Admission {
    category: Arc<CacheCategory>,
    reserved_bytes: u64,
    released: bool,
    evicted: ItemCleanupResult,
}

impl Admission {
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    /// Files deleted to make room for this admission.
    pub fn evicted(&self) -> &ItemCleanupResult {
        &self.evicted
    }

    pub fn category(&self) -> CategoryKind {
        self.category.kind
    }

    pub async fn commit(self, key: &CacheKey, bytes: &[u8]) -> CacheResult<CacheEntry> {
        let mut reader = bytes;
        self.commit_stream(key, &mut reader).await
    }

    /// Streams `reader` into a temp file without holding the category lock,
    /// then renames it into place and releases the reservation under the lock.
    pub async fn commit_stream<R>(mut self, key: &CacheKey, reader: &mut R) -> CacheResult<CacheEntry>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let category = Arc::clone(&self.category);
        let name = key.file_name();
        let max_bytes = category
            .budget
            .max_file_bytes
            .min(category.budget.max_total_bytes);

        let staged = FileStore::stage_stream(&category.dir, name, reader, max_bytes).await;
        let writer = match staged {
            Ok(writer) => writer,
            Err(err) => {
                crate::metrics::record_cache_error(category.kind.as_str(), err.kind());
                return Err(err);
            }
        };

        let _guard = category.lock.lock().await;
        let committed = FileStore::finish_write(writer, &category.dir, name).await;
        self.release();
        match committed {
            Ok(entry) => {
                category.record_write(&entry.path, entry.size_bytes);
                Ok(entry)
            }
            Err(err) => {
                crate::metrics::record_cache_error(category.kind.as_str(), err.kind());
                Err(err)
            }
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.category.release(self.reserved_bytes);
            self.released = true;
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.release();
    }
}
