use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::category::{CacheCategory, CategoryState, StorageRoots};
use super::maintenance::{Job, spawn_scheduler_task, spawn_sweep_worker};
use super::{CacheBudget, CategoryKind, ItemCleanupResult};
use crate::error::{CacheError, CacheResult};
use crate::logging::CleanupLogBuilder;
use crate::settings::Settings;
use crate::state::SweepSchedule;
use crate::util::{epoch_millis, timeout_with_context};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    Scheduled,
    LowMemory,
    Manual,
    StartupCritical,
}

impl SweepTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepTrigger::Scheduled => "scheduled",
            SweepTrigger::LowMemory => "low_memory",
            SweepTrigger::Manual => "manual",
            SweepTrigger::StartupCritical => "startup_critical",
        }
    }

    /// Emergency triggers bypass the interval check and may tighten budgets.
    pub fn is_emergency(self) -> bool {
        matches!(self, SweepTrigger::LowMemory | SweepTrigger::StartupCritical)
    }
}

impl fmt::Display for SweepTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image loading library cache the coordinator supervises but does not own.
pub trait ImageCache: Send + Sync {
    fn clear_memory(&self);
    fn clear_disk(&self);
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub trigger: SweepTrigger,
    /// Set for a forced purge rather than a budget sweep.
    pub purged: bool,
    /// Set when a scheduled sweep found the interval had not elapsed.
    pub skipped: bool,
    pub categories: Vec<ItemCleanupResult>,
    pub total_cleaned_bytes: u64,
    pub total_deleted_count: usize,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl CleanupResult {
    fn new(trigger: SweepTrigger, categories: Vec<ItemCleanupResult>, duration: Duration) -> Self {
        let total_cleaned_bytes = categories.iter().map(|c| c.cleaned_bytes).sum();
        let total_deleted_count = categories.iter().map(|c| c.deleted_count).sum();
        Self {
            trigger,
            purged: false,
            skipped: false,
            categories,
            total_cleaned_bytes,
            total_deleted_count,
            duration,
        }
    }

    fn skipped(trigger: SweepTrigger) -> Self {
        Self {
            skipped: true,
            ..Self::new(trigger, Vec::new(), Duration::ZERO)
        }
    }

    pub fn category(&self, kind: CategoryKind) -> Option<&ItemCleanupResult> {
        self.categories.iter().find(|c| c.category == kind)
    }

    pub fn failed_categories(&self) -> impl Iterator<Item = &ItemCleanupResult> {
        self.categories.iter().filter(|c| c.error.is_some())
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub category: CategoryKind,
    pub dir: Option<PathBuf>,
    pub usage_bytes: u64,
    pub file_count: usize,
    pub budget: CacheBudget,
    pub state: CategoryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub categories: Vec<CategoryStats>,
    pub total_bytes: u64,
    pub total_files: usize,
    /// Epoch millis of the last completed sweep.
    pub last_sweep: Option<u64>,
}

/// Knobs for a coordinator, usually derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub emergency_budget_percent: u8,
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            emergency_budget_percent: 100,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Category slot in sweep order. A category whose storage could not be
/// opened keeps the reason so sweeps and stats can report it.
enum Slot {
    Open(Arc<CacheCategory>),
    Unavailable { kind: CategoryKind, budget: CacheBudget, reason: String },
}

impl Slot {
    fn kind(&self) -> CategoryKind {
        match self {
            Slot::Open(category) => category.kind(),
            Slot::Unavailable { kind, .. } => *kind,
        }
    }
}

/// State shared between the coordinator handle and its background tasks.
pub(super) struct SweepEngine {
    slots: Vec<Slot>,
    image_cache: Option<Arc<dyn ImageCache>>,
    schedule: SweepSchedule,
    emergency_budget_percent: u8,
}

impl SweepEngine {
    pub(super) fn should_sweep(&self) -> bool {
        self.schedule.is_due(SystemTime::now())
    }

    pub(super) async fn sweep_all(&self, trigger: SweepTrigger) -> CleanupResult {
        if trigger == SweepTrigger::Scheduled && !self.should_sweep() {
            debug!("scheduled sweep not due; skipping");
            return CleanupResult::skipped(trigger);
        }

        let started = Instant::now();
        let mut categories = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let result = match slot {
                Slot::Open(category) => {
                    let budget = if trigger.is_emergency() {
                        category.budget().tightened(self.emergency_budget_percent)
                    } else {
                        *category.budget()
                    };
                    category.evict_with_budget(budget).await
                }
                Slot::Unavailable { kind, reason, .. } => {
                    ItemCleanupResult::failed(*kind, reason)
                }
            };
            if let Some(error) = &result.error {
                warn!(category = %result.category, error = %error, "category sweep failed");
            }
            categories.push(result);
        }
        if let Some(image_cache) = &self.image_cache {
            image_cache.clear_memory();
        }

        let result = CleanupResult::new(trigger, categories, started.elapsed());
        if let Err(err) = self.schedule.mark_swept(SystemTime::now()).await {
            warn!(error = %err, "failed to persist sweep time");
        }
        crate::metrics::record_sweep(trigger.as_str(), result.duration);
        CleanupLogBuilder::from_result(&result).log();
        result
    }

    pub(super) async fn purge_all(&self) -> CleanupResult {
        let started = Instant::now();
        let mut categories = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            categories.push(match slot {
                Slot::Open(category) => category.purge().await,
                Slot::Unavailable { kind, reason, .. } => ItemCleanupResult::failed(*kind, reason),
            });
        }
        if let Some(image_cache) = &self.image_cache {
            image_cache.clear_memory();
            image_cache.clear_disk();
        }

        let mut result = CleanupResult::new(SweepTrigger::Manual, categories, started.elapsed());
        result.purged = true;
        CleanupLogBuilder::from_result(&result).log();
        result
    }
}

/// Owns every cache category and the single worker that sweeps them.
///
/// Cloning the coordinator is cheap; all clones drive the same worker.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<SweepEngine>,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

/// Handle to a queued sweep. Dropping it abandons the result; the sweep
/// still runs to completion.
#[derive(Debug)]
pub struct SweepTicket {
    reply: oneshot::Receiver<CleanupResult>,
}

impl SweepTicket {
    pub async fn wait(self) -> CacheResult<CleanupResult> {
        self.reply.await.map_err(|_| CacheError::WorkerGone)
    }
}

impl CacheCoordinator {
    /// Opens every category from `settings`, loads the persisted schedule,
    /// and starts the sweep worker. Categories whose storage is unavailable
    /// are kept as unavailable rather than failing construction.
    pub async fn open(settings: &Settings, image_cache: Option<Arc<dyn ImageCache>>) -> Self {
        let roots = settings.storage_roots();
        let mut slots = Vec::with_capacity(CategoryKind::ALL.len());
        for kind in CategoryKind::ALL {
            slots.push(open_slot(kind, &roots, settings.dir_name(kind), settings.budget(kind)).await);
        }
        let mut schedule =
            SweepSchedule::load(settings.state_dir(), settings.sweep_interval()).await;
        if settings.state_dir.is_none() {
            schedule = schedule.existing_dir_only();
        }
        let options = CoordinatorOptions {
            emergency_budget_percent: settings.emergency_budget_percent,
            shutdown_timeout: settings.shutdown_timeout(),
        };
        Self::from_slots(slots, schedule, options, image_cache)
    }

    /// Builds a coordinator over already-open categories. They are swept in
    /// [`CategoryKind::ALL`] order regardless of the order given.
    pub fn new(
        categories: Vec<Arc<CacheCategory>>,
        schedule: SweepSchedule,
        options: CoordinatorOptions,
        image_cache: Option<Arc<dyn ImageCache>>,
    ) -> Self {
        let slots = categories.into_iter().map(Slot::Open).collect();
        Self::from_slots(slots, schedule, options, image_cache)
    }

    fn from_slots(
        mut slots: Vec<Slot>,
        schedule: SweepSchedule,
        options: CoordinatorOptions,
        image_cache: Option<Arc<dyn ImageCache>>,
    ) -> Self {
        slots.sort_by_key(|slot| slot.kind());
        let engine = Arc::new(SweepEngine {
            slots,
            image_cache,
            schedule,
            emergency_budget_percent: options.emergency_budget_percent,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_sweep_worker(engine.clone(), rx);
        Self {
            inner: Arc::new(Inner {
                engine,
                jobs: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
                scheduler: Mutex::new(None),
                shutdown_timeout: options.shutdown_timeout,
            }),
        }
    }

    pub fn category(&self, kind: CategoryKind) -> Option<Arc<CacheCategory>> {
        self.inner.engine.slots.iter().find_map(|slot| match slot {
            Slot::Open(category) if category.kind() == kind => Some(category.clone()),
            _ => None,
        })
    }

    pub fn should_sweep(&self) -> bool {
        self.inner.engine.should_sweep()
    }

    pub fn last_sweep(&self) -> Option<SystemTime> {
        self.inner.engine.schedule.last_sweep()
    }

    /// Queues a sweep on the worker without waiting for it.
    pub fn request_sweep(&self, trigger: SweepTrigger) -> CacheResult<SweepTicket> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Sweep { trigger, reply })?;
        Ok(SweepTicket { reply: rx })
    }

    pub async fn sweep_all(&self, trigger: SweepTrigger) -> CacheResult<CleanupResult> {
        self.request_sweep(trigger)?.wait().await
    }

    /// Deletes every cached file and clears the image cache.
    pub async fn purge_all(&self) -> CacheResult<CleanupResult> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Purge { reply })?;
        rx.await.map_err(|_| CacheError::WorkerGone)
    }

    fn submit(&self, job: Job) -> CacheResult<()> {
        let jobs = self.inner.jobs.lock();
        let sender = jobs.as_ref().ok_or(CacheError::ShutDown)?;
        sender.send(job).map_err(|_| CacheError::ShutDown)
    }

    /// Live usage per category. Reads directories only; never mutates.
    pub async fn stats(&self) -> CacheStats {
        let mut categories = Vec::with_capacity(self.inner.engine.slots.len());
        for slot in &self.inner.engine.slots {
            categories.push(match slot {
                Slot::Open(category) => {
                    let (usage, error) = match category.current_usage().await {
                        Ok(usage) => (usage, None),
                        Err(err) => (Default::default(), Some(err.to_string())),
                    };
                    CategoryStats {
                        category: category.kind(),
                        dir: Some(category.dir().to_path_buf()),
                        usage_bytes: usage.total_bytes,
                        file_count: usage.file_count,
                        budget: *category.budget(),
                        state: category.state(),
                        error,
                    }
                }
                Slot::Unavailable { kind, budget, reason } => CategoryStats {
                    category: *kind,
                    dir: None,
                    usage_bytes: 0,
                    file_count: 0,
                    budget: *budget,
                    state: CategoryState::Idle,
                    error: Some(reason.clone()),
                },
            });
        }
        CacheStats {
            total_bytes: categories.iter().map(|c| c.usage_bytes).sum(),
            total_files: categories.iter().map(|c| c.file_count).sum(),
            last_sweep: self.last_sweep().map(epoch_millis),
            categories,
        }
    }

    /// Runs a startup sweep when one is due. Returns `None` otherwise.
    pub async fn on_startup(&self) -> CacheResult<Option<CleanupResult>> {
        if !self.should_sweep() {
            debug!("startup sweep not due");
            return Ok(None);
        }
        self.sweep_all(SweepTrigger::StartupCritical).await.map(Some)
    }

    pub fn on_low_memory(&self) -> CacheResult<SweepTicket> {
        self.request_sweep(SweepTrigger::LowMemory)
    }

    pub fn on_manual_request(&self) -> CacheResult<SweepTicket> {
        self.request_sweep(SweepTrigger::Manual)
    }

    pub async fn on_shutdown(&self) {
        self.shutdown().await;
    }

    /// Starts a ticker that queues a scheduled sweep whenever one is due.
    /// Replaces any scheduler already running.
    pub fn spawn_scheduler(&self, check_interval: Duration) -> CacheResult<()> {
        let sender = self
            .inner
            .jobs
            .lock()
            .clone()
            .ok_or(CacheError::ShutDown)?;
        if let Some(handle) = spawn_scheduler_task(self.inner.engine.clone(), sender, check_interval)
            && let Some(previous) = self.inner.scheduler.lock().replace(handle)
        {
            previous.abort();
        }
        Ok(())
    }

    /// Stops the scheduler, refuses further requests, and waits up to the
    /// shutdown timeout for queued and running work. The worker is aborted if
    /// it does not finish in time.
    pub async fn shutdown(&self) {
        let scheduler = self.inner.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.abort();
            let _ = scheduler.await;
        }

        // Closing the channel lets the worker drain what is queued and exit.
        drop(self.inner.jobs.lock().take());

        let worker = self.inner.worker.lock().take();
        let Some(mut worker) = worker else {
            return;
        };
        match timeout_with_context(
            self.inner.shutdown_timeout,
            &mut worker,
            "draining cache sweep worker",
        )
        .await
        {
            Ok(()) => info!("cache coordinator shut down"),
            Err(err) => {
                // A worker stuck in a blocking call only observes the abort at
                // its next await, so do not wait for it here.
                warn!(error = %err, "aborting cache sweep worker");
                worker.abort();
            }
        }
    }
}

async fn open_slot(
    kind: CategoryKind,
    roots: &StorageRoots,
    dir_name: &str,
    budget: CacheBudget,
) -> Slot {
    match CacheCategory::open(kind, roots, dir_name, budget).await {
        Ok(category) => Slot::Open(category),
        Err(err) => {
            warn!(category = %kind, error = %err, "cache category unavailable; caching disabled");
            crate::metrics::record_cache_error(kind.as_str(), err.kind());
            Slot::Unavailable {
                kind,
                budget,
                reason: err.to_string(),
            }
        }
    }
}

impl CacheStats {
    pub fn by_category(&self) -> BTreeMap<CategoryKind, &CategoryStats> {
        self.categories.iter().map(|c| (c.category, c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingImageCache {
        memory: AtomicUsize,
        disk: AtomicUsize,
    }

    impl ImageCache for CountingImageCache {
        fn clear_memory(&self) {
            self.memory.fetch_add(1, Ordering::SeqCst);
        }

        fn clear_disk(&self) {
            self.disk.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn coordinator(
        root: &TempDir,
        image_cache: Option<Arc<dyn ImageCache>>,
    ) -> CacheCoordinator {
        let mut settings = Settings::with_root(root.path());
        settings.state_dir = Some(root.path().join("state"));
        CacheCoordinator::open(&settings, image_cache).await
    }

    #[test]
    fn emergency_triggers() {
        assert!(SweepTrigger::LowMemory.is_emergency());
        assert!(SweepTrigger::StartupCritical.is_emergency());
        assert!(!SweepTrigger::Manual.is_emergency());
        assert!(!SweepTrigger::Scheduled.is_emergency());
    }

    #[tokio::test]
    async fn sweep_visits_categories_in_order_and_clears_image_memory() -> Result<()> {
        let root = TempDir::new()?;
        let images = Arc::new(CountingImageCache::default());
        let coordinator = coordinator(&root, Some(images.clone())).await;

        let result = coordinator.sweep_all(SweepTrigger::Manual).await?;
        let order: Vec<_> = result.categories.iter().map(|c| c.category).collect();
        assert_eq!(order, CategoryKind::ALL);
        assert_eq!(result.total_deleted_count, 0);
        assert_eq!(images.memory.load(Ordering::SeqCst), 1);
        assert_eq!(images.disk.load(Ordering::SeqCst), 0);
        assert!(coordinator.last_sweep().is_some());
        assert!(!coordinator.should_sweep());

        coordinator.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn scheduled_sweep_skips_when_not_due() -> Result<()> {
        let root = TempDir::new()?;
        let coordinator = coordinator(&root, None).await;

        let first = coordinator.sweep_all(SweepTrigger::Scheduled).await?;
        assert!(!first.skipped);
        let second = coordinator.sweep_all(SweepTrigger::Scheduled).await?;
        assert!(second.skipped);
        assert!(second.categories.is_empty());

        coordinator.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn purge_clears_image_disk_too() -> Result<()> {
        let root = TempDir::new()?;
        let images = Arc::new(CountingImageCache::default());
        let coordinator = coordinator(&root, Some(images.clone())).await;

        let result = coordinator.purge_all().await?;
        assert!(result.purged);
        assert_eq!(images.memory.load(Ordering::SeqCst), 1);
        assert_eq!(images.disk.load(Ordering::SeqCst), 1);

        coordinator.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_refused() -> Result<()> {
        let root = TempDir::new()?;
        let coordinator = coordinator(&root, None).await;
        coordinator.shutdown().await;

        let err = coordinator.request_sweep(SweepTrigger::Manual).unwrap_err();
        assert!(matches!(err, CacheError::ShutDown));
        assert!(matches!(
            coordinator.spawn_scheduler(Duration::from_secs(1)),
            Err(CacheError::ShutDown)
        ));
        // A second shutdown is a no-op.
        coordinator.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_category_is_reported_not_fatal() -> Result<()> {
        let root = TempDir::new()?;
        let mut settings = Settings::with_root(root.path().join("unmounted"));
        settings.state_dir = Some(root.path().join("state"));
        let coordinator = CacheCoordinator::open(&settings, None).await;

        assert!(coordinator.category(CategoryKind::Music).is_none());
        let result = coordinator.sweep_all(SweepTrigger::Manual).await?;
        assert_eq!(result.failed_categories().count(), 3);

        let stats = coordinator.stats().await;
        assert!(stats.categories.iter().all(|c| c.error.is_some()));
        coordinator.shutdown().await;
        Ok(())
    }

    #[test]
    fn cleanup_result_serializes_duration_in_millis() {
        let result = CleanupResult::new(
            SweepTrigger::LowMemory,
            vec![ItemCleanupResult::empty(CategoryKind::Temp)],
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["trigger"], "low_memory");
        assert_eq!(json["categories"][0]["category"], "temp");
    }
}
