use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::fs as async_fs;
use tracing::{debug, warn};

use crate::cache::FileStore;
use crate::error::{CacheError, CacheResult};
use crate::util::{epoch_millis, from_epoch_millis};

pub const STATE_FILE_NAME: &str = "cache_state.json";
const LAST_CLEANUP_KEY: &str = "last_cleanup_time";

/// Sweep cadence that survives restarts.
///
/// The timestamp lives in a small JSON key-value file next to other
/// process-local settings; unknown keys in that file are preserved.
#[derive(Debug)]
pub struct SweepSchedule {
    state_dir: Option<PathBuf>,
    create_dir: bool,
    interval: Duration,
    last_sweep: Mutex<Option<SystemTime>>,
}

impl SweepSchedule {
    /// Reads the last sweep time from `<state_dir>/cache_state.json`. A
    /// missing or unreadable file means the cache has never been swept.
    pub async fn load(state_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        let state_dir = state_dir.into();
        let path = state_dir.join(STATE_FILE_NAME);
        let last_sweep = match read_state(&path).await {
            Ok(map) => map
                .get(LAST_CLEANUP_KEY)
                .and_then(Value::as_u64)
                .map(from_epoch_millis),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable cache state");
                None
            }
        };
        debug!(
            path = %path.display(),
            last_sweep_ms = last_sweep.map(epoch_millis),
            "sweep schedule loaded"
        );
        Self {
            state_dir: Some(state_dir),
            create_dir: true,
            interval,
            last_sweep: Mutex::new(last_sweep),
        }
    }

    /// A schedule that is never written to disk.
    pub fn in_memory(interval: Duration) -> Self {
        Self {
            state_dir: None,
            create_dir: false,
            interval,
            last_sweep: Mutex::new(None),
        }
    }

    /// Persist only into a state directory that already exists. Used when
    /// the state file shares the storage root, which must never be created
    /// by the cache.
    pub fn existing_dir_only(mut self) -> Self {
        self.create_dir = false;
        self
    }

    pub fn last_sweep(&self) -> Option<SystemTime> {
        *self.last_sweep.lock()
    }

    /// True when the interval has elapsed since the last sweep, when no sweep
    /// was ever recorded, or when the clock moved behind the recorded time.
    pub fn is_due(&self, now: SystemTime) -> bool {
        match self.last_sweep() {
            None => true,
            Some(last) => now
                .duration_since(last)
                .map(|elapsed| elapsed >= self.interval)
                .unwrap_or(true),
        }
    }

    /// Records a completed sweep in memory, then persists it.
    pub async fn mark_swept(&self, at: SystemTime) -> CacheResult<()> {
        *self.last_sweep.lock() = Some(at);
        let Some(state_dir) = &self.state_dir else {
            return Ok(());
        };

        let path = state_dir.join(STATE_FILE_NAME);
        let mut map = match read_state(&path).await {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "rewriting unreadable cache state");
                Map::new()
            }
        };
        map.insert(LAST_CLEANUP_KEY.to_string(), Value::from(epoch_millis(at)));

        let bytes = serde_json::to_vec_pretty(&map)
            .map_err(|err| CacheError::io("encode", &path, io::Error::other(err)))?;
        if self.create_dir {
            async_fs::create_dir_all(state_dir)
                .await
                .map_err(|err| CacheError::io("create", state_dir, err))?;
        }
        FileStore::write_atomic(state_dir, STATE_FILE_NAME, &bytes, u64::MAX).await?;
        Ok(())
    }
}

async fn read_state(path: &Path) -> CacheResult<Map<String, Value>> {
    let data = match async_fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => return Err(CacheError::io("read", path, err)),
    };
    serde_json::from_slice(&data)
        .map_err(|err| CacheError::io("parse", path, io::Error::new(ErrorKind::InvalidData, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test]
    async fn never_swept_is_due() -> Result<()> {
        let dir = TempDir::new()?;
        let schedule = SweepSchedule::load(dir.path(), DAY).await;
        assert!(schedule.last_sweep().is_none());
        assert!(schedule.is_due(SystemTime::now()));
        Ok(())
    }

    #[tokio::test]
    async fn last_sweep_survives_reload() -> Result<()> {
        let dir = TempDir::new()?;
        let at = from_epoch_millis(1_700_000_000_000);
        SweepSchedule::load(dir.path(), DAY)
            .await
            .mark_swept(at)
            .await?;

        let reloaded = SweepSchedule::load(dir.path(), DAY).await;
        assert_eq!(reloaded.last_sweep(), Some(at));
        assert!(!reloaded.is_due(at + DAY - Duration::from_secs(1)));
        assert!(reloaded.is_due(at + DAY));
        Ok(())
    }

    #[tokio::test]
    async fn existing_dir_only_never_creates_the_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let missing = dir.path().join("unmounted");
        let schedule = SweepSchedule::load(&missing, DAY).await.existing_dir_only();

        let at = from_epoch_millis(1_000);
        assert!(schedule.mark_swept(at).await.is_err());
        assert!(!missing.exists());
        assert_eq!(schedule.last_sweep(), Some(at));
        Ok(())
    }

    #[tokio::test]
    async fn preserves_unrelated_keys() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(STATE_FILE_NAME);
        std::fs::write(&path, br#"{"theme":"dark"}"#)?;

        let schedule = SweepSchedule::load(dir.path(), DAY).await;
        schedule.mark_swept(from_epoch_millis(42)).await?;

        let stored: Map<String, Value> = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(stored.get("theme"), Some(&Value::from("dark")));
        assert_eq!(stored.get(LAST_CLEANUP_KEY), Some(&Value::from(42u64)));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_state_counts_as_never_swept() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join(STATE_FILE_NAME), b"not json")?;
        let schedule = SweepSchedule::load(dir.path(), DAY).await;
        assert!(schedule.last_sweep().is_none());
        Ok(())
    }

    #[test]
    fn clock_behind_last_sweep_is_due() {
        let schedule = SweepSchedule::in_memory(DAY);
        *schedule.last_sweep.lock() = Some(from_epoch_millis(10_000));
        assert!(schedule.is_due(from_epoch_millis(5_000)));
    }
}
