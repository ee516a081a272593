use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tempfile::TempDir;

use ugc_cache::cache::CategoryKind;
use ugc_cache::settings::Settings;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A scratch storage root plus a state directory, removed on drop.
pub struct TestDirs {
    _temp: TempDir,
    pub cache_root: PathBuf,
    pub state_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_root = temp.path().join("internal");
        let state_dir = temp.path().join("state");
        std::fs::create_dir_all(&cache_root)?;

        Ok(Self {
            _temp: temp,
            cache_root,
            state_dir,
        })
    }

    /// Default settings rooted in this workspace with a generous shutdown
    /// timeout and the state file kept out of the cache root.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::with_root(&self.cache_root);
        settings.state_dir = Some(self.state_dir.clone());
        settings
    }

    pub fn category_dir(&self, kind: CategoryKind) -> PathBuf {
        self.cache_root.join(kind.default_dir_name())
    }
}

/// Writes `len` bytes and backdates the mtime by `age_days` days plus a few
/// minutes so whole-day boundaries are not flaky.
pub fn write_aged_file(dir: &Path, name: &str, len: usize, age_days: u64) -> Result<PathBuf> {
    let age = DAY * u32::try_from(age_days)? + Duration::from_secs(300);
    write_file_with_age(dir, name, len, age)
}

/// Writes `len` bytes whose mtime is `seconds_ago` in the past. Used to give
/// fresh files a deterministic oldest-first order.
pub fn write_fresh_file(dir: &Path, name: &str, len: usize, seconds_ago: u64) -> Result<PathBuf> {
    write_file_with_age(dir, name, len, Duration::from_secs(seconds_ago))
}

fn write_file_with_age(dir: &Path, name: &str, len: usize, age: Duration) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, vec![b'x'; len])?;
    let modified = SystemTime::now()
        .checked_sub(age)
        .context("age underflows the clock")?;
    File::options()
        .write(true)
        .open(&path)?
        .set_modified(modified)
        .with_context(|| format!("failed to backdate {}", path.display()))?;
    Ok(path)
}
