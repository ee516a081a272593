use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use super::CategoryKind;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// A cached file as seen in the directory listing. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl CacheEntry {
    /// Age in whole elapsed days. Modification times in the future count as zero.
    pub fn age_days(&self, now: SystemTime) -> u64 {
        now.duration_since(self.modified)
            .unwrap_or(Duration::ZERO)
            .as_secs()
            / SECS_PER_DAY
    }
}

/// Limits enforced for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheBudget {
    pub max_total_bytes: u64,
    pub max_file_count: usize,
    pub max_file_age_days: u64,
    /// Largest single item the category accepts.
    pub max_file_bytes: u64,
}

impl CacheBudget {
    /// Scales the byte and count limits down to `percent` of their configured
    /// value for a one-shot emergency pass. Age and per-item limits are kept.
    pub fn tightened(&self, percent: u8) -> Self {
        let percent = u64::from(percent.clamp(1, 100));
        Self {
            max_total_bytes: self.max_total_bytes.saturating_mul(percent) / 100,
            max_file_count: ((self.max_file_count as u64).saturating_mul(percent) / 100) as usize,
            ..*self
        }
    }

    /// The budget left for files already on disk once `bytes`/`files` are
    /// set aside for writes that have been admitted but not yet committed.
    pub fn excluding(&self, bytes: u64, files: usize) -> Self {
        Self {
            max_total_bytes: self.max_total_bytes.saturating_sub(bytes),
            max_file_count: self.max_file_count.saturating_sub(files),
            ..*self
        }
    }
}

/// Live usage of a category directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub total_bytes: u64,
    pub file_count: usize,
}

impl Usage {
    pub fn of(entries: &[CacheEntry]) -> Self {
        entries.iter().fold(Self::default(), |mut usage, entry| {
            usage.total_bytes = usage.total_bytes.saturating_add(entry.size_bytes);
            usage.file_count += 1;
            usage
        })
    }

    pub fn within(&self, budget: &CacheBudget) -> bool {
        self.total_bytes <= budget.max_total_bytes && self.file_count <= budget.max_file_count
    }
}

/// Outcome of evicting or purging one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemCleanupResult {
    pub category: CategoryKind,
    pub cleaned_bytes: u64,
    pub deleted_count: usize,
    /// How many of the deleted files were removed for exceeding the age limit.
    pub expired_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemCleanupResult {
    pub fn empty(category: CategoryKind) -> Self {
        Self {
            category,
            cleaned_bytes: 0,
            deleted_count: 0,
            expired_count: 0,
            error: None,
        }
    }

    pub fn failed(category: CategoryKind, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::empty(category)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> CacheBudget {
        CacheBudget {
            max_total_bytes: 1000,
            max_file_count: 10,
            max_file_age_days: 3,
            max_file_bytes: 500,
        }
    }

    #[test]
    fn age_days_floors_partial_days() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10 * SECS_PER_DAY);
        let entry = CacheEntry {
            path: PathBuf::from("a"),
            size_bytes: 1,
            modified: now - Duration::from_secs(3 * SECS_PER_DAY + 3600),
        };
        assert_eq!(entry.age_days(now), 3);

        let future = CacheEntry {
            modified: now + Duration::from_secs(60),
            ..entry
        };
        assert_eq!(future.age_days(now), 0);
    }

    #[test]
    fn tightened_scales_bytes_and_count_only() {
        let half = budget().tightened(50);
        assert_eq!(half.max_total_bytes, 500);
        assert_eq!(half.max_file_count, 5);
        assert_eq!(half.max_file_age_days, 3);
        assert_eq!(half.max_file_bytes, 500);
        assert_eq!(budget().tightened(100), budget());
        assert_eq!(budget().tightened(200), budget());
    }

    #[test]
    fn excluding_saturates() {
        let reduced = budget().excluding(1500, 20);
        assert_eq!(reduced.max_total_bytes, 0);
        assert_eq!(reduced.max_file_count, 0);
    }
}
