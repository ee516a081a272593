use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

use super::{CacheBudget, CacheEntry, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Expired,
    OverBudget,
    Purged,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::OverBudget => "over_budget",
            EvictionReason::Purged => "purged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

/// Picks the entries to delete, in deletion order, to bring `entries` within
/// `budget`.
///
/// Entries older than `max_file_age_days` go first regardless of usage. The
/// rest are taken oldest first (ties by path) until both the byte and the file
/// count limits hold. A single file larger than the byte budget is selected
/// like any other, so the result may empty the category.
pub fn select_for_eviction(
    entries: &[CacheEntry],
    budget: &CacheBudget,
    now: SystemTime,
) -> Vec<Eviction> {
    let mut ordered: Vec<&CacheEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| oldest_first(a, b));

    let (expired, retained): (Vec<&CacheEntry>, Vec<&CacheEntry>) = ordered
        .into_iter()
        .partition(|entry| entry.age_days(now) > budget.max_file_age_days);

    let mut selected: Vec<Eviction> = expired
        .into_iter()
        .map(|entry| Eviction::of(entry, EvictionReason::Expired))
        .collect();

    let mut usage = Usage::default();
    for entry in &retained {
        usage.total_bytes = usage.total_bytes.saturating_add(entry.size_bytes);
        usage.file_count += 1;
    }

    for entry in retained {
        if usage.within(budget) {
            break;
        }
        usage.total_bytes = usage.total_bytes.saturating_sub(entry.size_bytes);
        usage.file_count -= 1;
        selected.push(Eviction::of(entry, EvictionReason::OverBudget));
    }

    selected
}

impl Eviction {
    fn of(entry: &CacheEntry, reason: EvictionReason) -> Self {
        Self {
            path: entry.path.clone(),
            size_bytes: entry.size_bytes,
            reason,
        }
    }
}

fn oldest_first(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    a.modified
        .cmp(&b.modified)
        .then_with(|| a.path.cmp(&b.path))
}
