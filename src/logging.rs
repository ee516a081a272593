use std::time::Duration;

use anyhow::{Result, anyhow};
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cache::{CleanupResult, SweepTrigger};
use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One line per sweep or purge, emitted under the `cleanup_log` target.
#[derive(Debug, Clone)]
pub struct CleanupLogEvent {
    pub trigger: String,
    pub purged: bool,
    pub skipped: bool,
    pub cleaned_bytes: u64,
    pub deleted_count: usize,
    pub expired_count: usize,
    pub failed_categories: Vec<String>,
    pub elapsed_ms: u128,
}

#[derive(Debug)]
pub struct CleanupLogBuilder {
    event: CleanupLogEvent,
}

impl CleanupLogBuilder {
    pub fn new(trigger: SweepTrigger) -> Self {
        Self {
            event: CleanupLogEvent {
                trigger: trigger.as_str().to_string(),
                purged: false,
                skipped: false,
                cleaned_bytes: 0,
                deleted_count: 0,
                expired_count: 0,
                failed_categories: Vec::new(),
                elapsed_ms: 0,
            },
        }
    }

    pub fn from_result(result: &CleanupResult) -> Self {
        let mut builder = Self::new(result.trigger)
            .purged(result.purged)
            .skipped(result.skipped)
            .elapsed(result.duration);
        for category in &result.categories {
            builder = builder.category(
                category.category.as_str(),
                category.cleaned_bytes,
                category.deleted_count,
                category.expired_count,
                category.error.is_some(),
            );
        }
        builder
    }

    pub fn purged(mut self, purged: bool) -> Self {
        self.event.purged = purged;
        self
    }

    pub fn skipped(mut self, skipped: bool) -> Self {
        self.event.skipped = skipped;
        self
    }

    pub fn category(
        mut self,
        name: &str,
        cleaned_bytes: u64,
        deleted_count: usize,
        expired_count: usize,
        failed: bool,
    ) -> Self {
        self.event.cleaned_bytes = self.event.cleaned_bytes.saturating_add(cleaned_bytes);
        self.event.deleted_count += deleted_count;
        self.event.expired_count += expired_count;
        if failed {
            self.event.failed_categories.push(name.to_string());
        }
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn build(self) -> CleanupLogEvent {
        self.event
    }

    pub fn log(self) {
        log_cleanup(self.build());
    }
}

pub fn log_cleanup(event: CleanupLogEvent) {
    let CleanupLogEvent {
        trigger,
        purged,
        skipped,
        cleaned_bytes,
        deleted_count,
        expired_count,
        failed_categories,
        elapsed_ms,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let failed_field = if failed_categories.is_empty() {
        None
    } else {
        Some(failed_categories.join(","))
    };

    tracing::info!(
        target: "cleanup_log",
        ts,
        trigger,
        purged,
        skipped,
        cleaned_bytes,
        deleted_count,
        expired_count,
        failed_categories = failed_field.as_deref(),
        elapsed_ms
    );
}
