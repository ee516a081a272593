use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_ADMISSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_admissions_total",
        "Admission decisions by category and result",
    );
    let vec = IntCounterVec::new(opts, &["category", "result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_admissions_total");
    vec
});

static CACHE_STORES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_stores_total", "Committed cache files by category");
    let vec = IntCounterVec::new(opts, &["category"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_stores_total");
    vec
});

static CACHE_STORED_BYTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_stored_bytes_total",
        "Bytes committed to the cache by category",
    );
    let vec = IntCounterVec::new(opts, &["category"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_stored_bytes_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_evictions_total",
        "Files evicted by category and reason",
    );
    let vec = IntCounterVec::new(opts, &["category", "reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_evictions_total");
    vec
});

static CACHE_EVICTED_BYTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_evicted_bytes_total",
        "Bytes reclaimed by eviction by category",
    );
    let vec = IntCounterVec::new(opts, &["category"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_evicted_bytes_total");
    vec
});

static CACHE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_errors_total", "Cache errors by category and kind");
    let vec = IntCounterVec::new(opts, &["category", "kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_errors_total");
    vec
});

static CACHE_SWEEPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_sweeps_total", "Completed sweeps by trigger");
    let vec = IntCounterVec::new(opts, &["trigger"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_sweeps_total");
    vec
});

static CACHE_SWEEP_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("cache_sweep_duration_seconds", "Sweep duration by trigger")
        .buckets(sweep_buckets());
    let vec = HistogramVec::new(opts, &["trigger"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_sweep_duration_seconds");
    vec
});

static CACHE_USAGE_BYTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let opts = Opts::new("cache_usage_bytes", "Bytes on disk by category");
    let vec = IntGaugeVec::new(opts, &["category"]).expect("create gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_usage_bytes");
    vec
});

static CACHE_FILES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let opts = Opts::new("cache_files", "Files on disk by category");
    let vec = IntGaugeVec::new(opts, &["category"]).expect("create gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_files");
    vec
});

static DOWNLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("downloads_total", "Downloads by category and outcome");
    let vec = IntCounterVec::new(opts, &["category", "outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register downloads_total");
    vec
});

fn sweep_buckets() -> Vec<f64> {
    // Directory scans are bounded by max_file_count, so sweeps stay short.
    vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
}

pub fn record_admission(category: &str, admitted: bool) {
    let label = if admitted { "admitted" } else { "denied" };
    CACHE_ADMISSIONS_TOTAL
        .with_label_values(&[category, label])
        .inc();
}

pub fn record_store(category: &str, bytes: u64) {
    CACHE_STORES_TOTAL.with_label_values(&[category]).inc();
    if bytes > 0 {
        CACHE_STORED_BYTES_TOTAL
            .with_label_values(&[category])
            .inc_by(bytes);
    }
}

pub fn record_eviction(category: &str, reason: &str, bytes: u64) {
    CACHE_EVICTIONS_TOTAL
        .with_label_values(&[category, reason])
        .inc();
    if bytes > 0 {
        CACHE_EVICTED_BYTES_TOTAL
            .with_label_values(&[category])
            .inc_by(bytes);
    }
}

pub fn record_cache_error(category: &str, kind: &str) {
    CACHE_ERRORS_TOTAL.with_label_values(&[category, kind]).inc();
}

pub fn record_sweep(trigger: &str, elapsed: Duration) {
    CACHE_SWEEPS_TOTAL.with_label_values(&[trigger]).inc();
    CACHE_SWEEP_DURATION_SECONDS
        .with_label_values(&[trigger])
        .observe(elapsed.as_secs_f64());
}

pub fn set_usage(category: &str, bytes: u64, files: usize) {
    CACHE_USAGE_BYTES
        .with_label_values(&[category])
        .set(i64::try_from(bytes).unwrap_or(i64::MAX));
    CACHE_FILES
        .with_label_values(&[category])
        .set(i64::try_from(files).unwrap_or(i64::MAX));
}

pub fn record_download(category: &str, outcome: &str) {
    DOWNLOADS_TOTAL
        .with_label_values(&[category, outcome])
        .inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}
