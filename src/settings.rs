use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::{CacheBudget, CategoryKind, StorageRoots};
use crate::cli::{Cli, LogFormat};

const MIB: u64 = 1024 * 1024;

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_sweep_interval_days() -> u64 {
    1
}

fn default_scheduler_check_secs() -> u64 {
    3600
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_download_concurrency() -> usize {
    2
}

fn default_size_hint() -> u64 {
    MIB
}

fn default_emergency_budget_percent() -> u8 {
    100
}

/// Per-category overrides. Anything left out falls back to the category's
/// built-in budget.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategorySettings {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub max_total_bytes: Option<u64>,
    #[serde(default)]
    pub max_file_count: Option<usize>,
    #[serde(default)]
    pub max_file_age_days: Option<u64>,
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Preferred storage volume (external storage). Optional.
    #[serde(default)]
    pub primary_root: Option<PathBuf>,
    /// Always-available storage root used when the primary one is missing.
    pub cache_root: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_sweep_interval_days")]
    pub sweep_interval_days: u64,
    #[serde(default = "default_scheduler_check_secs")]
    pub scheduler_check_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    #[serde(default = "default_size_hint")]
    pub default_size_hint: u64,
    #[serde(default = "default_emergency_budget_percent")]
    pub emergency_budget_percent: u8,
    #[serde(default)]
    pub music: CategorySettings,
    #[serde(default)]
    pub thumbnail: CategorySettings,
    #[serde(default)]
    pub temp: CategorySettings,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("UGC_CACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with every default applied and storage under `cache_root`.
    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            primary_root: None,
            cache_root: cache_root.into(),
            state_dir: None,
            log: default_log_format(),
            sweep_interval_days: default_sweep_interval_days(),
            scheduler_check_secs: default_scheduler_check_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            download_concurrency: default_download_concurrency(),
            default_size_hint: default_size_hint(),
            emergency_budget_percent: default_emergency_budget_percent(),
            music: CategorySettings::default(),
            thumbnail: CategorySettings::default(),
            temp: CategorySettings::default(),
        }
    }

    pub fn storage_roots(&self) -> StorageRoots {
        StorageRoots {
            primary: self.primary_root.clone(),
            fallback: self.cache_root.clone(),
        }
    }

    /// Where the sweep schedule is persisted. Defaults to the fallback root,
    /// which is always present.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.cache_root.clone())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_days.saturating_mul(24 * 60 * 60))
    }

    pub fn scheduler_check_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_check_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn category(&self, kind: CategoryKind) -> &CategorySettings {
        match kind {
            CategoryKind::Music => &self.music,
            CategoryKind::Thumbnail => &self.thumbnail,
            CategoryKind::Temp => &self.temp,
        }
    }

    pub fn dir_name(&self, kind: CategoryKind) -> &str {
        self.category(kind)
            .dir
            .as_deref()
            .unwrap_or_else(|| kind.default_dir_name())
    }

    pub fn budget(&self, kind: CategoryKind) -> CacheBudget {
        let defaults = default_budget(kind);
        let overrides = self.category(kind);
        let max_total_bytes = overrides
            .max_total_bytes
            .unwrap_or(defaults.max_total_bytes);
        CacheBudget {
            max_total_bytes,
            max_file_count: overrides.max_file_count.unwrap_or(defaults.max_file_count),
            max_file_age_days: overrides
                .max_file_age_days
                .unwrap_or(defaults.max_file_age_days),
            max_file_bytes: overrides
                .max_file_bytes
                .unwrap_or_else(|| defaults.max_file_bytes.min(max_total_bytes)),
        }
    }
}

fn default_budget(kind: CategoryKind) -> CacheBudget {
    match kind {
        CategoryKind::Music => CacheBudget {
            max_total_bytes: 10 * MIB,
            max_file_count: 20,
            max_file_age_days: 3,
            max_file_bytes: 5 * MIB,
        },
        CategoryKind::Thumbnail => CacheBudget {
            max_total_bytes: 10 * MIB,
            max_file_count: 200,
            max_file_age_days: 3,
            max_file_bytes: 10 * MIB,
        },
        CategoryKind::Temp => CacheBudget {
            max_total_bytes: 64 * MIB,
            max_file_count: 1000,
            max_file_age_days: 1,
            max_file_bytes: 64 * MIB,
        },
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/ugc-cache/ugc-cache.toml"),
        PathBuf::from("ugc-cache.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_root = absolutize(&self.cache_root, base_dir);
        self.primary_root = self
            .primary_root
            .as_ref()
            .map(|path| absolutize(path, base_dir));
        self.state_dir = self
            .state_dir
            .as_ref()
            .map(|path| absolutize(path, base_dir));
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.sweep_interval_days > 0,
            "sweep_interval_days must be greater than 0 (got {})",
            self.sweep_interval_days
        );
        ensure!(
            self.scheduler_check_secs > 0,
            "scheduler_check_secs must be greater than 0 seconds (got {})",
            self.scheduler_check_secs
        );
        ensure!(
            self.shutdown_timeout_secs > 0,
            "shutdown_timeout_secs must be greater than 0 seconds (got {})",
            self.shutdown_timeout_secs
        );
        ensure!(
            self.download_concurrency > 0,
            "download_concurrency must be at least 1 (got {})",
            self.download_concurrency
        );
        ensure!(
            self.default_size_hint > 0,
            "default_size_hint must be greater than 0 (got {})",
            self.default_size_hint
        );
        ensure!(
            (1..=100).contains(&self.emergency_budget_percent),
            "emergency_budget_percent must be between 1 and 100 (got {})",
            self.emergency_budget_percent
        );

        let mut dir_names = Vec::new();
        for kind in CategoryKind::ALL {
            let budget = self.budget(kind);
            ensure!(
                budget.max_total_bytes > 0,
                "{kind}.max_total_bytes must be greater than 0"
            );
            ensure!(
                budget.max_file_count > 0,
                "{kind}.max_file_count must be greater than 0"
            );
            ensure!(
                budget.max_file_bytes > 0 && budget.max_file_bytes <= budget.max_total_bytes,
                "{kind}.max_file_bytes must be between 1 and max_total_bytes ({})",
                budget.max_total_bytes
            );

            let dir_name = self.dir_name(kind);
            let mut components = Path::new(dir_name).components();
            let single_normal = matches!(
                (components.next(), components.next()),
                (Some(std::path::Component::Normal(_)), None)
            );
            ensure!(
                single_normal,
                "{kind}.dir must be a single directory name (got {dir_name:?})"
            );
            if dir_names.contains(&dir_name) {
                bail!("{kind}.dir {dir_name:?} is shared with another category");
            }
            dir_names.push(dir_name);
        }
        Ok(())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
