use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CategoryKind;

/// Errors raised by the cache subsystem.
///
/// None of these should ever fail a user-visible operation: callers degrade to
/// "no caching" instead.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage unavailable at {}: {reason}", path.display())]
    StorageUnavailable { path: PathBuf, reason: String },

    #[error("{category} cache cannot fit {requested} bytes ({available} bytes available)")]
    CacheFull {
        category: CategoryKind,
        requested: u64,
        available: u64,
    },

    #[error("failed to {op} {}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache coordinator is shut down")]
    ShutDown,

    #[error("cache sweep worker exited before replying")]
    WorkerGone,
}

impl CacheError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn storage_unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::StorageUnavailable { .. } => "storage_unavailable",
            CacheError::CacheFull { .. } => "cache_full",
            CacheError::Io { .. } => "io",
            CacheError::ShutDown => "shut_down",
            CacheError::WorkerGone => "worker_gone",
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
