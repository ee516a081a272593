use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of the hex digest kept in cache file names.
const FILE_ID_HEX_LEN: usize = 32;

/// The governed cache domains, in the order sweeps visit them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    Music,
    Thumbnail,
    Temp,
}

impl CategoryKind {
    pub const ALL: [CategoryKind; 3] = [
        CategoryKind::Music,
        CategoryKind::Thumbnail,
        CategoryKind::Temp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CategoryKind::Music => "music",
            CategoryKind::Thumbnail => "thumbnail",
            CategoryKind::Temp => "temp",
        }
    }

    pub fn default_dir_name(self) -> &'static str {
        match self {
            CategoryKind::Music => "music_cache",
            CategoryKind::Thumbnail => "thumbnails",
            CategoryKind::Temp => "temp",
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            CategoryKind::Music => "music",
            CategoryKind::Thumbnail => "thumb",
            CategoryKind::Temp => "temp",
        }
    }

    fn file_extension(self) -> &'static str {
        match self {
            CategoryKind::Music => "mp3",
            CategoryKind::Thumbnail => "jpg",
            CategoryKind::Temp => "bin",
        }
    }
}

impl fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a source key (usually the remote URL) to a stable file name.
#[derive(Debug, Clone)]
pub struct CacheKey {
    source: String,
    file_name: String,
}

impl CacheKey {
    pub fn new(kind: CategoryKind, source: impl Into<String>) -> Self {
        let source = source.into();
        let file_name = Self::file_name_for(kind, &source);
        Self { source, file_name }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    fn file_name_for(kind: CategoryKind, source: &str) -> String {
        let digest = blake3::hash(source.as_bytes()).to_hex();
        format!(
            "{}_{}.{}",
            kind.file_prefix(),
            &digest.as_str()[..FILE_ID_HEX_LEN],
            kind.file_extension()
        )
    }
}
