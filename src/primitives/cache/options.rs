use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CacheError, Result};

/// Default size class and page size.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Knobs for idle-buffer cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryCacheConfig {
    /// Free-pool size that forces a cleanup pass regardless of `cleanup_interval`.
    pub max_free_pages: usize,
    /// How long a pooled buffer may sit idle before it can be reclaimed.
    pub max_idle_time: Duration,
    /// Maximum buffers inspected per cleanup pass.
    pub batch_size: usize,
    /// Minimum spacing between cleanup passes while under `max_free_pages`.
    pub cleanup_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_free_pages: 500,
            max_idle_time: Duration::from_secs(60),
            batch_size: 100,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Construction options for [`MemoryCache`](super::MemoryCache).
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Supported buffer sizes; normalized to ascending unique order on validation.
    pub size_classes: Vec<usize>,
    /// Required size for unsized acquisitions. Defaults to the smallest size class.
    pub page_size: Option<usize>,
    /// Upper bound on any per-key wait.
    pub lock_timeout: Duration,
    /// Piggyback a cleanup attempt whenever a buffer returns to the free pool.
    pub auto_cleanup: bool,
    /// Idle cleanup settings.
    pub cleanup: MemoryCacheConfig,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            size_classes: vec![DEFAULT_PAGE_SIZE],
            page_size: None,
            lock_timeout: Duration::from_secs(60),
            auto_cleanup: true,
            cleanup: MemoryCacheConfig::default(),
        }
    }
}

impl CacheOptions {
    /// Options with the given size classes and cleanup config, other fields defaulted.
    pub fn new(size_classes: &[usize], cleanup: MemoryCacheConfig) -> Self {
        Self {
            size_classes: size_classes.to_vec(),
            cleanup,
            ..Self::default()
        }
    }

    /// Sorts and deduplicates size classes and checks the remaining invariants.
    pub fn validate(mut self) -> Result<Self> {
        self.size_classes.sort_unstable();
        self.size_classes.dedup();
        if self.size_classes.is_empty() {
            return Err(CacheError::InvalidState("no buffer size classes configured"));
        }
        if self.size_classes[0] == 0 {
            return Err(CacheError::InvalidState("buffer size class must be non-zero"));
        }
        if let Some(page_size) = self.page_size {
            if page_size == 0 {
                return Err(CacheError::InvalidState("page size must be non-zero"));
            }
            if !self.size_classes.iter().any(|&size| size >= page_size) {
                return Err(CacheError::InvalidState(
                    "page size exceeds every buffer size class",
                ));
            }
        }
        Ok(self)
    }

    /// Required size for acquisitions that do not name one.
    pub fn effective_page_size(&self) -> usize {
        self.page_size
            .or_else(|| self.size_classes.iter().copied().min())
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Parses TOML, overlaying present fields on the defaults.
    pub fn from_toml_str(contents: &str) -> std::result::Result<Self, ConfigError> {
        let raw: RawOptions =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { source })?;
        Ok(raw.into_options().validate()?)
    }

    /// Reads and parses a TOML options file.
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(&RawOptions::from(self))
            .map_err(|source| ConfigError::Serialize { source })
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawOptions {
    size_classes: Option<Vec<usize>>,
    page_size: Option<usize>,
    lock_timeout_ms: Option<u64>,
    auto_cleanup: Option<bool>,
    #[serde(default)]
    cleanup: RawCleanup,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawCleanup {
    max_free_pages: Option<usize>,
    max_idle_time_ms: Option<u64>,
    batch_size: Option<usize>,
    cleanup_interval_ms: Option<u64>,
}

impl RawOptions {
    fn into_options(self) -> CacheOptions {
        let defaults = CacheOptions::default();
        let cleanup_defaults = defaults.cleanup.clone();
        CacheOptions {
            size_classes: self.size_classes.unwrap_or(defaults.size_classes),
            page_size: self.page_size.or(defaults.page_size),
            lock_timeout: self
                .lock_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            auto_cleanup: self.auto_cleanup.unwrap_or(defaults.auto_cleanup),
            cleanup: MemoryCacheConfig {
                max_free_pages: self
                    .cleanup
                    .max_free_pages
                    .unwrap_or(cleanup_defaults.max_free_pages),
                max_idle_time: self
                    .cleanup
                    .max_idle_time_ms
                    .map(Duration::from_millis)
                    .unwrap_or(cleanup_defaults.max_idle_time),
                batch_size: self
                    .cleanup
                    .batch_size
                    .unwrap_or(cleanup_defaults.batch_size),
                cleanup_interval: self
                    .cleanup
                    .cleanup_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(cleanup_defaults.cleanup_interval),
            },
        }
    }
}

impl From<&CacheOptions> for RawOptions {
    fn from(options: &CacheOptions) -> Self {
        Self {
            size_classes: Some(options.size_classes.clone()),
            page_size: options.page_size,
            lock_timeout_ms: Some(duration_ms(options.lock_timeout)),
            auto_cleanup: Some(options.auto_cleanup),
            cleanup: RawCleanup {
                max_free_pages: Some(options.cleanup.max_free_pages),
                max_idle_time_ms: Some(duration_ms(options.cleanup.max_idle_time)),
                batch_size: Some(options.cleanup.batch_size),
                cleanup_interval_ms: Some(duration_ms(options.cleanup.cleanup_interval)),
            },
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Errors raised while loading cache options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The options file could not be read.
    #[error("failed to read cache options {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The options text is not valid TOML for this schema.
    #[error("failed to parse cache options: {source}")]
    Parse {
        /// Underlying TOML failure.
        source: toml::de::Error,
    },
    /// The options could not be rendered as TOML.
    #[error("failed to serialize cache options: {source}")]
    Serialize {
        /// Underlying TOML failure.
        source: toml::ser::Error,
    },
    /// The options parsed but violate a cache invariant.
    #[error(transparent)]
    Invalid(#[from] CacheError),
}
