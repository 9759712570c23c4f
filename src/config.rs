use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Maximum byte length of a single local read/respond cycle (200 KB).
pub const PACKAGE_SIZE: u64 = 204_800;

/// Network chunks are coalesced until the buffer grows past this size (10 KB).
pub const BUFFER_FLUSH_BYTES: usize = 10 * 1024;

/// Minimum spacing between two progress notifications for one pipeline.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Batch window for sidecar writes triggered by incoming data.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);

/// Length of the probe request players issue before anything else.
pub const PROBE_LENGTH: u64 = 2;

/// Buffered events per read request before the pipeline waits for the consumer.
pub const LOAD_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the broadcast channel carrying progress/finish events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Extension appended to a cache file's name to form its sidecar path.
pub const SIDECAR_EXTENSION: &str = "cache_range";

/// Content type used when the server declares nothing usable.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Top-level configuration for the cache engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cached media files and their sidecars.
    pub cache_dir: PathBuf,
    /// Maximum size of a local action in bytes.
    pub package_size: u64,
    /// Coalescing threshold for network chunks in bytes.
    pub flush_threshold: usize,
    pub progress_interval_ms: u64,
    pub persist_debounce_ms: u64,
}

impl CacheConfig {
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parse cache config")?;
        Ok(config)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("mediaCache"),
            package_size: PACKAGE_SIZE,
            flush_threshold: BUFFER_FLUSH_BYTES,
            progress_interval_ms: PROGRESS_INTERVAL.as_millis() as u64,
            persist_debounce_ms: PERSIST_DEBOUNCE.as_millis() as u64,
        }
    }
}
