use thiserror::Error;

/// Errors surfaced by the cache engine to its consumers.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no local data for range [{start}, {end})")]
    NoLocalData { start: u64, end: u64 },
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("transfer cancelled")]
    TransferCancelled,
    #[error("network error: {0}")]
    Network(String),
    #[error("unsupported content type: {0}")]
    UnsupportedContent(String),
    #[error("sidecar serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::TransferCancelled)
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
