// Persisted per-resource cache metadata and its sidecar file I/O.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::fragment::FragmentSet;
use crate::error::CacheResult;

/// Content info of a remote resource, established from its first response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMeta {
    pub content_type: String,
    pub range_supported: bool,
    pub content_length: u64,
}

/// Bytes written by one transfer burst and the time it took.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferSample {
    pub bytes: u64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub url: String,
    #[serde(default)]
    pub content_info: Option<ContentMeta>,
    #[serde(default)]
    pub fragments: FragmentSet,
    #[serde(default)]
    pub download_samples: Vec<TransferSample>,
}

impl CacheRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.fragments.covered_bytes()
    }

    /// Fraction of the resource on disk, 0.0 while the length is unknown.
    pub fn progress(&self) -> f64 {
        match &self.content_info {
            Some(info) if info.content_length > 0 => {
                self.downloaded_bytes() as f64 / info.content_length as f64
            }
            _ => 0.0,
        }
    }

    /// Rolling download speed in KB/s over every recorded burst.
    pub fn download_speed_kbps(&self) -> f64 {
        let (bytes, secs) = self
            .download_samples
            .iter()
            .fold((0u64, 0f64), |(b, s), sample| (b + sample.bytes, s + sample.elapsed_secs));
        if secs <= 0.0 {
            return 0.0;
        }
        bytes as f64 / 1024.0 / secs
    }

    pub fn is_complete(&self) -> bool {
        match &self.content_info {
            Some(info) => info.content_length > 0 && self.downloaded_bytes() >= info.content_length,
            None => false,
        }
    }

    /// Load a record from its sidecar. Missing or unreadable sidecars yield `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("no sidecar at {:?}: {}", path, e);
                return None;
            }
        };
        if bytes.is_empty() {
            return None;
        }
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("discarding corrupt sidecar {:?}: {}", path, e);
                None
            }
        }
    }

    /// Write the record next to the cache file. The previous sidecar stays intact
    /// until the new one is fully written.
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}
