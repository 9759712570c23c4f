// Cache directory layout and eviction.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cache::CacheFileStore;
use super::registry::ResourceRegistry;
use crate::config::SIDECAR_EXTENSION;
use crate::detect::mime;
use crate::error::CacheResult;

/// Maps URLs to files under one root: `<root>/<md5(url)>[.<ext>]` for data,
/// `<data>.cache_range` for the sidecar.
#[derive(Debug, Clone)]
pub struct CacheDirectory {
    root: PathBuf,
}

impl CacheDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_path(&self, url: &str) -> PathBuf {
        let digest = format!("{:x}", md5::compute(url.as_bytes()));
        let name = match mime::url_extension(url) {
            Some(ext) => format!("{}.{}", digest, ext),
            None => digest,
        };
        self.root.join(name)
    }

    pub fn sidecar_path(&self, url: &str) -> PathBuf {
        sidecar_for(&self.data_path(url))
    }

    pub fn open_store(&self, url: &str, persist_debounce: Duration) -> CacheResult<CacheFileStore> {
        CacheFileStore::open(
            url,
            self.data_path(url),
            self.sidecar_path(url),
            persist_debounce,
        )
    }

    /// Total size in bytes of everything under the root.
    pub fn cache_size(&self) -> CacheResult<u64> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut total = 0;
        for entry in entries {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    /// Delete every cached file except those of URLs in `registry`.
    /// Returns the number of files removed.
    pub fn clear_all(&self, registry: &ResourceRegistry) -> CacheResult<usize> {
        let protected: Vec<String> = registry
            .urls()
            .iter()
            .filter_map(|url| file_name(&self.data_path(url)))
            .collect();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Sidecars and their temp files share the data file's name as prefix.
            if protected.iter().any(|p| name.starts_with(p.as_str())) {
                debug!("keeping in-flight cache file {}", name);
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("failed to remove {:?}: {}", path, e),
            }
        }
        info!("cache cleared root={:?} removed={} kept={}", self.root, removed, protected.len());
        Ok(removed)
    }

    /// Delete the data file and sidecar of one URL.
    ///
    /// Returns false without touching anything if the URL has a pending read,
    /// or if a removal failed.
    pub fn clear_one(&self, url: &str, registry: &ResourceRegistry) -> bool {
        if registry.contains(url) {
            debug!("not clearing in-flight url={}", url);
            return false;
        }
        let mut ok = true;
        for path in [self.data_path(url), self.sidecar_path(url)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("removed {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("failed to remove {:?}: {}", path, e);
                    ok = false;
                }
            }
        }
        ok
    }
}

fn sidecar_for(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

fn file_name(path: &Path) -> Option<String> {
    Some(path.file_name()?.to_string_lossy().into_owned())
}
