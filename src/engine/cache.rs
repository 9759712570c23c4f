// On-disk cache for one resource: a random-access data file plus its fragment index.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::fragment::{ByteRange, FragmentSet};
use super::record::{CacheRecord, ContentMeta, TransferSample};
use crate::error::{CacheError, CacheResult};

pub struct CacheFileStore {
    url: String,
    data_path: PathBuf,
    sidecar_path: PathBuf,
    file: Mutex<File>,
    record: Mutex<CacheRecord>,
    /// Serializes sidecar writes; never taken while `record` is held.
    persist_lock: Mutex<()>,
    persist_scheduled: AtomicBool,
    dirty: AtomicBool,
    /// Set once the files were removed from disk; the handle must not write again.
    evicted: AtomicBool,
    persist_debounce: Duration,
    written_bytes: AtomicU64,
}

impl CacheFileStore {
    /// Open (or create) the cache file for `url`, resuming from the sidecar when it
    /// is readable and consistent with the data file.
    pub fn open(
        url: &str,
        data_path: PathBuf,
        sidecar_path: PathBuf,
        persist_debounce: Duration,
    ) -> CacheResult<Self> {
        let unavailable =
            |e: std::io::Error| CacheError::CacheUnavailable(format!("{:?}: {}", data_path, e));

        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).map_err(unavailable)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)
            .map_err(unavailable)?;
        let file_len = file.metadata().map_err(unavailable)?.len();

        let mut record = match CacheRecord::load(&sidecar_path) {
            Some(record) => record,
            None => CacheRecord::new(url),
        };
        if record.fragments.iter().any(|r| r.end > file_len) {
            warn!(
                "sidecar {:?} claims bytes past end of data file ({} bytes), starting over",
                sidecar_path, file_len
            );
            record = CacheRecord::new(url);
        }
        record.url = url.to_string();

        info!(
            "cache store opened url={} fragments={} cached_bytes={}",
            url,
            record.fragments.len(),
            record.downloaded_bytes()
        );

        Ok(Self {
            url: url.to_string(),
            data_path,
            sidecar_path,
            file: Mutex::new(file),
            record: Mutex::new(record),
            persist_lock: Mutex::new(()),
            persist_scheduled: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            persist_debounce,
            written_bytes: AtomicU64::new(0),
        })
    }

    /// Write `data` at `offset`, then mark the range as cached.
    ///
    /// The fragment set is only updated once the bytes are in the file.
    pub fn write(&self, data: &[u8], offset: u64) -> CacheResult<()> {
        let range = match ByteRange::with_len(offset, data.len() as u64) {
            Some(range) => range,
            None => return Ok(()),
        };
        if self.is_evicted() {
            return Err(CacheError::CacheUnavailable(format!("{} was evicted", self.url)));
        }

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
        }

        self.record.lock().fragments.insert(range);
        self.written_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Read exactly `range` from the data file.
    pub fn read(&self, range: &ByteRange) -> CacheResult<Bytes> {
        if !self.record.lock().fragments.contains(range) {
            return Err(CacheError::NoLocalData {
                start: range.start,
                end: range.end,
            });
        }

        let mut buf = vec![0u8; range.len() as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(range.start))?;
            file.read_exact(&mut buf)?;
        }
        Ok(Bytes::from(buf))
    }

    /// Size the data file to the resource length and remember the content info.
    ///
    /// Calling again with the same length leaves the file alone.
    pub fn set_content_meta(&self, meta: ContentMeta) -> CacheResult<()> {
        let previous = self.record.lock().content_info.clone();
        if previous.as_ref().map(|m| m.content_length) != Some(meta.content_length) {
            let file = self.file.lock();
            file.set_len(meta.content_length)?;
            file.sync_all()?;
        }

        let mut record = self.record.lock();
        if let Some(prev) = &previous {
            if prev.content_length != meta.content_length {
                warn!(
                    "content length changed url={} old={} new={}, dropping cached fragments",
                    self.url, prev.content_length, meta.content_length
                );
                record.fragments = FragmentSet::new();
            }
        }
        record.content_info = Some(meta);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn record_transfer(&self, bytes: u64, elapsed: Duration) {
        self.record.lock().download_samples.push(TransferSample {
            bytes,
            elapsed_secs: elapsed.as_secs_f64(),
        });
        self.dirty.store(true, Ordering::Release);
    }

    pub fn content_meta(&self) -> Option<ContentMeta> {
        self.record.lock().content_info.clone()
    }

    pub fn fragments(&self) -> FragmentSet {
        self.record.lock().fragments.clone()
    }

    pub fn snapshot(&self) -> CacheRecord {
        self.record.lock().clone()
    }

    /// Write the sidecar now.
    pub fn persist(&self) -> CacheResult<()> {
        let _guard = self.persist_lock.lock();
        if self.is_evicted() {
            return Ok(());
        }
        self.dirty.store(false, Ordering::Release);
        let record = self.snapshot();
        record.save(&self.sidecar_path)?;
        debug!(
            "sidecar saved url={} fragments={} path={:?}",
            self.url,
            record.fragments.len(),
            self.sidecar_path
        );
        Ok(())
    }

    /// Persist at most once per debounce window.
    pub fn schedule_persist(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::Release);
        if self.persist_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::downgrade(self);
                let delay = self.persist_debounce;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    // A dropped store already persisted itself.
                    if let Some(store) = store.upgrade() {
                        store.persist_scheduled.store(false, Ordering::Release);
                        if store.dirty.load(Ordering::Acquire) {
                            if let Err(e) = store.persist() {
                                warn!("debounced persist failed url={}: {}", store.url, e);
                            }
                        }
                    }
                });
            }
            Err(_) => {
                self.persist_scheduled.store(false, Ordering::Release);
                if let Err(e) = self.persist() {
                    warn!("persist failed url={}: {}", self.url, e);
                }
            }
        }
    }

    /// Flush file contents and sidecar, e.g. when the host application goes to background.
    pub fn sync(&self) -> CacheResult<()> {
        self.file.lock().sync_data()?;
        self.persist()
    }

    /// Detach this handle from its files before they are deleted. Later writes
    /// fail and persisting becomes a no-op, so the sidecar is never recreated.
    pub fn evict(&self) {
        let _guard = self.persist_lock.lock();
        self.evicted.store(true, Ordering::Release);
        debug!("cache store evicted url={}", self.url);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    /// Bytes written through this handle since it was opened.
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for CacheFileStore {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!("final persist failed url={}: {}", self.url, e);
        }
    }
}
