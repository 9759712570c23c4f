// Cache engine: routes read requests for a URL to its live session and owns the
// shared pieces (directory, registry, source, event channel).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::cache::CacheFileStore;
use super::directory::CacheDirectory;
use super::pipeline::{LoadEvent, PipelineSettings};
use super::progress::{CacheEvent, EventSink};
use super::record::{CacheRecord, ContentMeta};
use super::registry::ResourceRegistry;
use super::session::{LoadHandle, ReadRequest, ResourceSession};
use crate::config::{CacheConfig, EVENT_CHANNEL_CAPACITY};
use crate::error::{CacheError, CacheResult};
use crate::source::http_source::HttpSource;
use crate::source::traits::RangeSource;

#[derive(Default)]
struct SessionTable {
    active: HashMap<String, Arc<ResourceSession>>,
    /// Stores outlive their session while a cancelled pipeline winds down;
    /// a new session must reuse them rather than open the files twice.
    stores: HashMap<String, Weak<CacheFileStore>>,
}

pub struct CacheEngine {
    config: CacheConfig,
    directory: CacheDirectory,
    registry: ResourceRegistry,
    source: Arc<dyn RangeSource>,
    events: EventSink,
    sessions: Arc<Mutex<SessionTable>>,
}

impl CacheEngine {
    pub fn new(config: CacheConfig, source: Arc<dyn RangeSource>) -> Self {
        let directory = CacheDirectory::new(config.cache_dir.clone());
        info!("cache engine root={:?}", directory.root());
        Self {
            config,
            directory,
            registry: ResourceRegistry::new(),
            source,
            events: EventSink::new(EVENT_CHANNEL_CAPACITY),
            sessions: Arc::new(Mutex::new(SessionTable::default())),
        }
    }

    /// Engine fetching over HTTP with default client settings.
    pub fn with_http(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(HttpSource::default()))
    }

    /// Serve one read request for `url`.
    ///
    /// Requests for the same URL share one session and one cache file.
    pub fn load(&self, url: &str, request: ReadRequest) -> CacheResult<LoadHandle> {
        let mut table = self.sessions.lock();
        let existing = table.active.get(url).cloned();
        let session = match existing {
            Some(session) => session,
            None => {
                let session = self.create_session(url, &mut table)?;
                table.active.insert(url.to_string(), Arc::clone(&session));
                session
            }
        };
        // Read while the table is locked so an idle sweep cannot drop the session first.
        Ok(session.read(request))
    }

    fn create_session(&self, url: &str, table: &mut SessionTable) -> CacheResult<Arc<ResourceSession>> {
        table.stores.retain(|_, store| store.strong_count() > 0);
        let store = match table.stores.get(url).and_then(Weak::upgrade) {
            Some(store) => store,
            None => {
                let store = Arc::new(
                    self.directory
                        .open_store(url, self.config.persist_debounce())?,
                );
                table.stores.insert(url.to_string(), Arc::downgrade(&store));
                store
            }
        };

        let session = ResourceSession::new(
            url.to_string(),
            store,
            Arc::clone(&self.source),
            self.registry.clone(),
            self.events.clone(),
            self.config.package_size,
            PipelineSettings::from(&self.config),
        );

        let sessions = Arc::downgrade(&self.sessions);
        let weak_session = Arc::downgrade(&session);
        let key = url.to_string();
        session.set_idle_hook(move || {
            let (sessions, session) = match (sessions.upgrade(), weak_session.upgrade()) {
                (Some(sessions), Some(session)) => (sessions, session),
                _ => return,
            };
            let mut table = sessions.lock();
            let current = table
                .active
                .get(&key)
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if current && session.is_idle() {
                table.active.remove(&key);
                debug!("released idle session url={}", key);
            }
        });

        debug!("session created url={}", url);
        Ok(session)
    }

    /// Content info of `url`, from the cache when known, else by issuing the probe read.
    pub async fn content_info(&self, url: &str) -> CacheResult<ContentMeta> {
        if let Some(meta) = self.cached_record(url).and_then(|r| r.content_info) {
            return Ok(meta);
        }
        let probe = self.load(url, ReadRequest::probe())?;
        drain(probe).await?.ok_or_else(|| {
            CacheError::Network(format!("no content info received for {}", url))
        })
    }

    /// Download the whole resource into the cache: the probe read first, then
    /// everything after it.
    pub async fn preload(&self, url: &str) -> CacheResult<CacheRecord> {
        let probe = self.load(url, ReadRequest::probe())?;
        let meta = drain(probe).await?;

        if let Some(meta) = meta {
            let offset = ReadRequest::probe().length;
            if meta.content_length > offset {
                let rest = self.load(url, ReadRequest::to_end(offset, meta.content_length - offset))?;
                drain(rest).await?;
            }
        }

        let record = self.cached_record(url).unwrap_or_else(|| CacheRecord::new(url));
        info!(
            "preload done url={} progress={:.3} speed_kbps={:.1}",
            url,
            record.progress(),
            record.download_speed_kbps()
        );
        Ok(record)
    }

    /// Cancel every pending request on every session.
    pub fn cancel_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().active.values().cloned().collect();
        for session in &sessions {
            session.cancel_all();
        }
        self.sessions.lock().active.clear();
        info!("cancelled all sessions count={}", sessions.len());
    }

    /// Remove every cached file except those with a pending read.
    pub fn clean_cache(&self) -> CacheResult<usize> {
        let mut table = self.sessions.lock();
        let urls: Vec<String> = table.stores.keys().cloned().collect();
        for url in urls.iter().filter(|url| !self.registry.contains(url)) {
            detach_store(&mut table, url);
        }
        self.directory.clear_all(&self.registry)
    }

    /// Remove one URL's cached files. Refused while the URL has a pending read.
    pub fn clean_one(&self, url: &str) -> bool {
        // The table lock keeps `load` from registering a new read meanwhile.
        let mut table = self.sessions.lock();
        if self.registry.contains(url) {
            debug!("clean refused, read in flight url={}", url);
            return false;
        }
        detach_store(&mut table, url);
        self.directory.clear_one(url, &self.registry)
    }

    pub fn cache_size(&self) -> CacheResult<u64> {
        self.directory.cache_size()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Current record of `url`: the live store's view if one is open, else the sidecar.
    pub fn cached_record(&self, url: &str) -> Option<CacheRecord> {
        let live = self
            .sessions
            .lock()
            .stores
            .get(url)
            .and_then(Weak::upgrade);
        match live {
            Some(store) => Some(store.snapshot()),
            None => CacheRecord::load(&self.directory.sidecar_path(url)),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().active.len()
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &CacheDirectory {
        &self.directory
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

/// Forget the idle session and open store of `url` so the next load reopens
/// fresh files. A store still held by a winding-down pipeline is evicted.
fn detach_store(table: &mut SessionTable, url: &str) {
    if table.active.get(url).is_some_and(|s| s.is_idle()) {
        table.active.remove(url);
    }
    if let Some(store) = table.stores.remove(url).and_then(|weak| weak.upgrade()) {
        store.evict();
    }
}

/// Consume a request's events without keeping the payload.
async fn drain(mut handle: LoadHandle) -> CacheResult<Option<ContentMeta>> {
    let mut meta = None;
    while let Some(event) = handle.recv().await {
        match event {
            LoadEvent::ContentInfo(info) => meta = Some(info),
            LoadEvent::Data(_) => {}
            LoadEvent::Finished(result) => {
                result?;
                break;
            }
        }
    }
    Ok(meta)
}
