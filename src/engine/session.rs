// Resource session: multiplexes concurrent read requests for one URL onto pipelines
// that share a single cache store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::cache::CacheFileStore;
use super::fragment::ByteRange;
use super::pipeline::{DownloadPipeline, LoadEvent, PipelineSettings};
use super::planner::plan_actions;
use super::progress::EventSink;
use super::record::{CacheRecord, ContentMeta};
use super::registry::ResourceRegistry;
use crate::config::{LOAD_CHANNEL_CAPACITY, PROBE_LENGTH};
use crate::error::{CacheError, CacheResult};
use crate::source::traits::RangeSource;

/// One playback-layer data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub offset: u64,
    pub length: u64,
    /// The player wants everything from `offset` to the end of the resource.
    pub to_end: bool,
}

impl ReadRequest {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            to_end: false,
        }
    }

    pub fn to_end(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            to_end: true,
        }
    }

    /// The two-byte request players issue to learn the content info.
    pub fn probe() -> Self {
        Self::new(0, PROBE_LENGTH)
    }

    /// Byte range to serve, given the resource length if known.
    pub fn resolve(&self, content_length: Option<u64>) -> Option<ByteRange> {
        let end = match content_length {
            Some(total) if self.to_end => total,
            Some(total) => self.offset.saturating_add(self.length).min(total),
            None => self.offset.saturating_add(self.length),
        };
        ByteRange::new(self.offset, end)
    }
}

/// Everything a read request produced, gathered by [`LoadHandle::collect`].
#[derive(Debug, Clone, Default)]
pub struct LoadOutput {
    pub content_info: Option<ContentMeta>,
    pub data: Bytes,
    pub chunks: usize,
}

/// Consumer side of one read request.
pub struct LoadHandle {
    id: u64,
    events: mpsc::Receiver<LoadEvent>,
    session: Weak<ResourceSession>,
    finished: bool,
}

impl LoadHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event. Returns `None` after `Finished` has been seen.
    pub async fn recv(&mut self) -> Option<LoadEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(event) => {
                if matches!(event, LoadEvent::Finished(_)) {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                Some(LoadEvent::Finished(Err(CacheError::TransferCancelled)))
            }
        }
    }

    /// Withdraw this request. No further events are delivered to it.
    pub fn cancel(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.events.close();
        match self.session.upgrade() {
            Some(session) => session.cancel(self.id),
            None => false,
        }
    }

    /// Drain every event into one buffer, failing with the request's terminal error.
    pub async fn collect(mut self) -> CacheResult<LoadOutput> {
        let mut output = LoadOutput::default();
        let mut data = BytesMut::new();
        while let Some(event) = self.recv().await {
            match event {
                LoadEvent::ContentInfo(meta) => output.content_info = Some(meta),
                LoadEvent::Data(chunk) => {
                    data.extend_from_slice(&chunk);
                    output.chunks += 1;
                }
                LoadEvent::Finished(result) => {
                    result?;
                    break;
                }
            }
        }
        output.data = data.freeze();
        Ok(output)
    }
}

impl Drop for LoadHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

type IdleHook = Box<dyn Fn() + Send + Sync>;

pub struct ResourceSession {
    url: String,
    store: Arc<CacheFileStore>,
    source: Arc<dyn RangeSource>,
    registry: ResourceRegistry,
    events: EventSink,
    package_size: u64,
    settings: PipelineSettings,
    pending: Mutex<HashMap<u64, Arc<DownloadPipeline>>>,
    next_request_id: AtomicU64,
    on_idle: Mutex<Option<IdleHook>>,
}

impl ResourceSession {
    pub fn new(
        url: String,
        store: Arc<CacheFileStore>,
        source: Arc<dyn RangeSource>,
        registry: ResourceRegistry,
        events: EventSink,
        package_size: u64,
        settings: PipelineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            url,
            store,
            source,
            registry,
            events,
            package_size,
            settings,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            on_idle: Mutex::new(None),
        })
    }

    /// Called whenever the last pending request completes or is cancelled.
    pub fn set_idle_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_idle.lock() = Some(Box::new(hook));
    }

    /// Start serving `request` on a new pipeline bound to the shared store.
    pub fn read(self: &Arc<Self>, request: ReadRequest) -> LoadHandle {
        let content_length = self.store.content_meta().map(|m| m.content_length);
        let actions = match request.resolve(content_length) {
            Some(range) => plan_actions(range, &self.store.fragments(), self.package_size),
            None => Vec::new(),
        };

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(LOAD_CHANNEL_CAPACITY);
        let pipeline = Arc::new(DownloadPipeline::new(
            id,
            self.url.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            self.events.clone(),
            self.settings,
            tx,
        ));

        let concurrent = {
            let mut pending = self.pending.lock();
            pending.insert(id, Arc::clone(&pipeline));
            self.registry.add(&self.url);
            pending.len()
        };
        info!(
            "read request url={} id={} offset={} length={} to_end={} actions={} concurrent={}",
            self.url,
            id,
            request.offset,
            request.length,
            request.to_end,
            actions.len(),
            concurrent
        );

        let session = Arc::downgrade(self);
        pipeline.start(
            actions,
            Box::new(move || {
                if let Some(session) = session.upgrade() {
                    session.complete(id);
                }
            }),
        );

        LoadHandle {
            id,
            events: rx,
            session: Arc::downgrade(self),
            finished: false,
        }
    }

    /// Cancel one request. Returns false if it already finished.
    pub fn cancel(&self, id: u64) -> bool {
        let (pipeline, now_idle) = {
            let mut pending = self.pending.lock();
            let pipeline = pending.remove(&id);
            let now_idle = pipeline.is_some() && pending.is_empty();
            if now_idle {
                self.registry.remove(&self.url);
            }
            (pipeline, now_idle)
        };

        let pipeline = match pipeline {
            Some(pipeline) => pipeline,
            None => return false,
        };
        pipeline.cancel();
        debug!("read request cancelled url={} id={}", self.url, id);
        if now_idle {
            self.notify_idle();
        }
        true
    }

    /// Cancel every pending request.
    pub fn cancel_all(&self) {
        let pipelines: Vec<_> = {
            let mut pending = self.pending.lock();
            let drained = pending.drain().map(|(_, p)| p).collect();
            self.registry.remove(&self.url);
            drained
        };
        for pipeline in &pipelines {
            pipeline.cancel();
        }
        if !pipelines.is_empty() {
            info!("cancelled {} requests url={}", pipelines.len(), self.url);
            self.notify_idle();
        }
    }

    fn complete(&self, id: u64) {
        let now_idle = {
            let mut pending = self.pending.lock();
            let removed = pending.remove(&id).is_some();
            let now_idle = removed && pending.is_empty();
            if now_idle {
                self.registry.remove(&self.url);
            }
            now_idle
        };
        if now_idle {
            debug!("session idle url={}", self.url);
            self.notify_idle();
        }
    }

    fn notify_idle(&self) {
        if let Some(hook) = self.on_idle.lock().as_ref() {
            hook();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn store(&self) -> &Arc<CacheFileStore> {
        &self.store
    }

    pub fn record(&self) -> CacheRecord {
        self.store.snapshot()
    }
}

impl Drop for ResourceSession {
    fn drop(&mut self) {
        debug!("ResourceSession {} dropped", self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_without_content_length() {
        let req = ReadRequest::to_end(10, 100);
        assert_eq!(req.resolve(None), ByteRange::new(10, 110));
        assert_eq!(ReadRequest::probe().resolve(None), ByteRange::new(0, 2));
    }

    #[test]
    fn test_resolve_to_end_uses_content_length() {
        let req = ReadRequest::to_end(2, 5);
        assert_eq!(req.resolve(Some(1000)), ByteRange::new(2, 1000));
    }

    #[test]
    fn test_resolve_clamps_to_resource_end() {
        assert_eq!(ReadRequest::new(900, 500).resolve(Some(1000)), ByteRange::new(900, 1000));
        assert_eq!(ReadRequest::new(1000, 10).resolve(Some(1000)), None);
        assert_eq!(ReadRequest::new(5, 0).resolve(None), None);
    }
}
