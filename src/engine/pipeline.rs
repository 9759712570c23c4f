// Sequential action executor: serves cached pieces from disk and streams gaps from the network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::ChunkBuffer;
use super::cache::CacheFileStore;
use super::fragment::ByteRange;
use super::planner::{Action, ActionKind};
use super::progress::{EventSink, ProgressThrottle};
use super::record::ContentMeta;
use crate::config::CacheConfig;
use crate::detect::mime;
use crate::error::{CacheError, CacheResult};
use crate::source::traits::{RangeResponse, RangeSource};

/// What a read request's consumer receives, in order: at most one
/// `ContentInfo`, then `Data` in ascending offset order, then one `Finished`.
#[derive(Debug)]
pub enum LoadEvent {
    ContentInfo(ContentMeta),
    Data(Bytes),
    Finished(CacheResult<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub flush_threshold: usize,
    pub progress_interval: Duration,
}

impl From<&CacheConfig> for PipelineSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            flush_threshold: config.flush_threshold,
            progress_interval: config.progress_interval(),
        }
    }
}

/// Per-run state that does not need to be shared.
struct RunState {
    content_info_sent: bool,
    throttle: ProgressThrottle,
}

pub struct DownloadPipeline {
    id: u64,
    url: String,
    store: Arc<CacheFileStore>,
    source: Arc<dyn RangeSource>,
    events: EventSink,
    settings: PipelineSettings,
    consumer: Mutex<Option<mpsc::Sender<LoadEvent>>>,
    cancel_token: CancellationToken,
}

impl DownloadPipeline {
    pub fn new(
        id: u64,
        url: String,
        store: Arc<CacheFileStore>,
        source: Arc<dyn RangeSource>,
        events: EventSink,
        settings: PipelineSettings,
        consumer: mpsc::Sender<LoadEvent>,
    ) -> Self {
        Self {
            id,
            url,
            store,
            source,
            events,
            settings,
            consumer: Mutex::new(Some(consumer)),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Run `actions` on the tokio runtime. `on_exit` runs once the pipeline has
    /// reported its outcome and persisted the store.
    pub fn start(
        self: &Arc<Self>,
        actions: Vec<Action>,
        on_exit: Box<dyn FnOnce() + Send + 'static>,
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let t0 = Instant::now();
            let action_count = actions.len();
            let result = pipeline.run(actions).await;
            pipeline.finish(result, action_count, t0).await;
            if let Err(e) = pipeline.store.persist() {
                warn!("persist after pipeline {} failed: {}", pipeline.id, e);
            }
            on_exit();
        })
    }

    /// Stop the pipeline and detach its consumer.
    ///
    /// A consumer still attached is told `TransferCancelled`; nothing reaches it afterwards.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
        if let Some(tx) = self.consumer.lock().take() {
            // A full channel drops this event; dropping `tx` still closes the
            // channel, which the handle reports as a cancelled read.
            let _ = tx.try_send(LoadEvent::Finished(Err(CacheError::TransferCancelled)));
        }
        debug!("pipeline {} cancelled url={}", self.id, self.url);
    }

    /// Process the queue one action at a time, yielding between steps.
    async fn run(&self, actions: Vec<Action>) -> CacheResult<()> {
        let mut queue: VecDeque<Action> = actions.into();
        let mut state = RunState {
            content_info_sent: false,
            throttle: ProgressThrottle::new(self.settings.progress_interval),
        };

        while !self.cancel_token.is_cancelled() {
            let action = match queue.pop_front() {
                Some(action) => action,
                None => return Ok(()),
            };
            debug!("pipeline {} processing {}", self.id, action);

            match action.kind {
                ActionKind::Local => self.serve_local(action.range, &mut state).await?,
                ActionKind::Remote => self.fetch_remote(action.range, &mut state).await?,
            }

            tokio::task::yield_now().await;
        }
        Err(CacheError::TransferCancelled)
    }

    async fn finish(&self, result: CacheResult<()>, action_count: usize, t0: Instant) {
        match &result {
            Ok(()) => info!(
                "pipeline {} done url={} actions={} elapsed_ms={}",
                self.id,
                self.url,
                action_count,
                t0.elapsed().as_millis()
            ),
            Err(e) if e.is_cancelled() => {
                debug!("pipeline {} stopped url={}", self.id, self.url)
            }
            Err(e) => {
                warn!("pipeline {} failed url={}: {}", self.id, self.url, e);
                self.events.finished(&self.url, Some(e.to_string()));
            }
        }

        let tx = self.consumer.lock().take();
        if let Some(tx) = tx {
            let event = if self.cancel_token.is_cancelled() {
                LoadEvent::Finished(Err(CacheError::TransferCancelled))
            } else {
                LoadEvent::Finished(result)
            };
            let _ = tx.send(event).await;
        }
    }

    /// Hand one event to the consumer, unless the pipeline was cancelled or the consumer left.
    async fn deliver(&self, event: LoadEvent) -> CacheResult<()> {
        if self.cancel_token.is_cancelled() {
            return Err(CacheError::TransferCancelled);
        }
        let tx = match self.consumer.lock().clone() {
            Some(tx) => tx,
            None => return Err(CacheError::TransferCancelled),
        };
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(CacheError::TransferCancelled),
            sent = tx.send(event) => sent.map_err(|_| CacheError::TransferCancelled),
        }
    }

    async fn announce(&self, meta: ContentMeta, state: &mut RunState) -> CacheResult<()> {
        if state.content_info_sent {
            return Ok(());
        }
        state.content_info_sent = true;
        self.deliver(LoadEvent::ContentInfo(meta)).await
    }

    async fn serve_local(&self, range: ByteRange, state: &mut RunState) -> CacheResult<()> {
        let data = self.store.read(&range)?;
        if let Some(meta) = self.store.content_meta() {
            self.announce(meta, state).await?;
        }
        self.deliver(LoadEvent::Data(data)).await
    }

    async fn fetch_remote(&self, range: ByteRange, state: &mut RunState) -> CacheResult<()> {
        debug!("pipeline {} fetching {} url={}", self.id, range.to_header_value(), self.url);

        let response = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Err(CacheError::TransferCancelled),
            response = self.source.fetch(&self.url, range) => {
                response.map_err(|e| CacheError::Network(e.to_string()))?
            }
        };

        if !mime::is_admissible(response.content_type.as_deref()) {
            let declared = response.content_type.clone().unwrap_or_default();
            warn!("rejecting response url={} type={}", self.url, declared);
            return Err(CacheError::UnsupportedContent(declared));
        }

        let meta = self.ensure_content_meta(&response)?;
        self.announce(meta, state).await?;

        let mut body = response.body;
        let buffer = ChunkBuffer::new(self.settings.flush_threshold);
        let started = Instant::now();
        let mut offset = range.start;

        let streamed: CacheResult<()> = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break Err(CacheError::TransferCancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Some(data) = buffer.push(&chunk) {
                        if let Err(e) = self.commit(data, range, &mut offset, state).await {
                            break Err(e);
                        }
                    }
                    if offset + buffer.buffered() as u64 >= range.end {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(CacheError::Network(e.to_string())),
                None => break Ok(()),
            }
        };
        drop(body);

        let outcome = match streamed {
            Err(CacheError::TransferCancelled) => Err(CacheError::TransferCancelled),
            other => match buffer.flush() {
                Some(rest) => {
                    let flushed = self.commit(rest, range, &mut offset, state).await;
                    other.and(flushed)
                }
                None => other,
            },
        };

        let transferred = offset - range.start;
        if transferred > 0 {
            self.store.record_transfer(transferred, started.elapsed());
            self.store.schedule_persist();
        }

        outcome?;
        if offset < range.end {
            return Err(CacheError::Network(format!(
                "response ended at offset {}, expected {}",
                offset, range.end
            )));
        }

        let record = self.store.snapshot();
        if state.throttle.ready(true) {
            self.events.progress(&record);
        }
        if record.is_complete() {
            self.events.finished(&self.url, None);
        }
        Ok(())
    }

    /// Write a coalesced chunk at the running offset, then pass it on.
    async fn commit(
        &self,
        data: Bytes,
        range: ByteRange,
        offset: &mut u64,
        state: &mut RunState,
    ) -> CacheResult<()> {
        let remaining = range.end.saturating_sub(*offset);
        let data = if data.len() as u64 > remaining {
            data.slice(..remaining as usize)
        } else {
            data
        };
        if data.is_empty() {
            return Ok(());
        }

        self.store.write(&data, *offset)?;
        *offset += data.len() as u64;
        self.store.schedule_persist();

        self.deliver(LoadEvent::Data(data)).await?;

        if state.throttle.ready(false) {
            self.events.progress(&self.store.snapshot());
        }
        Ok(())
    }

    /// Content info of the resource, derived from this response the first time.
    ///
    /// A response reporting a different resource length means the upstream file
    /// was replaced: the stored info is rebuilt, which drops every cached fragment.
    fn ensure_content_meta(&self, response: &RangeResponse) -> CacheResult<ContentMeta> {
        let reported = response.resource_length();
        if let Some(meta) = self.store.content_meta() {
            match reported {
                Some(length) if length != meta.content_length => {
                    warn!(
                        "pipeline {} resource length changed url={} cached={} reported={}",
                        self.id, self.url, meta.content_length, length
                    );
                }
                _ => return Ok(meta),
            }
        }

        let content_length = reported.ok_or_else(|| {
            CacheError::Network(format!("response for {} carries no resource length", self.url))
        })?;
        let meta = ContentMeta {
            content_type: mime::resolve_content_type(response.content_type.as_deref(), &self.url),
            range_supported: response.supports_range(),
            content_length,
        };
        info!(
            "content info url={} type={} length={} ranges={}",
            self.url, meta.content_type, meta.content_length, meta.range_supported
        );
        self.store.set_content_meta(meta.clone())?;
        self.store.schedule_persist();
        Ok(meta)
    }
}
