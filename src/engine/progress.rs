// Progress and completion events published for interested observers.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use super::record::CacheRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub url: String,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub download_speed_kbps: f64,
}

impl ProgressEvent {
    pub fn from_record(record: &CacheRecord) -> Self {
        Self {
            url: record.url.clone(),
            progress: record.progress(),
            downloaded_bytes: record.downloaded_bytes(),
            download_speed_kbps: record.download_speed_kbps(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedEvent {
    pub url: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Progress(ProgressEvent),
    Finished(FinishedEvent),
}

/// Publishing side of the event channel. Publishing with no subscribers is a no-op.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CacheEvent) {
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, record: &CacheRecord) {
        self.publish(CacheEvent::Progress(ProgressEvent::from_record(record)));
    }

    pub fn finished(&self, url: &str, error: Option<String>) {
        self.publish(CacheEvent::Finished(FinishedEvent {
            url: url.to_string(),
            error,
        }));
    }
}

/// Rate limiter for progress notifications.
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a notification may go out now. `force` always passes.
    pub fn ready(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = match self.last {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        };
        if due || force {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}
