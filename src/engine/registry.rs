use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// URLs with at least one pending read. Eviction never touches their files.
///
/// Cloning yields another handle to the same set.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    urls: Arc<Mutex<HashSet<String>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the URL was not registered yet.
    pub fn add(&self, url: &str) -> bool {
        self.urls.lock().insert(url.to_string())
    }

    pub fn remove(&self, url: &str) -> bool {
        self.urls.lock().remove(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.lock().contains(url)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.lock().is_empty()
    }
}
