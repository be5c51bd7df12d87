use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// A resource that can be asked to shut down.
///
/// `close` must not call back into the [`Registry`] that tracks the resource:
/// [`Registry::close_all`] holds the registry lock while it runs.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self);
}

struct Inner<T: ?Sized> {
    next_id: u64,
    closers: BTreeMap<u64, Arc<T>>,
}

/// Live resources keyed by a per-registry id that is never reused.
pub struct Registry<T: Closer + ?Sized> {
    inner: Mutex<Inner<T>>,
}

impl<T: Closer + ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl<T: Closer + ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Closer + ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                closers: BTreeMap::new(),
            }),
        }
    }

    pub async fn add(&self, c: Arc<T>) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.closers.insert(id, c);
        id
    }

    /// Removes `id`; unknown ids are ignored.
    pub async fn remove(&self, id: u64) {
        self.inner.lock().await.closers.remove(&id);
    }

    /// Closes every tracked resource and empties the registry.
    ///
    /// The lock is held for the whole sweep, so a concurrent `add` lands either
    /// before the sweep (and is closed by it) or after it (and stays tracked).
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        let closers = std::mem::take(&mut inner.closers);
        for c in closers.values() {
            c.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.closers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tracked resources in id order.
    pub async fn snapshot(&self) -> Vec<(u64, Arc<T>)> {
        let inner = self.inner.lock().await;
        inner
            .closers
            .iter()
            .map(|(id, c)| (*id, c.clone()))
            .collect()
    }
}
