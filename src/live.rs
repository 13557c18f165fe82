//! Live queries over the document store.
//!
//! A [`Subscription`] delivers the full, filtered and ordered result set of
//! its query: once when first polled, then again after every committed change
//! to its collection. Subscriptions are acquired from [`Storage::subscribe`]
//! and released when dropped. Release happens exactly once per subscription,
//! whether or not a snapshot was ever delivered.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::{Change, Storage};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Collection, filter predicates, ordering and limit of a live query.
pub struct LiveQuery<T> {
    collection: &'static str,
    predicates: Vec<Predicate<T>>,
    order: Option<fn(&mut [T])>,
    limit: Option<usize>,
}

impl<T> LiveQuery<T> {
    pub fn collection(collection: &'static str) -> Self {
        Self {
            collection,
            predicates: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Keep only documents matching `predicate`. Filters combine with AND.
    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Order the result set before the limit is applied.
    pub fn order_by(mut self, order: fn(&mut [T])) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Run the query over a collection read.
    pub fn apply(&self, docs: Vec<T>) -> Vec<T> {
        let mut matched: Vec<T> = docs
            .into_iter()
            .filter(|doc| self.predicates.iter().all(|predicate| predicate(doc)))
            .collect();

        if let Some(order) = self.order {
            order(&mut matched);
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

impl<T> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("collection", &self.collection)
            .field("predicates", &self.predicates.len())
            .field("ordered", &self.order.is_some())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Counts subscriptions acquired and released against one store.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl SubscriptionRegistry {
    fn acquire(&self) -> u64 {
        self.acquired.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Subscriptions currently held open.
    pub fn active(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// One delivery of a live query.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    /// 1 for the initial delivery, incremented on each refresh.
    pub sequence: u64,
    pub docs: Vec<T>,
}

/// Releases its subscription slot when dropped.
struct ReleaseGuard {
    id: u64,
    collection: &'static str,
    registry: Arc<SubscriptionRegistry>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.registry.release();
        debug!(subscription = self.id, collection = self.collection, "Unsubscribed");
    }
}

/// A live query held open against the store.
pub struct Subscription<T> {
    storage: Storage,
    query: LiveQuery<T>,
    changes: broadcast::Receiver<Change>,
    primed: bool,
    delivered: u64,
    guard: ReleaseGuard,
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Snapshots delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Wait until the result set may have changed.
    ///
    /// Resolves immediately the first time so the initial snapshot can be
    /// taken. Cancel-safe: dropping the future loses no notification.
    /// Returns `false` once the store's change feed is gone.
    pub async fn changed(&mut self) -> bool {
        if !self.primed {
            self.primed = true;
            return true;
        }

        loop {
            match self.changes.recv().await {
                Ok(change) if change.collection == self.query.collection => return true,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        subscription = self.guard.id,
                        skipped, "Live query lagged, refreshing"
                    );
                    return true;
                }
                Err(RecvError::Closed) => return false,
            }
        }
    }

    /// Read the current result set.
    pub async fn snapshot(&mut self) -> Result<Snapshot<T>> {
        let docs = self.storage.list::<T>(self.query.collection).await?;
        self.delivered += 1;

        Ok(Snapshot {
            sequence: self.delivered,
            docs: self.query.apply(docs),
        })
    }

    /// Wait for the next snapshot. `None` when the feed has closed.
    pub async fn next(&mut self) -> Result<Option<Snapshot<T>>> {
        if !self.changed().await {
            return Ok(None);
        }
        self.snapshot().await.map(Some)
    }

    /// Release the subscription now rather than at end of scope.
    pub fn unsubscribe(self) {}
}

impl Storage {
    /// Open a live query. The change feed is attached before anything is
    /// read, so no write after this call is missed.
    pub fn subscribe<T: DeserializeOwned>(&self, query: LiveQuery<T>) -> Subscription<T> {
        let changes = self.changes();
        let registry = Arc::clone(self.registry());
        let id = registry.acquire();

        debug!(subscription = id, collection = query.collection, "Subscribed");

        Subscription {
            storage: self.clone(),
            changes,
            primed: false,
            delivered: 0,
            guard: ReleaseGuard {
                id,
                collection: query.collection,
                registry,
            },
            query,
        }
    }

    /// Subscription bookkeeping for this store.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        self.registry()
    }
}
