//! Cluster presence store and bus.
//!
//! Presence is a set of `active.<username>` records in a shared key-value
//! store. Uniqueness is enforced by the store's atomic create-if-absent, not
//! by any node. The bus is a single global publish/subscribe channel of
//! plain text lines.
//!
//! [`MemoryHub`] is the in-process implementation. Each node talks to it
//! through its own [`MemoryLink`], the way it would hold its own connection
//! to an external store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Key prefix of presence records.
pub const PRESENCE_PREFIX: &str = "active.";

/// Default bus capacity per subscriber before it starts lagging.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// The presence key for `user`.
#[must_use]
pub fn presence_key(user: &str) -> String {
    format!("{PRESENCE_PREFIX}{user}")
}

/// The username a presence key belongs to.
#[must_use]
pub fn user_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(PRESENCE_PREFIX)
}

/// Presence store and bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// This node's connection to the store was closed.
    #[error("store connection closed")]
    Closed,

    /// The store did not answer in time.
    #[error("store request timed out")]
    Timeout,

    /// The store rejected the request.
    #[error("store error: {0}")]
    Backend(String),
}

/// One page of an incremental key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Matching keys, sorted.
    pub keys: Vec<String>,
    /// Cursor for the next page; `None` once the scan is complete.
    pub next: Option<String>,
}

/// A shared key-value store with atomic create-if-absent.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Create `key` with `value` only if it does not exist.
    ///
    /// Returns `true` if this call created the record.
    async fn claim(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Check whether `key` exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// The value stored under `key`.
    async fn owner(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key`.
    ///
    /// Returns `true` if the record existed.
    async fn release(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only while it still holds `value`.
    ///
    /// Returns `true` if this call deleted the record.
    async fn release_if(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Fetch up to `count` keys starting with `prefix` and sorting after `after`.
    async fn scan(
        &self,
        prefix: &str,
        after: Option<String>,
        count: usize,
    ) -> Result<ScanPage, StoreError>;
}

/// A single global publish/subscribe channel.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish one line to every subscriber, including this node's own.
    ///
    /// Returns the number of subscribers that will receive it, when known.
    async fn publish(&self, line: &str) -> Result<usize, StoreError>;

    /// Start receiving every line published after this call returns.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, StoreError>;

    /// Release this node's connection. Open subscriptions end.
    async fn close(&self);
}

/// A live bus subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next line.
    ///
    /// Returns `Ok(None)` when the bus was closed deliberately, and an error
    /// when the connection to it failed.
    async fn recv(&mut self) -> Result<Option<String>, StoreError>;
}

/// Collect every key with `prefix`, one page of `count` at a time.
///
/// # Errors
///
/// Returns the first store error encountered.
pub async fn scan_all(
    store: &dyn PresenceStore,
    prefix: &str,
    count: usize,
) -> Result<Vec<String>, StoreError> {
    let mut keys = Vec::new();
    let mut cursor = None;
    loop {
        let page = store.scan(prefix, cursor, count.max(1)).await?;
        keys.extend(page.keys);
        match page.next {
            Some(next) => cursor = Some(next),
            None => return Ok(keys),
        }
    }
}

struct HubInner {
    records: DashMap<String, String>,
    bus: broadcast::Sender<Arc<str>>,
}

/// In-process presence store and bus shared by every node that links to it.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create an empty hub whose subscribers buffer `capacity` lines.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                records: DashMap::new(),
                bus,
            }),
        }
    }

    /// Open a new connection to this hub.
    #[must_use]
    pub fn link(&self) -> MemoryLink {
        MemoryLink {
            hub: self.clone(),
            closed: CancellationToken::new(),
        }
    }

    /// Number of presence records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.inner.records.len()
    }

    /// Create `key` only if absent.
    pub fn claim(&self, key: &str, value: &str) -> bool {
        match self.inner.records.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                debug!(key = %key, "Presence record created");
                true
            }
        }
    }

    /// Check whether `key` exists.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.inner.records.contains_key(key)
    }

    /// The value stored under `key`.
    #[must_use]
    pub fn owner(&self, key: &str) -> Option<String> {
        self.inner.records.get(key).map(|value| value.clone())
    }

    /// Delete `key` if it holds `value`.
    pub fn release_if(&self, key: &str, value: &str) -> bool {
        let removed = self
            .inner
            .records
            .remove_if(key, |_, current| current == value)
            .is_some();
        if removed {
            debug!(key = %key, "Presence record deleted");
        }
        removed
    }

    /// Delete `key`.
    pub fn release(&self, key: &str) -> bool {
        let removed = self.inner.records.remove(key).is_some();
        if removed {
            debug!(key = %key, "Presence record deleted");
        }
        removed
    }

    /// One page of keys with `prefix` strictly after `after`.
    #[must_use]
    pub fn scan(&self, prefix: &str, after: Option<&str>, count: usize) -> ScanPage {
        let count = count.max(1);
        let mut keys: Vec<String> = self
            .inner
            .records
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .filter(|key| after.map_or(true, |after| key.as_str() > after))
            .collect();
        keys.sort_unstable();

        let next = if keys.len() > count {
            keys.truncate(count);
            keys.last().cloned()
        } else {
            None
        };
        ScanPage { keys, next }
    }

    /// Publish a line. Returns the number of receivers.
    pub fn publish(&self, line: &str) -> usize {
        self.inner.bus.send(Arc::from(line)).unwrap_or_default()
    }

    /// A raw receiver for bus lines.
    #[must_use]
    pub fn subscribe_lines(&self) -> broadcast::Receiver<Arc<str>> {
        self.inner.bus.subscribe()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's connection to a [`MemoryHub`].
pub struct MemoryLink {
    hub: MemoryHub,
    closed: CancellationToken,
}

impl MemoryLink {
    /// Whether [`Bus::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryLink {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn claim(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.hub.claim(key, value))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.hub.exists(key))
    }

    async fn owner(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.hub.owner(key))
    }

    async fn release(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.hub.release(key))
    }

    async fn release_if(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.hub.release_if(key, value))
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<String>,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        self.check()?;
        Ok(self.hub.scan(prefix, after.as_deref(), count))
    }
}

#[async_trait]
impl Bus for MemoryLink {
    async fn publish(&self, line: &str) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.hub.publish(line))
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, StoreError> {
        self.check()?;
        Ok(Box::new(MemorySubscription {
            rx: self.hub.subscribe_lines(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.cancel();
        debug!("Memory hub link closed");
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Arc<str>>,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Option<String>, StoreError> {
        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => return Ok(None),
                received = self.rx.recv() => match received {
                    Ok(line) => return Ok(Some(line.to_string())),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bus subscriber lagged");
                    }
                    Err(RecvError::Closed) => return Ok(None),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_keys() {
        assert_eq!(presence_key("bob"), "active.bob");
        assert_eq!(user_from_key("active.bob"), Some("bob"));
        assert_eq!(user_from_key("other.bob"), None);
    }

    #[tokio::test]
    async fn test_claim_is_unique_across_links() {
        let hub = MemoryHub::new();
        let (one, two) = (hub.link(), hub.link());

        assert!(one.claim("active.bob", "bob").await.unwrap());
        assert!(!two.claim("active.bob", "bob").await.unwrap());
        assert!(two.exists("active.bob").await.unwrap());

        assert!(two.release("active.bob").await.unwrap());
        assert!(!one.release("active.bob").await.unwrap());
        assert!(one.claim("active.bob", "bob").await.unwrap());
        assert_eq!(hub.record_count(), 1);
    }

    #[tokio::test]
    async fn test_release_if_spares_a_newer_claim() {
        let hub = MemoryHub::new();
        let link = hub.link();

        assert!(link.claim("active.bob", "node-a/1/1").await.unwrap());
        assert_eq!(link.owner("active.bob").await.unwrap().as_deref(), Some("node-a/1/1"));
        assert!(link.release("active.bob").await.unwrap());
        assert!(link.claim("active.bob", "node-b/0/1").await.unwrap());

        assert!(!link.release_if("active.bob", "node-a/1/1").await.unwrap());
        assert!(hub.exists("active.bob"));
        assert!(link.release_if("active.bob", "node-b/0/1").await.unwrap());
        assert_eq!(link.owner("active.bob").await.unwrap(), None);

        link.close().await;
        assert_eq!(link.release_if("active.bob", "x").await, Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let hub = MemoryHub::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let link = hub.link();
            tasks.push(tokio::spawn(async move {
                link.claim("active.bob", "bob").await.unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_scan_pages_through_prefix() {
        let hub = MemoryHub::new();
        for i in 0..250 {
            hub.claim(&presence_key(&format!("user{i:03}")), "x");
        }
        hub.claim("session.other", "x");

        let first = hub.scan(PRESENCE_PREFIX, None, 100);
        assert_eq!(first.keys.len(), 100);
        assert_eq!(first.next.as_deref(), Some("active.user099"));

        let link = hub.link();
        let all = scan_all(&link, PRESENCE_PREFIX, 100).await.unwrap();
        assert_eq!(all.len(), 250);
        assert!(all.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(all.iter().all(|key| key.starts_with(PRESENCE_PREFIX)));
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = MemoryHub::new();
        let (one, two) = (hub.link(), hub.link());
        let mut sub_one = one.subscribe().await.unwrap();
        let mut sub_two = two.subscribe().await.unwrap();

        assert_eq!(one.publish("> bob : hello").await.unwrap(), 2);

        assert_eq!(sub_one.recv().await.unwrap().as_deref(), Some("> bob : hello"));
        assert_eq!(sub_two.recv().await.unwrap().as_deref(), Some("> bob : hello"));
    }

    #[tokio::test]
    async fn test_closed_link_ends_subscriptions_and_rejects_calls() {
        let hub = MemoryHub::new();
        let link = hub.link();
        let mut sub = link.subscribe().await.unwrap();

        link.close().await;

        assert!(link.is_closed());
        assert_eq!(sub.recv().await, Ok(None));
        assert_eq!(link.publish("x").await, Err(StoreError::Closed));
        assert_eq!(link.claim("active.bob", "bob").await, Err(StoreError::Closed));
        // Other links are unaffected.
        assert!(hub.link().claim("active.bob", "bob").await.unwrap());
    }
}
