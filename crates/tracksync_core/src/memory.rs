//! In-memory backend for tests and simulations.
//!
//! [`MemoryBackend`] is an authoritative store that implements both
//! [`ResourceFetcher`] and [`PushTransport`]. Versions come from one
//! monotonic clock shared by all resources. Faults can be injected to
//! exercise the reconnect and retry paths.

use crate::error::{SyncError, SyncResult};
use crate::transport::{
    ChannelMessage, ChannelStatus, Fetched, PushTransport, ResourceFetcher, Subscription,
    SubscriptionHandle,
};
use crate::types::{Payload, ResourceId, ResourceSnapshot, Version};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

struct Entry<P> {
    payload: P,
    version: Version,
    forbidden: bool,
}

struct Subscriber<P> {
    id: u64,
    tx: mpsc::UnboundedSender<ChannelMessage<P>>,
}

struct Inner<P> {
    clock: u64,
    resources: HashMap<ResourceId, Entry<P>>,
    subscribers: HashMap<ResourceId, Vec<Subscriber<P>>>,
    next_subscriber: u64,
    failing_fetches: u32,
    drop_every: Option<u64>,
    published: u64,
    fetches: u64,
}

impl<P> Inner<P> {
    fn tick(&mut self) -> Version {
        self.clock += 1;
        Version::new(self.clock)
    }
}

/// Shared in-memory store. Clones share state.
pub struct MemoryBackend<P> {
    inner: Arc<Mutex<Inner<P>>>,
}

impl<P> Clone for MemoryBackend<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Payload> MemoryBackend<P> {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                clock: 0,
                resources: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber: 0,
                failing_fetches: 0,
                drop_every: None,
                published: 0,
                fetches: 0,
            })),
        }
    }

    /// Stores a resource and returns the snapshot a view would mount with.
    pub fn insert(&self, resource_id: ResourceId, payload: P) -> ResourceSnapshot<P> {
        let mut inner = self.inner.lock();
        let version = inner.tick();
        inner.resources.insert(
            resource_id.clone(),
            Entry {
                payload: payload.clone(),
                version,
                forbidden: false,
            },
        );
        ResourceSnapshot::poll(resource_id, version, payload)
    }

    /// Replaces a resource's payload and pushes the change to subscribers.
    ///
    /// Returns the new version, or `None` if the resource does not exist.
    pub fn update(&self, resource_id: &ResourceId, payload: P) -> Option<Version> {
        let mut inner = self.inner.lock();
        if !inner.resources.contains_key(resource_id) {
            return None;
        }

        let version = inner.tick();
        if let Some(entry) = inner.resources.get_mut(resource_id) {
            entry.payload = payload.clone();
            entry.version = version;
        }

        inner.published += 1;
        let dropped = inner
            .drop_every
            .is_some_and(|n| n > 0 && inner.published % n == 0);
        if dropped {
            debug!(resource_id = %resource_id, version = version.get(), "dropping push event");
            return Some(version);
        }

        if let Some(subscribers) = inner.subscribers.get_mut(resource_id) {
            subscribers.retain(|s| {
                s.tx.send(ChannelMessage::Event {
                    payload: payload.clone(),
                    version,
                })
                .is_ok()
            });
        }
        Some(version)
    }

    /// Deletes a resource. Later fetches report it missing.
    pub fn remove(&self, resource_id: &ResourceId) -> bool {
        self.inner.lock().resources.remove(resource_id).is_some()
    }

    /// Hides a resource from the caller. Later fetches report it forbidden.
    pub fn forbid(&self, resource_id: &ResourceId) -> bool {
        match self.inner.lock().resources.get_mut(resource_id) {
            Some(entry) => {
                entry.forbidden = true;
                true
            }
            None => false,
        }
    }

    /// Returns the authoritative state of a resource.
    pub fn snapshot(&self, resource_id: &ResourceId) -> Option<ResourceSnapshot<P>> {
        self.inner
            .lock()
            .resources
            .get(resource_id)
            .map(|e| ResourceSnapshot::poll(resource_id.clone(), e.version, e.payload.clone()))
    }

    /// Sends `status` to every subscriber of a resource and ends their
    /// streams. Returns how many bindings were broken.
    pub fn break_channels(&self, resource_id: &ResourceId, status: ChannelStatus) -> usize {
        let subscribers = self
            .inner
            .lock()
            .subscribers
            .remove(resource_id)
            .unwrap_or_default();

        for subscriber in &subscribers {
            let _ = subscriber.tx.send(ChannelMessage::Status(status));
        }
        debug!(resource_id = %resource_id, ?status, count = subscribers.len(), "channels broken");
        subscribers.len()
    }

    /// Makes the next `count` fetches fail with a retryable transport error.
    pub fn set_fetch_failing(&self, count: u32) {
        self.inner.lock().failing_fetches = count;
    }

    /// Drops every `n`th published push event. `None` delivers all.
    pub fn set_drop_every(&self, n: Option<u64>) {
        self.inner.lock().drop_every = n;
    }

    /// Number of live push bindings for a resource.
    pub fn subscriber_count(&self, resource_id: &ResourceId) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(resource_id)
            .map_or(0, Vec::len)
    }

    /// Number of fetches served, including failed ones.
    pub fn fetch_count(&self) -> u64 {
        self.inner.lock().fetches
    }
}

impl<P: Payload> Default for MemoryBackend<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for MemoryBackend<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryBackend")
            .field("clock", &inner.clock)
            .field("resources", &inner.resources.len())
            .field("subscribers", &inner.subscribers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[async_trait]
impl<P: Payload> ResourceFetcher<P> for MemoryBackend<P> {
    async fn fetch(&self, resource_id: &ResourceId) -> SyncResult<Fetched<P>> {
        let mut inner = self.inner.lock();
        inner.fetches += 1;

        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(SyncError::transport_retryable("injected fetch failure"));
        }

        Ok(match inner.resources.get(resource_id) {
            None => Fetched::NotFound,
            Some(entry) if entry.forbidden => Fetched::Forbidden,
            Some(entry) => Fetched::Found {
                payload: entry.payload.clone(),
                version: entry.version,
            },
        })
    }
}

#[async_trait]
impl<P: Payload> PushTransport<P> for MemoryBackend<P> {
    async fn subscribe(&self, resource_id: &ResourceId) -> SyncResult<Subscription<P>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelMessage::Status(ChannelStatus::Connecting));
        let _ = tx.send(ChannelMessage::Status(ChannelStatus::Connected));

        let mut inner = self.inner.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner
            .subscribers
            .entry(resource_id.clone())
            .or_default()
            .push(Subscriber { id, tx });

        let handle = MemoryHandle {
            inner: Arc::downgrade(&self.inner),
            resource_id: resource_id.clone(),
            id,
        };
        Ok(Subscription::new(rx, handle))
    }
}

struct MemoryHandle<P> {
    inner: Weak<Mutex<Inner<P>>>,
    resource_id: ResourceId,
    id: u64,
}

impl<P: Payload> SubscriptionHandle for MemoryHandle<P> {
    fn close(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(&self.resource_id) {
            subscribers.retain(|s| s.id != self.id);
            if subscribers.is_empty() {
                inner.subscribers.remove(&self.resource_id);
            }
        }
    }
}
