//! Boundary traits for the fetch endpoint and the push channel.
//!
//! Both are implemented by the backing-store client, which this crate does
//! not own. [`MemoryBackend`](crate::MemoryBackend) implements both for
//! tests and simulations.

use crate::error::SyncResult;
use crate::types::{ResourceId, Version};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Outcome of fetching a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<P> {
    /// The resource exists and is visible.
    Found {
        /// Current payload.
        payload: P,
        /// Version stamped on the payload.
        version: Version,
    },
    /// The resource no longer exists.
    NotFound,
    /// The caller may no longer see the resource.
    Forbidden,
}

/// On-demand fetch endpoint.
///
/// Implementations must be idempotent and must never return a version older
/// than one they returned before. Transport failures are reported as `Err`
/// and retried by the caller on its next tick.
#[async_trait]
pub trait ResourceFetcher<P>: Send + Sync {
    /// Fetches the current state of a resource.
    async fn fetch(&self, resource_id: &ResourceId) -> SyncResult<Fetched<P>>;
}

/// Connection status reported by a push transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// The transport is establishing the subscription.
    Connecting,
    /// The subscription is live.
    Connected,
    /// The transport failed.
    Erroring,
    /// The transport's connection or acknowledgement timer expired.
    TimedOut,
    /// The server closed the subscription cleanly.
    Closed,
}

/// A message delivered on a push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage<P> {
    /// The resource changed.
    Event {
        /// Payload carried by the event.
        payload: P,
        /// The event's own change marker.
        version: Version,
    },
    /// The transport changed status.
    Status(ChannelStatus),
}

/// Tears down one subscription binding.
pub trait SubscriptionHandle: Send {
    /// Closes the binding. Must be safe to call more than once.
    fn close(&mut self);
}

/// One live binding to the push channel.
pub struct Subscription<P> {
    /// Events and status changes, in delivery order. The stream ending is
    /// treated like a clean server close.
    pub messages: mpsc::UnboundedReceiver<ChannelMessage<P>>,
    /// Handle that unbinds the subscription.
    pub handle: Box<dyn SubscriptionHandle>,
}

impl<P> Subscription<P> {
    /// Creates a subscription from its parts.
    pub fn new(
        messages: mpsc::UnboundedReceiver<ChannelMessage<P>>,
        handle: impl SubscriptionHandle + 'static,
    ) -> Self {
        Self {
            messages,
            handle: Box::new(handle),
        }
    }
}

impl<P> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Push channel endpoint.
#[async_trait]
pub trait PushTransport<P>: Send + Sync {
    /// Subscribes to changes of a resource.
    async fn subscribe(&self, resource_id: &ResourceId) -> SyncResult<Subscription<P>>;
}

/// A subscription handle that does nothing when closed.
///
/// Useful for transports whose bindings end when the receiver is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHandle;

impl SubscriptionHandle for DetachedHandle {
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    struct OfflineTransport;

    #[async_trait]
    impl PushTransport<u32> for OfflineTransport {
        async fn subscribe(&self, _resource_id: &ResourceId) -> SyncResult<Subscription<u32>> {
            Err(SyncError::NotConnected)
        }
    }

    struct OneShotTransport;

    #[async_trait]
    impl PushTransport<u32> for OneShotTransport {
        async fn subscribe(&self, _resource_id: &ResourceId) -> SyncResult<Subscription<u32>> {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(ChannelMessage::Status(ChannelStatus::Connected))
                .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
            tx.send(ChannelMessage::Event {
                payload: 7,
                version: Version::new(3),
            })
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
            Ok(Subscription::new(rx, DetachedHandle))
        }
    }

    #[tokio::test]
    async fn offline_transport_reports_error() {
        let result = OfflineTransport.subscribe(&ResourceId::new("run-1")).await;
        assert!(matches!(result, Err(SyncError::NotConnected)));
    }

    #[tokio::test]
    async fn subscription_delivers_in_order() {
        let mut sub = OneShotTransport
            .subscribe(&ResourceId::new("run-1"))
            .await
            .unwrap();

        assert_eq!(
            sub.messages.recv().await,
            Some(ChannelMessage::Status(ChannelStatus::Connected))
        );
        assert_eq!(
            sub.messages.recv().await,
            Some(ChannelMessage::Event {
                payload: 7,
                version: Version::new(3)
            })
        );
        // Sender dropped with the transport call: stream ends.
        assert_eq!(sub.messages.recv().await, None);
        sub.handle.close();
    }
}
