//! Scripted fetch and push doubles.
//!
//! Both record every call with the tokio clock so tests running on a paused
//! runtime can assert exact timings.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracksync_core::{
    ChannelMessage, ChannelStatus, Fetched, PushTransport, ResourceFetcher, ResourceId,
    Subscription, SubscriptionHandle, SyncError, SyncResult, Version,
};

struct Response<P> {
    result: SyncResult<Fetched<P>>,
    delay: Duration,
}

struct FetcherInner<P> {
    script: VecDeque<Response<P>>,
    fallback: Option<Fetched<P>>,
    calls: Vec<Instant>,
}

/// A fetcher that answers from a queue of scripted responses.
///
/// Once the queue is empty it answers with the fallback, or with a
/// retryable transport error when no fallback is set.
pub struct ScriptedFetcher<P> {
    inner: Arc<Mutex<FetcherInner<P>>>,
}

impl<P> Clone for ScriptedFetcher<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Clone + Send + Sync + 'static> ScriptedFetcher<P> {
    /// Creates a fetcher with an empty script.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FetcherInner {
                script: VecDeque::new(),
                fallback: None,
                calls: Vec::new(),
            })),
        }
    }

    /// Queues a response that resolves after `delay`.
    pub fn push_after(&self, result: SyncResult<Fetched<P>>, delay: Duration) -> &Self {
        self.inner.lock().script.push_back(Response { result, delay });
        self
    }

    /// Queues an immediate `Found` response.
    pub fn push_found(&self, payload: P, version: u64) -> &Self {
        self.push_after(found(payload, version), Duration::ZERO)
    }

    /// Queues a `Found` response that resolves after `delay`.
    pub fn push_found_after(&self, payload: P, version: u64, delay: Duration) -> &Self {
        self.push_after(found(payload, version), delay)
    }

    /// Queues an immediate `NotFound` response.
    pub fn push_not_found(&self) -> &Self {
        self.push_after(Ok(Fetched::NotFound), Duration::ZERO)
    }

    /// Queues an immediate `Forbidden` response.
    pub fn push_forbidden(&self) -> &Self {
        self.push_after(Ok(Fetched::Forbidden), Duration::ZERO)
    }

    /// Queues an immediate error.
    pub fn push_error(&self, error: SyncError) -> &Self {
        self.push_after(Err(error), Duration::ZERO)
    }

    /// Sets the response used once the script runs out.
    pub fn set_fallback(&self, fallback: Fetched<P>) {
        self.inner.lock().fallback = Some(fallback);
    }

    /// Times at which fetches started.
    pub fn calls(&self) -> Vec<Instant> {
        self.inner.lock().calls.clone()
    }

    /// Number of fetches started.
    pub fn call_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Number of scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.inner.lock().script.len()
    }
}

impl<P: Clone + Send + Sync + 'static> Default for ScriptedFetcher<P> {
    fn default() -> Self {
        Self::new()
    }
}

fn found<P>(payload: P, version: u64) -> SyncResult<Fetched<P>> {
    Ok(Fetched::Found {
        payload,
        version: Version::new(version),
    })
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> ResourceFetcher<P> for ScriptedFetcher<P> {
    async fn fetch(&self, _resource_id: &ResourceId) -> SyncResult<Fetched<P>> {
        let response = {
            let mut inner = self.inner.lock();
            inner.calls.push(Instant::now());
            match inner.script.pop_front() {
                Some(response) => response,
                None => Response {
                    result: inner
                        .fallback
                        .clone()
                        .ok_or_else(|| SyncError::transport_retryable("script exhausted")),
                    delay: Duration::ZERO,
                },
            }
        };

        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        response.result
    }
}

/// A call made to a [`ScriptedTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCall {
    /// `subscribe` was called. `binding` is `None` when it failed.
    Subscribe {
        /// When the call was made.
        at: Instant,
        /// Binding number handed out.
        binding: Option<u64>,
    },
    /// A binding's handle was closed.
    Close {
        /// When the handle was closed.
        at: Instant,
        /// Binding that was closed.
        binding: u64,
    },
}

struct TransportInner<P> {
    calls: Vec<TransportCall>,
    senders: Vec<(u64, mpsc::UnboundedSender<ChannelMessage<P>>)>,
    next_binding: u64,
    failing_subscribes: u32,
    auto_connect: bool,
}

/// A push transport driven by the test.
///
/// Events and status changes are sent to the most recent live binding.
pub struct ScriptedTransport<P> {
    inner: Arc<Mutex<TransportInner<P>>>,
}

impl<P> Clone for ScriptedTransport<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Clone + Send + Sync + 'static> ScriptedTransport<P> {
    /// Creates a transport that reports `connected` on every new binding.
    pub fn new() -> Self {
        Self::with_auto_connect(true)
    }

    /// Creates a transport that leaves status reports to the test.
    pub fn manual() -> Self {
        Self::with_auto_connect(false)
    }

    fn with_auto_connect(auto_connect: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransportInner {
                calls: Vec::new(),
                senders: Vec::new(),
                next_binding: 0,
                failing_subscribes: 0,
                auto_connect,
            })),
        }
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.inner.lock().failing_subscribes = count;
    }

    /// Sends an event on the latest binding. Returns false if none is live.
    pub fn send_event(&self, payload: P, version: u64) -> bool {
        self.send(ChannelMessage::Event {
            payload,
            version: Version::new(version),
        })
    }

    /// Sends a status change on the latest binding. Returns false if none
    /// is live.
    pub fn send_status(&self, status: ChannelStatus) -> bool {
        self.send(ChannelMessage::Status(status))
    }

    fn send(&self, message: ChannelMessage<P>) -> bool {
        let inner = self.inner.lock();
        match inner.senders.last() {
            Some((_, tx)) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.lock().calls.clone()
    }

    /// Times of the subscribe calls, failed ones included.
    pub fn subscribe_times(&self) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Subscribe { at, .. } => Some(at),
                TransportCall::Close { .. } => None,
            })
            .collect()
    }

    /// Number of handles closed.
    pub fn close_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, TransportCall::Close { .. }))
            .count()
    }

    /// Number of bindings not yet closed.
    pub fn live_bindings(&self) -> usize {
        self.inner.lock().senders.len()
    }
}

impl<P: Clone + Send + Sync + 'static> Default for ScriptedTransport<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> PushTransport<P> for ScriptedTransport<P> {
    async fn subscribe(&self, _resource_id: &ResourceId) -> SyncResult<Subscription<P>> {
        let mut inner = self.inner.lock();
        let at = Instant::now();

        if inner.failing_subscribes > 0 {
            inner.failing_subscribes -= 1;
            inner.calls.push(TransportCall::Subscribe { at, binding: None });
            return Err(SyncError::transport_retryable("scripted subscribe failure"));
        }

        let binding = inner.next_binding;
        inner.next_binding += 1;
        inner.calls.push(TransportCall::Subscribe {
            at,
            binding: Some(binding),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        if inner.auto_connect {
            let _ = tx.send(ChannelMessage::Status(ChannelStatus::Connected));
        }
        inner.senders.push((binding, tx));

        Ok(Subscription::new(
            rx,
            ScriptedHandle {
                inner: Arc::downgrade(&self.inner),
                binding,
                closed: false,
            },
        ))
    }
}

struct ScriptedHandle<P> {
    inner: Weak<Mutex<TransportInner<P>>>,
    binding: u64,
    closed: bool,
}

impl<P: Send + 'static> SubscriptionHandle for ScriptedHandle<P> {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock();
            inner.senders.retain(|(binding, _)| *binding != self.binding);
            inner.calls.push(TransportCall::Close {
                at: Instant::now(),
                binding: self.binding,
            });
        }
    }
}
