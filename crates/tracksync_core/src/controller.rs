//! Per-resource sync controller.
//!
//! [`SyncClient::attach`] wires one [`Reconciler`], one [`PollScheduler`]
//! and, when a push transport is configured, one [`ChannelSession`] for a
//! resource. Both children write through the same apply lock, so the
//! reconciler's version check is the only thing that orders them.
//!
//! ```rust,ignore
//! let client = SyncClient::new(backend.clone(), backend, SyncConfig::default());
//! let handle = client.attach(snapshot, Policies::new(|run: &Run| run.is_done()));
//!
//! let mut token = handle.on_change(|state| render(state));
//! // ...
//! token.unsubscribe();
//! handle.release();
//! ```

use crate::channel::{ChannelSession, SubscriptionState};
use crate::config::SyncConfig;
use crate::observer::{Observers, Unsubscribe};
use crate::poll::{IntervalPolicy, PhaseInterval, PollScheduler, PollState};
use crate::reconciler::{PhaseClassifier, Reconciler};
use crate::sink::{GoneReason, SyncSignal, SyncSink};
use crate::state::{ClientFields, LocalState};
use crate::transport::{PushTransport, ResourceFetcher};
use crate::types::{Payload, ResourceId, ResourceSnapshot, SnapshotSource};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Caller-supplied policies for one attached resource.
pub struct Policies<P> {
    classifier: Arc<dyn PhaseClassifier<P>>,
    interval: Option<Arc<dyn IntervalPolicy<P>>>,
    client_fields: ClientFields,
}

impl<P: Payload> Policies<P> {
    /// Creates policies with the given phase classifier, the configured
    /// phase intervals and no client fields.
    pub fn new(classifier: impl PhaseClassifier<P> + 'static) -> Self {
        Self {
            classifier: Arc::new(classifier),
            interval: None,
            client_fields: ClientFields::new(),
        }
    }

    /// Overrides the poll interval policy.
    pub fn with_interval(mut self, policy: impl IntervalPolicy<P> + 'static) -> Self {
        self.interval = Some(Arc::new(policy));
        self
    }

    /// Sets the client-only fields carried alongside the payload.
    pub fn with_client_fields(mut self, client_fields: ClientFields) -> Self {
        self.client_fields = client_fields;
        self
    }
}

/// Lifecycle of an attached session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Tracking the resource.
    Live,
    /// The resource can no longer be fetched.
    Gone(GoneReason),
    /// The owner released the session.
    Released,
}

/// Counters kept by a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Snapshots that changed local state.
    pub snapshots_applied: u64,
    /// Snapshots the reconciler ignored as stale or foreign.
    pub snapshots_discarded: u64,
    /// Applied snapshots that came from the poll scheduler.
    pub poll_snapshots: u64,
    /// Applied snapshots that came from the push channel.
    pub push_snapshots: u64,
    /// Change notifications delivered.
    pub notifications: u64,
    /// Snapshots that arrived after the session ended.
    pub late_snapshots: u64,
}

/// Entry point for attaching resources.
///
/// Holds the fetch endpoint, the optional push transport and the
/// configuration shared by every session it creates.
pub struct SyncClient<P> {
    fetcher: Arc<dyn ResourceFetcher<P>>,
    transport: Option<Arc<dyn PushTransport<P>>>,
    config: SyncConfig,
}

impl<P> Clone for SyncClient<P> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            transport: self.transport.clone(),
            config: self.config.clone(),
        }
    }
}

impl<P: Payload> SyncClient<P> {
    /// Creates a client that polls `fetcher` and subscribes to `transport`.
    pub fn new(
        fetcher: impl ResourceFetcher<P> + 'static,
        transport: impl PushTransport<P> + 'static,
        config: SyncConfig,
    ) -> Self {
        Self::from_shared(Arc::new(fetcher), Some(Arc::new(transport)), config)
    }

    /// Creates a client that only polls.
    pub fn poll_only(fetcher: impl ResourceFetcher<P> + 'static, config: SyncConfig) -> Self {
        Self::from_shared(Arc::new(fetcher), None, config)
    }

    /// Creates a client from shared endpoints.
    pub fn from_shared(
        fetcher: Arc<dyn ResourceFetcher<P>>,
        transport: Option<Arc<dyn PushTransport<P>>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            fetcher,
            transport,
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Starts tracking the resource `initial` was fetched from.
    ///
    /// Must be called from within a tokio runtime. When `initial` is
    /// already terminal no poll loop or channel is started; the handle
    /// still serves [`current`](SyncHandle::current).
    pub fn attach(&self, initial: ResourceSnapshot<P>, policies: Policies<P>) -> SyncHandle<P> {
        let resource_id = initial.resource_id.clone();
        let reconciler = Reconciler::from_shared(policies.classifier);
        let local = reconciler.initial(initial, policies.client_fields);
        let interval: Arc<dyn IntervalPolicy<P>> = match policies.interval {
            Some(policy) => policy,
            None => Arc::new(PhaseInterval::from(&self.config.poll)),
        };

        let channel = match &self.transport {
            Some(_) if self.config.channel.enabled => Some(ChannelSession::new(
                resource_id.clone(),
                self.config.channel.clone(),
            )),
            _ => None,
        };

        let shared = Arc::new(ControllerShared {
            resource_id: resource_id.clone(),
            config: self.config.clone(),
            reconciler,
            local: RwLock::new(Arc::clone(&local)),
            apply_lock: Mutex::new(()),
            status: RwLock::new(SessionStatus::Live),
            stats: Mutex::new(SyncStats::default()),
            changes: Observers::new(),
            signals: Observers::new(),
            poll: PollScheduler::new(resource_id.clone(), self.config.poll.clone()),
            channel,
        });

        if local.is_terminal() {
            info!(
                resource_id = %resource_id,
                version = local.last_applied_version().get(),
                "resource already terminal, not tracking"
            );
        } else {
            let sink: Arc<dyn SyncSink<P>> = Arc::new(ControllerSink {
                shared: Arc::downgrade(&shared),
            });
            shared
                .poll
                .start(Arc::clone(&self.fetcher), interval, &local, Arc::clone(&sink));
            if let (Some(channel), Some(transport)) = (&shared.channel, &self.transport) {
                channel.open(Arc::clone(transport), sink);
            }
            info!(
                resource_id = %resource_id,
                version = local.last_applied_version().get(),
                push = shared.channel.is_some(),
                "resource attached"
            );
        }

        SyncHandle {
            controller: Arc::new(SyncController { shared }),
        }
    }
}

impl<P> fmt::Debug for SyncClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("push", &self.transport.is_some())
            .field("config", &self.config)
            .finish()
    }
}

struct ControllerShared<P> {
    resource_id: ResourceId,
    config: SyncConfig,
    reconciler: Reconciler<P>,
    local: RwLock<Arc<LocalState<P>>>,
    apply_lock: Mutex<()>,
    status: RwLock<SessionStatus>,
    stats: Mutex<SyncStats>,
    changes: Observers<Arc<LocalState<P>>>,
    signals: Observers<SyncSignal>,
    poll: PollScheduler,
    channel: Option<ChannelSession>,
}

impl<P: Payload> ControllerShared<P> {
    fn apply(&self, snapshot: ResourceSnapshot<P>) -> Option<Arc<LocalState<P>>> {
        let _guard = self.apply_lock.lock();

        // Held until the new state is stored so `release` waits for an
        // apply already past this check.
        let status = self.status.read();
        if *status != SessionStatus::Live {
            self.stats.lock().late_snapshots += 1;
            debug!(
                resource_id = %self.resource_id,
                version = snapshot.version.get(),
                source = %snapshot.source,
                "discarding snapshot after session ended"
            );
            return None;
        }

        let source = snapshot.source;
        let current = Arc::clone(&*self.local.read());
        let next = self.reconciler.merge(&current, snapshot);
        if Arc::ptr_eq(&current, &next) {
            self.stats.lock().snapshots_discarded += 1;
            return Some(next);
        }

        *self.local.write() = Arc::clone(&next);
        {
            let mut stats = self.stats.lock();
            stats.snapshots_applied += 1;
            stats.notifications += 1;
            match source {
                SnapshotSource::Poll => stats.poll_snapshots += 1,
                SnapshotSource::Push => stats.push_snapshots += 1,
            }
        }
        debug!(
            resource_id = %self.resource_id,
            version = next.last_applied_version().get(),
            source = %source,
            "snapshot applied"
        );

        if next.is_terminal() && !current.is_terminal() {
            info!(
                resource_id = %self.resource_id,
                version = next.last_applied_version().get(),
                "resource reached terminal phase"
            );
            self.poll.stop();
            if let Some(channel) = &self.channel {
                channel.drain_and_close(self.config.terminal_drain);
            }
        }
        drop(status);

        self.changes.notify(&next);
        Some(next)
    }

    fn resource_gone(&self, reason: GoneReason) {
        let _guard = self.apply_lock.lock();
        {
            let mut status = self.status.write();
            if *status != SessionStatus::Live {
                return;
            }
            *status = SessionStatus::Gone(reason);
        }

        info!(resource_id = %self.resource_id, %reason, "resource gone, session ended");
        self.teardown();
        self.signals.notify(&SyncSignal::ResourceGone { reason });
    }

    fn attempts_exhausted(&self, attempts: u64) {
        if *self.status.read() != SessionStatus::Live {
            return;
        }
        warn!(resource_id = %self.resource_id, attempts, "polling exhausted, push channel only");
        self.signals.notify(&SyncSignal::PollingExhausted { attempts });
    }

    /// Blocks while an apply is storing a new state, so nothing is applied
    /// once this returns.
    fn release(&self) {
        {
            let mut status = self.status.write();
            if *status == SessionStatus::Live {
                *status = SessionStatus::Released;
                info!(resource_id = %self.resource_id, "resource released");
            }
        }
        self.teardown();
        self.changes.clear();
        self.signals.clear();
    }

    fn teardown(&self) {
        self.poll.stop();
        if let Some(channel) = &self.channel {
            channel.close();
        }
    }
}

struct ControllerSink<P> {
    shared: Weak<ControllerShared<P>>,
}

impl<P: Payload> SyncSink<P> for ControllerSink<P> {
    fn apply(&self, snapshot: ResourceSnapshot<P>) -> Option<Arc<LocalState<P>>> {
        self.shared.upgrade()?.apply(snapshot)
    }

    fn resource_gone(&self, reason: GoneReason) {
        if let Some(shared) = self.shared.upgrade() {
            shared.resource_gone(reason);
        }
    }

    fn attempts_exhausted(&self, attempts: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.attempts_exhausted(attempts);
        }
    }
}

/// Owner of the shared state; releases it when the last handle goes away.
struct SyncController<P: Payload> {
    shared: Arc<ControllerShared<P>>,
}

impl<P: Payload> Drop for SyncController<P> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Handle to an attached resource.
///
/// Clones share one session. Dropping the last clone releases it.
pub struct SyncHandle<P: Payload> {
    controller: Arc<SyncController<P>>,
}

impl<P: Payload> Clone for SyncHandle<P> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
        }
    }
}

impl<P: Payload> SyncHandle<P> {
    fn shared(&self) -> &ControllerShared<P> {
        &self.controller.shared
    }

    /// Returns the tracked resource's identifier.
    pub fn resource_id(&self) -> &ResourceId {
        &self.shared().resource_id
    }

    /// Returns the current local state.
    pub fn current(&self) -> Arc<LocalState<P>> {
        Arc::clone(&*self.shared().local.read())
    }

    /// Registers a callback invoked once per state change.
    pub fn on_change(
        &self,
        callback: impl Fn(&Arc<LocalState<P>>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.shared().changes.subscribe(callback)
    }

    /// Registers a callback for out-of-band signals.
    pub fn on_signal(&self, callback: impl Fn(&SyncSignal) + Send + Sync + 'static) -> Unsubscribe {
        self.shared().signals.subscribe(callback)
    }

    /// Stops tracking. Idempotent. Snapshots that arrive afterwards are
    /// discarded.
    pub fn release(&self) {
        self.shared().release();
    }

    /// Returns the session status.
    pub fn status(&self) -> SessionStatus {
        *self.shared().status.read()
    }

    /// Returns true while the session is live.
    pub fn is_live(&self) -> bool {
        self.status() == SessionStatus::Live
    }

    /// Returns the controller's counters.
    pub fn stats(&self) -> SyncStats {
        *self.shared().stats.lock()
    }

    /// Returns the poll scheduler state.
    pub fn poll_state(&self) -> PollState {
        self.shared().poll.state()
    }

    /// Returns the channel state, or `None` when no channel is configured.
    pub fn subscription_state(&self) -> Option<SubscriptionState> {
        self.shared().channel.as_ref().map(ChannelSession::state)
    }
}

impl<P: Payload> fmt::Debug for SyncHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHandle")
            .field("resource_id", self.resource_id())
            .field("status", &self.status())
            .finish()
    }
}
