//! Push channel session.
//!
//! A [`ChannelSession`] keeps one subscription to the push transport alive
//! for as long as its owner wants it. It reconnects after every failure with
//! a fixed backoff and never gives up on its own. Every reconnect first
//! closes the previous binding, so at most one binding exists at any time.
//!
//! ```text
//! disconnected ──> connecting ──> connected
//!      ^               ^   │          │
//!      │  clean close  │   │ error    │ erroring / timed_out
//!      └───────────────┼───┴──> erroring <┘
//!                      └── after backoff
//!
//! any ──> closed (teardown)
//! ```

use crate::config::ChannelConfig;
use crate::sink::SyncSink;
use crate::transport::{
    ChannelMessage, ChannelStatus, PushTransport, Subscription, SubscriptionHandle,
};
use crate::types::{Payload, ResourceId, ResourceSnapshot};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection state of a channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Not bound. Either never opened or the server closed the binding.
    Disconnected,
    /// A subscribe call is in progress.
    Connecting,
    /// The transport reported the binding live.
    Connected,
    /// The last binding failed; a reconnect is scheduled.
    Erroring,
    /// Torn down. Absorbing.
    Closed,
}

/// Observable state of a channel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Current connection state.
    pub state: ChannelState,
    /// Consecutive failures since the last `connected` report.
    pub retry_count: u32,
    /// When the next subscribe attempt is due, while one is scheduled.
    pub next_retry_at: Option<Instant>,
    /// Successful subscribe calls over the life of the session.
    pub bindings: u64,
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self {
            state: ChannelState::Disconnected,
            retry_count: 0,
            next_retry_at: None,
            bindings: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Drain(Instant),
    Close,
}

type Binding = Arc<Mutex<Option<Box<dyn SubscriptionHandle>>>>;

/// Owns the push subscription for one resource.
pub struct ChannelSession {
    resource_id: ResourceId,
    config: ChannelConfig,
    state: Arc<RwLock<SubscriptionState>>,
    binding: Binding,
    control: watch::Sender<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSession {
    /// Creates a session that is not yet bound.
    pub fn new(resource_id: ResourceId, config: ChannelConfig) -> Self {
        let (control, _) = watch::channel(Control::Run);
        Self {
            resource_id,
            config,
            state: Arc::new(RwLock::new(SubscriptionState::default())),
            binding: Arc::new(Mutex::new(None)),
            control,
            task: Mutex::new(None),
        }
    }

    /// Starts the session on the current tokio runtime.
    ///
    /// Opening twice, or after the session was closed, does nothing.
    pub fn open<P: Payload>(
        &self,
        transport: Arc<dyn PushTransport<P>>,
        sink: Arc<dyn SyncSink<P>>,
    ) {
        let mut task = self.task.lock();
        if task.is_some() || *self.control.borrow() != Control::Run {
            debug!(resource_id = %self.resource_id, "channel session already opened or closed");
            return;
        }

        let worker = ChannelWorker {
            resource_id: self.resource_id.clone(),
            config: self.config.clone(),
            transport,
            sink,
            state: Arc::clone(&self.state),
            binding: Arc::clone(&self.binding),
            control: self.control.subscribe(),
        };
        *task = Some(tokio::spawn(worker.run()));
    }

    /// Returns a copy of the session state.
    pub fn state(&self) -> SubscriptionState {
        self.state.read().clone()
    }

    /// Keeps delivering events for `grace`, then closes.
    ///
    /// Closes at once when the session is not currently connected.
    pub fn drain_and_close(&self, grace: Duration) {
        let opened = self.task.lock().is_some();
        if !opened || self.state.read().state != ChannelState::Connected {
            self.close();
            return;
        }

        let deadline = Instant::now() + grace;
        let draining = self.control.send_if_modified(|control| {
            if *control == Control::Run {
                *control = Control::Drain(deadline);
                true
            } else {
                false
            }
        });
        if draining {
            debug!(
                resource_id = %self.resource_id,
                grace_ms = grace.as_millis() as u64,
                "channel draining before close"
            );
        }
    }

    /// Tears the session down. Idempotent.
    pub fn close(&self) {
        if self.control.send_replace(Control::Close) != Control::Close {
            debug!(resource_id = %self.resource_id, "channel session closed");
        }
        unbind(&self.binding);

        let mut state = self.state.write();
        state.state = ChannelState::Closed;
        state.next_retry_at = None;
    }

    /// Returns true once the session is closed.
    pub fn is_closed(&self) -> bool {
        self.state.read().state == ChannelState::Closed
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn unbind(binding: &Binding) -> bool {
    match binding.lock().take() {
        Some(mut handle) => {
            handle.close();
            true
        }
        None => false,
    }
}

enum Exit {
    Close,
    Failed(ChannelState),
}

struct ChannelWorker<P> {
    resource_id: ResourceId,
    config: ChannelConfig,
    transport: Arc<dyn PushTransport<P>>,
    sink: Arc<dyn SyncSink<P>>,
    state: Arc<RwLock<SubscriptionState>>,
    binding: Binding,
    control: watch::Receiver<Control>,
}

impl<P: Payload> ChannelWorker<P> {
    async fn run(mut self) {
        loop {
            if *self.control.borrow() != Control::Run {
                break;
            }

            if unbind(&self.binding) {
                debug!(resource_id = %self.resource_id, "unbound previous channel binding");
            }
            if !self.transition(ChannelState::Connecting) {
                break;
            }

            let subscribed = tokio::select! {
                biased;
                _ = closing(&mut self.control) => break,
                result = self.transport.subscribe(&self.resource_id) => result,
            };

            let exit = match subscribed {
                Ok(Subscription { messages, handle }) => {
                    *self.binding.lock() = Some(handle);
                    let bindings = {
                        let mut state = self.state.write();
                        state.bindings += 1;
                        state.bindings
                    };
                    if *self.control.borrow() == Control::Close {
                        break;
                    }
                    debug!(resource_id = %self.resource_id, bindings, "channel bound");
                    self.pump(messages).await
                }
                Err(e) => {
                    warn!(resource_id = %self.resource_id, error = %e, "channel subscribe failed");
                    Exit::Failed(ChannelState::Erroring)
                }
            };

            match exit {
                Exit::Close => break,
                Exit::Failed(failed) => {
                    if !self.backoff(failed).await {
                        break;
                    }
                }
            }
        }

        unbind(&self.binding);
        let mut state = self.state.write();
        state.state = ChannelState::Closed;
        state.next_retry_at = None;
    }

    async fn pump(&mut self, mut messages: mpsc::UnboundedReceiver<ChannelMessage<P>>) -> Exit {
        let mut drain_until = None;

        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Run => {}
                Control::Drain(deadline) => drain_until = Some(deadline),
                Control::Close => return Exit::Close,
            }

            tokio::select! {
                biased;
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return Exit::Close;
                    }
                }
                message = messages.recv() => match message {
                    Some(ChannelMessage::Event { payload, version }) => {
                        let snapshot =
                            ResourceSnapshot::push(self.resource_id.clone(), version, payload);
                        if self.sink.apply(snapshot).is_none() {
                            debug!(resource_id = %self.resource_id, "channel sink detached");
                            return Exit::Close;
                        }
                    }
                    Some(ChannelMessage::Status(status)) => {
                        if let Some(exit) = self.on_status(status) {
                            return exit;
                        }
                    }
                    None => {
                        debug!(resource_id = %self.resource_id, "channel stream ended");
                        return Exit::Failed(ChannelState::Disconnected);
                    }
                },
                _ = sleep_until_opt(drain_until) => {
                    debug!(resource_id = %self.resource_id, "channel drain elapsed");
                    return Exit::Close;
                }
            }
        }
    }

    fn on_status(&self, status: ChannelStatus) -> Option<Exit> {
        match status {
            ChannelStatus::Connecting => {
                self.transition(ChannelState::Connecting);
                None
            }
            ChannelStatus::Connected => {
                let mut state = self.state.write();
                if state.state != ChannelState::Closed {
                    state.state = ChannelState::Connected;
                    state.retry_count = 0;
                    state.next_retry_at = None;
                    info!(resource_id = %self.resource_id, "channel connected");
                }
                None
            }
            ChannelStatus::Erroring | ChannelStatus::TimedOut => {
                warn!(resource_id = %self.resource_id, ?status, "channel failed");
                Some(Exit::Failed(ChannelState::Erroring))
            }
            ChannelStatus::Closed => {
                debug!(resource_id = %self.resource_id, "channel closed by server");
                Some(Exit::Failed(ChannelState::Disconnected))
            }
        }
    }

    /// Records the failure and waits out the backoff. Returns false when the
    /// session should stop instead of reconnecting.
    async fn backoff(&mut self, failed: ChannelState) -> bool {
        let (retry, delay) = {
            let mut state = self.state.write();
            if state.state == ChannelState::Closed {
                return false;
            }
            state.state = failed;
            state.retry_count = state.retry_count.saturating_add(1);
            let delay = self.config.delay_for_attempt(state.retry_count);
            state.next_retry_at = Some(Instant::now() + delay);
            (state.retry_count, delay)
        };

        if *self.control.borrow() != Control::Run {
            return false;
        }

        info!(
            resource_id = %self.resource_id,
            retry,
            delay_ms = delay.as_millis() as u64,
            "channel reconnect scheduled"
        );

        tokio::select! {
            biased;
            _ = closing(&mut self.control) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn transition(&self, next: ChannelState) -> bool {
        let mut state = self.state.write();
        if state.state == ChannelState::Closed {
            return false;
        }
        state.state = next;
        if next == ChannelState::Connecting {
            state.next_retry_at = None;
        }
        true
    }
}

async fn closing(control: &mut watch::Receiver<Control>) {
    let _ = control.wait_for(|control| *control != Control::Run).await;
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SyncError, SyncResult};
    use crate::sink::GoneReason;
    use crate::state::LocalState;
    use async_trait::async_trait;

    struct RefusingTransport;

    #[async_trait]
    impl PushTransport<u32> for RefusingTransport {
        async fn subscribe(&self, _resource_id: &ResourceId) -> SyncResult<Subscription<u32>> {
            Err(SyncError::NotConnected)
        }
    }

    struct NullSink;

    impl SyncSink<u32> for NullSink {
        fn apply(&self, _snapshot: ResourceSnapshot<u32>) -> Option<Arc<LocalState<u32>>> {
            None
        }
        fn resource_gone(&self, _reason: GoneReason) {}
        fn attempts_exhausted(&self, _attempts: u64) {}
    }

    fn session() -> ChannelSession {
        ChannelSession::new(
            ResourceId::new("run-1"),
            ChannelConfig::new().with_reconnect_backoff(Duration::from_secs(2)),
        )
    }

    #[test]
    fn new_session_is_disconnected() {
        let session = session();
        assert_eq!(session.state(), SubscriptionState::default());
        assert!(!session.is_closed());
    }

    #[test]
    fn drain_without_binding_closes_immediately() {
        let session = session();
        session.drain_and_close(Duration::from_secs(5));
        assert!(session.is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let session = session();
        session.close();
        session.close();
        assert_eq!(session.state().state, ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscribe_schedules_fixed_backoff() {
        let session = session();
        session.open(Arc::new(RefusingTransport), Arc::new(NullSink));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = session.state();
        assert_eq!(state.state, ChannelState::Erroring);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.bindings, 0);
        assert!(state.next_retry_at.is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.state().retry_count, 2);

        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn open_after_close_does_nothing() {
        let session = session();
        session.close();
        session.open(Arc::new(RefusingTransport), Arc::new(NullSink));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.state().retry_count, 0);
        assert!(session.is_closed());
    }
}
