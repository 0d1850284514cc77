//! Adaptive poll scheduler.
//!
//! The scheduler waits one interval, fetches, hands the result to its sink
//! and derives the next interval from the reconciled state. Fetches never
//! overlap: the next interval is only computed once the previous fetch has
//! resolved.

use crate::config::PollConfig;
use crate::sink::{GoneReason, SyncSink};
use crate::state::{LocalState, Phase};
use crate::transport::{Fetched, ResourceFetcher};
use crate::types::{Payload, ResourceId, ResourceSnapshot};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Chooses the delay before the next fetch.
///
/// Closures `Fn(&LocalState<P>) -> Duration` are policies.
pub trait IntervalPolicy<P>: Send + Sync {
    /// Returns the delay to wait after a fetch that produced `local`.
    fn interval(&self, local: &LocalState<P>) -> Duration;
}

impl<P, F> IntervalPolicy<P> for F
where
    F: Fn(&LocalState<P>) -> Duration + Send + Sync,
{
    fn interval(&self, local: &LocalState<P>) -> Duration {
        self(local)
    }
}

/// Interval chosen by phase: short while active, long once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInterval {
    /// Interval while active.
    pub active: Duration,
    /// Interval once terminal.
    pub terminal: Duration,
    /// Interval while the phase is unknown.
    pub unknown: Duration,
}

impl From<&PollConfig> for PhaseInterval {
    fn from(config: &PollConfig) -> Self {
        Self {
            active: config.active_interval,
            terminal: config.terminal_interval,
            unknown: config.unknown_interval,
        }
    }
}

impl Default for PhaseInterval {
    fn default() -> Self {
        Self::from(&PollConfig::default())
    }
}

impl<P> IntervalPolicy<P> for PhaseInterval {
    fn interval(&self, local: &LocalState<P>) -> Duration {
        match local.phase() {
            Phase::Active => self.active,
            Phase::Terminal => self.terminal,
            Phase::Unknown => self.unknown,
        }
    }
}

/// Observable state of a poll scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollState {
    /// Delay before the next fetch.
    pub interval: Duration,
    /// Fetches issued so far.
    pub attempts_so_far: u64,
    /// Attempt ceiling, if any.
    pub max_attempts: Option<u64>,
    /// When the last fetch was issued.
    pub last_fetch_at: Option<Instant>,
    /// Fetches that failed with a transport error.
    pub failed_fetches: u64,
    /// Whether the scheduler loop is running.
    pub running: bool,
}

/// Issues fetches for one resource at an adaptive interval.
pub struct PollScheduler {
    resource_id: ResourceId,
    config: PollConfig,
    state: Arc<RwLock<PollState>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    /// Creates an idle scheduler.
    pub fn new(resource_id: ResourceId, config: PollConfig) -> Self {
        let (stop, _) = watch::channel(false);
        let state = PollState {
            interval: config.active_interval,
            attempts_so_far: 0,
            max_attempts: config.max_attempts,
            last_fetch_at: None,
            failed_fetches: 0,
            running: false,
        };

        Self {
            resource_id,
            config,
            state: Arc::new(RwLock::new(state)),
            stop,
            task: Mutex::new(None),
        }
    }

    /// Starts the poll loop on the current tokio runtime.
    ///
    /// The first fetch happens one interval after `initial`, which the
    /// caller has just fetched. Starting twice, or after [`stop`], does
    /// nothing.
    ///
    /// [`stop`]: PollScheduler::stop
    pub fn start<P: Payload>(
        &self,
        fetcher: Arc<dyn ResourceFetcher<P>>,
        policy: Arc<dyn IntervalPolicy<P>>,
        initial: &LocalState<P>,
        sink: Arc<dyn SyncSink<P>>,
    ) {
        let mut task = self.task.lock();
        if task.is_some() || *self.stop.borrow() {
            debug!(resource_id = %self.resource_id, "poll scheduler already started or stopped");
            return;
        }

        let interval = policy.interval(initial);
        {
            let mut state = self.state.write();
            state.interval = interval;
            state.running = true;
        }

        let worker = PollWorker {
            resource_id: self.resource_id.clone(),
            config: self.config.clone(),
            fetcher,
            policy,
            sink,
            state: Arc::clone(&self.state),
            stop: self.stop.subscribe(),
        };
        *task = Some(tokio::spawn(worker.run(interval)));
    }

    /// Stops polling. Idempotent.
    ///
    /// A fetch still in flight is abandoned; its response is never applied.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            debug!(resource_id = %self.resource_id, "poll scheduler stopped");
        }
        self.state.write().running = false;
    }

    /// Returns a copy of the scheduler state.
    pub fn state(&self) -> PollState {
        self.state.read().clone()
    }

    /// Returns true while the loop is running.
    pub fn is_running(&self) -> bool {
        self.state.read().running
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

struct PollWorker<P> {
    resource_id: ResourceId,
    config: PollConfig,
    fetcher: Arc<dyn ResourceFetcher<P>>,
    policy: Arc<dyn IntervalPolicy<P>>,
    sink: Arc<dyn SyncSink<P>>,
    state: Arc<RwLock<PollState>>,
    stop: watch::Receiver<bool>,
}

impl<P: Payload> PollWorker<P> {
    async fn run(mut self, mut interval: Duration) {
        loop {
            let attempts = self.state.read().attempts_so_far;
            if let Some(max) = self.config.max_attempts {
                if attempts >= max {
                    warn!(
                        resource_id = %self.resource_id,
                        attempts,
                        "poll attempt ceiling reached, polling stopped"
                    );
                    self.sink.attempts_exhausted(attempts);
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let attempt = {
                let mut state = self.state.write();
                state.attempts_so_far += 1;
                state.last_fetch_at = Some(Instant::now());
                state.attempts_so_far
            };
            if attempt == self.config.warn_after_attempts {
                warn!(
                    resource_id = %self.resource_id,
                    attempt,
                    "resource still polled after many attempts"
                );
            }

            let result = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => break,
                result = self.fetcher.fetch(&self.resource_id) => result,
            };

            match result {
                Ok(Fetched::Found { payload, version }) => {
                    let snapshot =
                        ResourceSnapshot::poll(self.resource_id.clone(), version, payload);
                    let Some(local) = self.sink.apply(snapshot) else {
                        debug!(resource_id = %self.resource_id, "poll sink detached");
                        break;
                    };
                    interval = self.policy.interval(&local);
                    self.state.write().interval = interval;
                }
                Ok(Fetched::NotFound) => {
                    info!(resource_id = %self.resource_id, "resource not found, polling stopped");
                    self.sink.resource_gone(GoneReason::NotFound);
                    break;
                }
                Ok(Fetched::Forbidden) => {
                    info!(resource_id = %self.resource_id, "resource forbidden, polling stopped");
                    self.sink.resource_gone(GoneReason::Forbidden);
                    break;
                }
                Err(e) => {
                    self.state.write().failed_fetches += 1;
                    if e.is_retryable() {
                        debug!(
                            resource_id = %self.resource_id,
                            attempt,
                            error = %e,
                            "poll fetch failed"
                        );
                    } else {
                        warn!(
                            resource_id = %self.resource_id,
                            attempt,
                            error = %e,
                            "poll fetch failed"
                        );
                    }
                }
            }
        }

        self.state.write().running = false;
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // A dropped sender means the scheduler itself is gone.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::Reconciler;
    use crate::state::ClientFields;

    fn local(status: &'static str) -> LocalState<&'static str> {
        let state = Reconciler::new(|s: &&'static str| *s == "complete").initial(
            ResourceSnapshot::poll(ResourceId::new("run-1"), 1, status),
            ClientFields::new(),
        );
        (*state).clone()
    }

    #[test]
    fn phase_interval_follows_phase() {
        let policy = PhaseInterval::default();
        assert_eq!(policy.interval(&local("processing")), Duration::from_secs(3));
        assert_eq!(policy.interval(&local("complete")), Duration::from_secs(30));
    }

    #[test]
    fn closures_are_policies() {
        let policy = |state: &LocalState<&'static str>| {
            Duration::from_millis(100 * state.last_applied_version().get())
        };
        assert_eq!(policy.interval(&local("queued")), Duration::from_millis(100));
    }

    #[test]
    fn new_scheduler_is_idle() {
        let scheduler = PollScheduler::new(
            ResourceId::new("run-1"),
            PollConfig::new().with_max_attempts(5),
        );
        let state = scheduler.state();

        assert!(!state.running);
        assert_eq!(state.attempts_so_far, 0);
        assert_eq!(state.max_attempts, Some(5));
        assert_eq!(state.last_fetch_at, None);
    }

    #[test]
    fn stop_is_idempotent() {
        let scheduler = PollScheduler::new(ResourceId::new("run-1"), PollConfig::new());
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
