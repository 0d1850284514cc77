//! A sink that records everything it is handed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracksync_core::{
    ClientFields, GoneReason, LocalState, Payload, PhaseClassifier, Reconciler, ResourceSnapshot,
    SyncSink,
};

/// Records snapshots and signals while reconciling them like a controller
/// would, so schedulers and sessions can be tested on their own.
pub struct RecordingSink<P> {
    reconciler: Reconciler<P>,
    state: Mutex<Arc<LocalState<P>>>,
    snapshots: Mutex<Vec<ResourceSnapshot<P>>>,
    gone: Mutex<Vec<GoneReason>>,
    exhausted: Mutex<Vec<u64>>,
    detached: AtomicBool,
}

impl<P: Payload> RecordingSink<P> {
    /// Creates a sink whose state starts at `initial`.
    pub fn new(
        initial: ResourceSnapshot<P>,
        classifier: impl PhaseClassifier<P> + 'static,
    ) -> Self {
        let reconciler = Reconciler::new(classifier);
        let state = reconciler.initial(initial, ClientFields::new());
        Self {
            reconciler,
            state: Mutex::new(state),
            snapshots: Mutex::new(Vec::new()),
            gone: Mutex::new(Vec::new()),
            exhausted: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
        }
    }

    /// Makes every later `apply` return `None`.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    /// Reconciled state.
    pub fn current(&self) -> Arc<LocalState<P>> {
        Arc::clone(&*self.state.lock())
    }

    /// Every snapshot handed to `apply`, in order.
    pub fn snapshots(&self) -> Vec<ResourceSnapshot<P>> {
        self.snapshots.lock().clone()
    }

    /// Every `resource_gone` report.
    pub fn gone(&self) -> Vec<GoneReason> {
        self.gone.lock().clone()
    }

    /// Every `attempts_exhausted` report.
    pub fn exhausted(&self) -> Vec<u64> {
        self.exhausted.lock().clone()
    }
}

impl<P: Payload> SyncSink<P> for RecordingSink<P> {
    fn apply(&self, snapshot: ResourceSnapshot<P>) -> Option<Arc<LocalState<P>>> {
        if self.detached.load(Ordering::SeqCst) {
            return None;
        }
        self.snapshots.lock().push(snapshot.clone());

        let mut state = self.state.lock();
        let next = self.reconciler.merge(&state, snapshot);
        *state = next;
        Some(Arc::clone(&state))
    }

    fn resource_gone(&self, reason: GoneReason) {
        self.gone.lock().push(reason);
    }

    fn attempts_exhausted(&self, attempts: u64) {
        self.exhausted.lock().push(attempts);
    }
}
