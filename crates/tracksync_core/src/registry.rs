//! Per-process table of attached resources.
//!
//! List views that track many rows at once use a [`SyncRegistry`] to make
//! sure each resource has at most one live session.

use crate::controller::{Policies, SyncClient, SyncHandle};
use crate::error::{SyncError, SyncResult};
use crate::types::{Payload, ResourceId, ResourceSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Live sessions keyed by resource.
pub struct SyncRegistry<P: Payload> {
    client: SyncClient<P>,
    handles: Mutex<HashMap<ResourceId, SyncHandle<P>>>,
}

impl<P: Payload> SyncRegistry<P> {
    /// Creates an empty registry that attaches through `client`.
    pub fn new(client: SyncClient<P>) -> Self {
        Self {
            client,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a resource.
    ///
    /// Fails with [`SyncError::AlreadyAttached`] while a live session for the
    /// same resource exists. A session that has ended is replaced.
    pub fn attach(
        &self,
        initial: ResourceSnapshot<P>,
        policies: Policies<P>,
    ) -> SyncResult<SyncHandle<P>> {
        let mut handles = self.handles.lock();
        let resource_id = initial.resource_id.clone();

        if let Some(existing) = handles.get(&resource_id) {
            if existing.is_live() {
                return Err(SyncError::AlreadyAttached(resource_id));
            }
            debug!(resource_id = %resource_id, "replacing ended session");
        }

        let handle = self.client.attach(initial, policies);
        handles.insert(resource_id, handle.clone());
        Ok(handle)
    }

    /// Returns the handle for a resource, if attached.
    pub fn get(&self, resource_id: &ResourceId) -> Option<SyncHandle<P>> {
        self.handles.lock().get(resource_id).cloned()
    }

    /// Releases and forgets a resource. Returns false if it was not attached.
    pub fn release(&self, resource_id: &ResourceId) -> bool {
        let removed = self.handles.lock().remove(resource_id);
        match removed {
            Some(handle) => {
                handle.release();
                true
            }
            None => false,
        }
    }

    /// Releases every resource.
    pub fn release_all(&self) {
        let handles: Vec<_> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.release();
        }
    }

    /// Forgets sessions that are no longer live. Returns how many were
    /// removed.
    ///
    /// A resource that reached its terminal phase keeps a live session so
    /// its final state stays readable; see [`prune_terminal`](Self::prune_terminal).
    pub fn prune(&self) -> usize {
        let mut handles = self.handles.lock();
        let before = handles.len();
        handles.retain(|_, handle| handle.is_live());
        before - handles.len()
    }

    /// Releases and forgets sessions whose resource is terminal, along with
    /// those that are no longer live. Returns how many were removed.
    pub fn prune_terminal(&self) -> usize {
        let removed: Vec<SyncHandle<P>> = {
            let mut handles = self.handles.lock();
            let settled: Vec<ResourceId> = handles
                .iter()
                .filter(|(_, handle)| !handle.is_live() || handle.current().is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            settled
                .iter()
                .filter_map(|id| handles.remove(id))
                .collect()
        };

        for handle in &removed {
            debug!(resource_id = %handle.resource_id(), "pruning settled session");
            handle.release();
        }
        removed.len()
    }

    /// Number of tracked resources, live or not.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl<P: Payload> Drop for SyncRegistry<P> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::controller::SessionStatus;
    use crate::memory::MemoryBackend;
    use std::time::Duration;

    fn setup() -> (MemoryBackend<u32>, SyncRegistry<u32>) {
        let backend = MemoryBackend::new();
        let client = SyncClient::new(backend.clone(), backend.clone(), SyncConfig::new());
        (backend, SyncRegistry::new(client))
    }

    fn policies() -> Policies<u32> {
        Policies::new(|progress: &u32| *progress >= 100)
    }

    #[tokio::test]
    async fn refuses_duplicate_live_session() {
        let (backend, registry) = setup();
        let snapshot = backend.insert(ResourceId::new("run-1"), 0);

        registry.attach(snapshot.clone(), policies()).unwrap();
        let err = registry.attach(snapshot, policies()).unwrap_err();

        assert_eq!(err, SyncError::AlreadyAttached(ResourceId::new("run-1")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn ended_session_is_replaced() {
        let (backend, registry) = setup();
        let snapshot = backend.insert(ResourceId::new("run-1"), 0);

        let first = registry.attach(snapshot.clone(), policies()).unwrap();
        first.release();
        let second = registry.attach(snapshot, policies()).unwrap();

        assert!(second.is_live());
        assert_eq!(first.status(), SessionStatus::Released);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_sessions_are_pruned_only_on_request() {
        let (backend, registry) = setup();
        let done = ResourceId::new("run-1");
        for id in ["run-1", "run-2"] {
            let snapshot = backend.insert(ResourceId::new(id), 0);
            registry.attach(snapshot, policies()).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.update(&done, 100);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let finished = registry.get(&done).unwrap();
        assert!(finished.current().is_terminal());
        assert!(finished.is_live());
        assert_eq!(registry.prune(), 0);

        assert_eq!(registry.prune_terminal(), 1);
        assert!(registry.get(&done).is_none());
        assert_eq!(finished.status(), SessionStatus::Released);
        assert!(registry.get(&ResourceId::new("run-2")).unwrap().is_live());
    }

    #[tokio::test]
    async fn release_prune_and_release_all() {
        let (backend, registry) = setup();
        for id in ["run-1", "run-2", "run-3"] {
            let snapshot = backend.insert(ResourceId::new(id), 0);
            registry.attach(snapshot, policies()).unwrap();
        }

        assert!(registry.release(&ResourceId::new("run-1")));
        assert!(!registry.release(&ResourceId::new("run-1")));

        if let Some(handle) = registry.get(&ResourceId::new("run-2")) {
            handle.release();
        }
        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);

        let remaining = registry.get(&ResourceId::new("run-3")).unwrap();
        registry.release_all();
        assert!(registry.is_empty());
        assert!(!remaining.is_live());
    }
}
