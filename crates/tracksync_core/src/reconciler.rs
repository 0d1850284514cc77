//! Pure merge of incoming snapshots into local state.
//!
//! The reconciler is the only ordering mechanism between the poll and push
//! sources: whichever source delivers the highest version wins, and any
//! snapshot at or below the last applied version is ignored. Because it is
//! a plain function over values, every ordering property can be tested
//! without timers or a network.

use crate::state::{ClientFields, LocalState, Phase};
use crate::types::{Payload, ResourceSnapshot};
use std::sync::Arc;
use tracing::debug;

/// Decides which phase a payload represents.
///
/// Closures `Fn(&P) -> bool` are classifiers, returning `true` for
/// terminal payloads. Implement the trait directly to report
/// [`Phase::Unknown`].
pub trait PhaseClassifier<P>: Send + Sync {
    /// Classifies a payload.
    fn classify(&self, payload: &P) -> Phase;
}

impl<P, F> PhaseClassifier<P> for F
where
    F: Fn(&P) -> bool + Send + Sync,
{
    fn classify(&self, payload: &P) -> Phase {
        if self(payload) {
            Phase::Terminal
        } else {
            Phase::Active
        }
    }
}

/// Merges snapshots into [`LocalState`].
pub struct Reconciler<P> {
    classifier: Arc<dyn PhaseClassifier<P>>,
}

impl<P> Clone for Reconciler<P> {
    fn clone(&self) -> Self {
        Self {
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<P: Payload> Reconciler<P> {
    /// Creates a reconciler with the given classifier.
    pub fn new(classifier: impl PhaseClassifier<P> + 'static) -> Self {
        Self {
            classifier: Arc::new(classifier),
        }
    }

    /// Creates a reconciler from a shared classifier.
    pub fn from_shared(classifier: Arc<dyn PhaseClassifier<P>>) -> Self {
        Self { classifier }
    }

    /// Builds the first local state from the snapshot a view was mounted
    /// with.
    pub fn initial(
        &self,
        snapshot: ResourceSnapshot<P>,
        client_fields: ClientFields,
    ) -> Arc<LocalState<P>> {
        let phase = self.classifier.classify(&snapshot.payload);
        Arc::new(LocalState {
            resource_id: snapshot.resource_id,
            last_applied_version: snapshot.version,
            payload: snapshot.payload,
            client_fields: Arc::new(client_fields),
            phase,
        })
    }

    /// Merges `incoming` into `local`.
    ///
    /// Returns `local` itself (pointer-equal) when the snapshot is stale or
    /// names another resource; otherwise a new state whose payload is
    /// replaced wholesale and whose client fields are shared with `local`.
    pub fn merge(
        &self,
        local: &Arc<LocalState<P>>,
        incoming: ResourceSnapshot<P>,
    ) -> Arc<LocalState<P>> {
        if incoming.resource_id != local.resource_id {
            debug!(
                resource_id = %local.resource_id,
                foreign = %incoming.resource_id,
                "discarding snapshot for another resource"
            );
            return Arc::clone(local);
        }

        if incoming.version <= local.last_applied_version {
            debug!(
                resource_id = %local.resource_id,
                version = incoming.version.get(),
                applied = local.last_applied_version.get(),
                source = %incoming.source,
                "discarding stale snapshot"
            );
            return Arc::clone(local);
        }

        let phase = local
            .phase
            .advance(self.classifier.classify(&incoming.payload));

        Arc::new(LocalState {
            resource_id: local.resource_id.clone(),
            last_applied_version: incoming.version,
            payload: incoming.payload,
            client_fields: Arc::clone(&local.client_fields),
            phase,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceId, Version};

    fn reconciler() -> Reconciler<&'static str> {
        Reconciler::new(|status: &&'static str| matches!(*status, "complete" | "failed"))
    }

    fn id() -> ResourceId {
        ResourceId::new("run-1")
    }

    fn attach(reconciler: &Reconciler<&'static str>) -> Arc<LocalState<&'static str>> {
        reconciler.initial(
            ResourceSnapshot::poll(id(), 1, "queued"),
            ClientFields::new().with("project", "Atlas"),
        )
    }

    #[test]
    fn initial_state_classifies_payload() {
        let r = reconciler();
        let local = attach(&r);

        assert_eq!(local.last_applied_version(), Version::new(1));
        assert_eq!(*local.payload(), "queued");
        assert_eq!(local.phase(), Phase::Active);
        assert_eq!(local.client_fields().get("project"), Some("Atlas"));
    }

    #[test]
    fn newer_snapshot_replaces_payload() {
        let r = reconciler();
        let local = attach(&r);

        let next = r.merge(&local, ResourceSnapshot::push(id(), 2, "processing"));

        assert!(!Arc::ptr_eq(&local, &next));
        assert_eq!(next.last_applied_version(), Version::new(2));
        assert_eq!(*next.payload(), "processing");
        assert!(Arc::ptr_eq(local.client_fields(), next.client_fields()));
    }

    #[test]
    fn stale_and_equal_versions_are_noops() {
        let r = reconciler();
        let local = r.merge(&attach(&r), ResourceSnapshot::poll(id(), 5, "processing"));

        let same = r.merge(&local, ResourceSnapshot::push(id(), 5, "processing"));
        assert!(Arc::ptr_eq(&local, &same));

        let older = r.merge(&local, ResourceSnapshot::poll(id(), 3, "queued"));
        assert!(Arc::ptr_eq(&local, &older));
        assert_eq!(*older.payload(), "processing");
    }

    #[test]
    fn highest_version_wins_out_of_order() {
        let r = reconciler();
        let mut local = attach(&r);

        for (version, status) in [(2, "v2"), (9, "v9"), (4, "v4")] {
            local = r.merge(&local, ResourceSnapshot::poll(id(), version, status));
        }

        assert_eq!(local.last_applied_version(), Version::new(9));
        assert_eq!(*local.payload(), "v9");
    }

    #[test]
    fn terminal_phase_is_final() {
        let r = reconciler();
        let local = r.merge(&attach(&r), ResourceSnapshot::push(id(), 2, "complete"));
        assert_eq!(local.phase(), Phase::Terminal);

        let later = r.merge(&local, ResourceSnapshot::poll(id(), 3, "processing"));
        assert_eq!(later.last_applied_version(), Version::new(3));
        assert_eq!(later.phase(), Phase::Terminal);
    }

    #[test]
    fn foreign_snapshot_is_ignored() {
        let r = reconciler();
        let local = attach(&r);

        let other = ResourceSnapshot::push(ResourceId::new("run-2"), 10, "complete");
        assert!(Arc::ptr_eq(&local, &r.merge(&local, other)));
    }

    struct StatusClassifier;

    impl PhaseClassifier<&'static str> for StatusClassifier {
        fn classify(&self, payload: &&'static str) -> Phase {
            match *payload {
                "queued" | "processing" => Phase::Active,
                "complete" => Phase::Terminal,
                _ => Phase::Unknown,
            }
        }
    }

    #[test]
    fn custom_classifier_can_report_unknown() {
        let r = Reconciler::new(StatusClassifier);
        let local = r.initial(ResourceSnapshot::poll(id(), 1, "archived"), ClientFields::new());
        assert_eq!(local.phase(), Phase::Unknown);

        let next = r.merge(&local, ResourceSnapshot::poll(id(), 2, "processing"));
        assert_eq!(next.phase(), Phase::Active);
    }
}
