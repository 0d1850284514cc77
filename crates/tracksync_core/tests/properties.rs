//! Ordering properties of the reconciler.

use proptest::prelude::*;
use std::sync::Arc;
use tracksync_core::{
    ClientFields, LocalState, Phase, Reconciler, ResourceSnapshot, SnapshotSource,
};
use tracksync_testkit::prelude::*;

fn reconciler() -> Reconciler<RunPayload> {
    Reconciler::new(is_run_terminal)
}

fn initial(reconciler: &Reconciler<RunPayload>) -> Arc<LocalState<RunPayload>> {
    reconciler.initial(
        run_snapshot(1, RunPayload::queued()),
        ClientFields::new().with("project", "atlas").with("pinned", "yes"),
    )
}

fn replay(
    reconciler: &Reconciler<RunPayload>,
    stream: &[ResourceSnapshot<RunPayload>],
) -> Vec<Arc<LocalState<RunPayload>>> {
    let mut states = vec![initial(reconciler)];
    for snapshot in stream {
        let next = reconciler.merge(states.last().unwrap(), snapshot.clone());
        states.push(next);
    }
    states
}

proptest! {
    #![proptest_config(PropTestConfig::default().to_proptest_config())]

    #[test]
    fn applied_version_never_decreases(stream in duplicated_stream_strategy(40)) {
        let r = reconciler();
        let states = replay(&r, &stream);
        for pair in states.windows(2) {
            prop_assert!(pair[1].last_applied_version() >= pair[0].last_applied_version());
        }
    }

    #[test]
    fn client_fields_survive_every_merge(stream in duplicated_stream_strategy(40)) {
        let r = reconciler();
        let states = replay(&r, &stream);
        let fields = Arc::clone(states[0].client_fields());
        for state in &states {
            prop_assert!(Arc::ptr_eq(state.client_fields(), &fields));
            prop_assert_eq!(state.client_fields().get("project"), Some("atlas"));
        }
    }

    #[test]
    fn reapplying_a_snapshot_is_a_noop(stream in snapshot_stream_strategy(20)) {
        let r = reconciler();
        let mut local = initial(&r);
        for snapshot in stream {
            local = r.merge(&local, snapshot.clone());
            let again = r.merge(&local, snapshot);
            prop_assert!(Arc::ptr_eq(&local, &again));
        }
    }

    #[test]
    fn any_interleaving_converges_on_highest_version(stream in snapshot_stream_strategy(30)) {
        let r = reconciler();
        let states = replay(&r, &stream);
        let last = states.last().unwrap();

        let max = stream.iter().map(|s| s.version).max().unwrap();
        prop_assert_eq!(last.last_applied_version(), max);
        prop_assert_eq!(last.payload(), &payload_at(max.get()));
    }

    #[test]
    fn poll_and_push_of_one_version_converge_in_either_order(
        payload in run_payload_strategy(),
        version in 2u64..1_000,
    ) {
        let r = reconciler();
        let local = initial(&r);
        let poll = ResourceSnapshot::new(run_id(), version, payload.clone(), SnapshotSource::Poll);
        let push = ResourceSnapshot::new(run_id(), version, payload, SnapshotSource::Push);

        let poll_applied = r.merge(&local, poll.clone());
        let poll_then_push = r.merge(&poll_applied, push.clone());
        let push_applied = r.merge(&local, push);
        let push_then_poll = r.merge(&push_applied, poll);

        prop_assert!(!Arc::ptr_eq(&local, &poll_applied));
        prop_assert!(Arc::ptr_eq(&poll_applied, &poll_then_push));
        prop_assert!(!Arc::ptr_eq(&local, &push_applied));
        prop_assert!(Arc::ptr_eq(&push_applied, &push_then_poll));
        prop_assert_eq!(&*poll_then_push, &*push_then_poll);
    }

    #[test]
    fn terminal_is_final(stream in duplicated_stream_strategy(40)) {
        let r = reconciler();
        let states = replay(&r, &stream);
        let mut seen_terminal = false;
        for state in &states {
            if seen_terminal {
                prop_assert_eq!(state.phase(), Phase::Terminal);
            }
            seen_terminal |= state.is_terminal();
        }
    }

    #[test]
    fn arbitrary_payloads_are_replaced_wholesale(
        payload in run_payload_strategy(),
        source in source_strategy(),
    ) {
        let r = reconciler();
        let local = initial(&r);
        let next = r.merge(&local, ResourceSnapshot::new(run_id(), 2u64, payload.clone(), source));
        prop_assert_eq!(next.payload(), &payload);
        prop_assert_eq!(next.phase() == Phase::Terminal, payload.status.is_terminal());
    }
}
