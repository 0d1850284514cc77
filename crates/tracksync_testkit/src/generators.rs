//! Property-based test generators using proptest.
//!
//! Snapshot streams keep the server-side invariant that one version always
//! carries the same payload, so any interleaving of them has exactly one
//! correct outcome.

use crate::fixtures::{run_id, RunPayload, RunStatus};
use proptest::prelude::*;
use tracksync_core::{ResourceSnapshot, SnapshotSource};

/// Strategy for run statuses.
pub fn run_status_strategy() -> impl Strategy<Value = RunStatus> {
    prop_oneof![
        Just(RunStatus::Queued),
        Just(RunStatus::Processing),
        Just(RunStatus::Complete),
        Just(RunStatus::Failed),
    ]
}

/// Strategy for run payloads.
pub fn run_payload_strategy() -> impl Strategy<Value = RunPayload> {
    (run_status_strategy(), 0u8..=100)
        .prop_map(|(status, progress)| RunPayload::new(status, progress))
}

/// Strategy for snapshot sources.
pub fn source_strategy() -> impl Strategy<Value = SnapshotSource> {
    prop_oneof![Just(SnapshotSource::Poll), Just(SnapshotSource::Push)]
}

/// The payload the server holds at `version`.
///
/// Versions map to statuses deterministically so a stream replayed in any
/// order still agrees with itself.
pub fn payload_at(version: u64) -> RunPayload {
    let status = match version % 7 {
        0 => RunStatus::Queued,
        6 => RunStatus::Complete,
        _ => RunStatus::Processing,
    };
    RunPayload::new(status, (version % 101) as u8)
}

/// Strategy for a stream of snapshots for [`run_id`] with distinct
/// versions, in random order and from random sources.
pub fn snapshot_stream_strategy(
    max_len: usize,
) -> impl Strategy<Value = Vec<ResourceSnapshot<RunPayload>>> {
    prop::collection::btree_set(2u64..10_000, 1..max_len.max(2))
        .prop_flat_map(|versions| {
            let len = versions.len();
            (
                Just(versions.into_iter().collect::<Vec<_>>()),
                prop::collection::vec(source_strategy(), len),
            )
        })
        .prop_map(|(versions, sources)| {
            versions
                .into_iter()
                .zip(sources)
                .map(|(version, source)| {
                    ResourceSnapshot::new(run_id(), version, payload_at(version), source)
                })
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

/// Strategy for a stream that may repeat versions, as happens when the
/// poll and push sources both observe the same change.
pub fn duplicated_stream_strategy(
    max_len: usize,
) -> impl Strategy<Value = Vec<ResourceSnapshot<RunPayload>>> {
    prop::collection::vec((2u64..64, source_strategy()), 1..max_len.max(2)).prop_map(|items| {
        items
            .into_iter()
            .map(|(version, source)| {
                ResourceSnapshot::new(run_id(), version, payload_at(version), source)
            })
            .collect()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn stream_versions_are_distinct(stream in snapshot_stream_strategy(20)) {
            let versions: HashSet<_> = stream.iter().map(|s| s.version).collect();
            prop_assert_eq!(versions.len(), stream.len());
        }

        #[test]
        fn stream_payloads_match_versions(stream in duplicated_stream_strategy(20)) {
            for snapshot in &stream {
                prop_assert_eq!(&snapshot.payload, &payload_at(snapshot.version.get()));
            }
        }
    }

    #[test]
    fn payload_is_a_function_of_version() {
        assert_eq!(payload_at(14), payload_at(14));
        assert_eq!(payload_at(13).status, RunStatus::Complete);
    }
}
