//! Seam between the poll and channel loops and their owner.

use crate::state::LocalState;
use crate::types::ResourceSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Why a resource stopped being observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoneReason {
    /// The fetch endpoint reported the resource missing.
    NotFound,
    /// The fetch endpoint denied access.
    Forbidden,
}

impl fmt::Display for GoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoneReason::NotFound => f.write_str("not found"),
            GoneReason::Forbidden => f.write_str("forbidden"),
        }
    }
}

/// Out-of-band signals surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncSignal {
    /// The resource is no longer observable; the session has ended.
    ResourceGone {
        /// What the fetch endpoint reported.
        reason: GoneReason,
    },
    /// The poll attempt ceiling was reached. Polling stopped; the push
    /// channel keeps running.
    PollingExhausted {
        /// Fetches issued before the ceiling tripped.
        attempts: u64,
    },
}

/// Receives the output of a [`PollScheduler`](crate::PollScheduler) or
/// [`ChannelSession`](crate::ChannelSession).
///
/// The [`SyncHandle`](crate::SyncHandle) implementation reconciles every
/// snapshot into its local state; tests can supply their own.
pub trait SyncSink<P>: Send + Sync {
    /// Applies a snapshot and returns the resulting local state, or `None`
    /// once the owner has detached. Callers stop on `None`.
    fn apply(&self, snapshot: ResourceSnapshot<P>) -> Option<Arc<LocalState<P>>>;

    /// Reports that the resource can no longer be fetched.
    fn resource_gone(&self, reason: GoneReason);

    /// Reports that the poll attempt ceiling was reached.
    fn attempts_exhausted(&self, attempts: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_serialize_with_kind_tag() {
        let gone = SyncSignal::ResourceGone {
            reason: GoneReason::Forbidden,
        };
        let json = serde_json::to_value(gone).unwrap();
        assert_eq!(json["kind"], "resource_gone");
        assert_eq!(json["reason"], "forbidden");

        let exhausted = serde_json::to_value(SyncSignal::PollingExhausted { attempts: 9 }).unwrap();
        assert_eq!(exhausted["kind"], "polling_exhausted");
        assert_eq!(exhausted["attempts"], 9);
    }

    #[test]
    fn gone_reason_display() {
        assert_eq!(GoneReason::NotFound.to_string(), "not found");
        assert_eq!(GoneReason::Forbidden.to_string(), "forbidden");
    }
}
