//! # tracksync core
//!
//! Client-side synchronization of long-running server resources.
//!
//! This crate provides:
//! - Version-ordered reconciliation of snapshots into local state
//! - Adaptive poll scheduling (short interval while active, long once terminal)
//! - A push channel session with fixed-backoff reconnect
//! - A per-resource controller that wires the three together
//! - A registry for views that track many resources at once
//! - An in-memory backend for tests and simulations
//!
//! ## Architecture
//!
//! Each attached resource gets two independent signals:
//! 1. A poll loop that fetches the resource on an interval
//! 2. A push channel that delivers change events
//!
//! Both feed version-stamped snapshots into one reconciler. Whichever
//! delivers the highest version wins; late or duplicate snapshots are
//! dropped without notifying anyone.
//!
//! ## Key Invariants
//!
//! - `last_applied_version` never decreases
//! - A snapshot at or below the applied version changes nothing
//! - Client-only fields survive every merge
//! - Terminal is final: once terminal, a resource never goes back
//! - At most one push binding exists per session
//! - Nothing is applied after release or after the resource went away

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod config;
mod controller;
mod error;
mod memory;
mod observer;
mod poll;
mod reconciler;
mod registry;
mod sink;
mod state;
mod transport;
mod types;

pub use channel::{ChannelSession, ChannelState, SubscriptionState};
pub use config::{ChannelConfig, PollConfig, SyncConfig};
pub use controller::{Policies, SessionStatus, SyncClient, SyncHandle, SyncStats};
pub use error::{SyncError, SyncResult};
pub use memory::MemoryBackend;
pub use observer::Unsubscribe;
pub use poll::{IntervalPolicy, PhaseInterval, PollScheduler, PollState};
pub use reconciler::{PhaseClassifier, Reconciler};
pub use registry::SyncRegistry;
pub use sink::{GoneReason, SyncSignal, SyncSink};
pub use state::{ClientFields, LocalState, Phase};
pub use transport::{
    ChannelMessage, ChannelStatus, DetachedHandle, Fetched, PushTransport, ResourceFetcher,
    Subscription, SubscriptionHandle,
};
pub use types::{Payload, ResourceId, ResourceSnapshot, SnapshotSource, Version};

/// Version of the tracksync core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
