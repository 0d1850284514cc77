//! # tracksync Testkit
//!
//! Test utilities for tracksync.
//!
//! This crate provides:
//! - Run-tracking fixtures (payload, policies, configuration)
//! - Scripted fetch and push doubles that record call timings
//! - A recording sink for driving schedulers and sessions standalone
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tracksync_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn tracks_run() {
//!     let fetcher = ScriptedFetcher::new();
//!     fetcher.push_found(RunPayload::processing(10), 2);
//!     let client = SyncClient::poll_only(fetcher.clone(), run_config());
//!     let handle = client.attach(run_snapshot(1, RunPayload::queued()), run_policies());
//!     // ...
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scripted;
pub mod sink;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scripted::*;
    pub use crate::sink::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scripted::*;
pub use sink::*;
