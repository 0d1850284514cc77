//! Identifier, version and snapshot types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker trait for payload types carried by snapshots.
///
/// The core never looks inside a payload; it only clones and moves it
/// between tasks. Every `Clone + Send + Sync + Debug + 'static` type
/// qualifies.
pub trait Payload: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + fmt::Debug + 'static {}

/// Opaque identifier of a tracked resource (a run, or a document
/// collection scoped to its container).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a resource identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Ordering marker of a snapshot.
///
/// Servers stamp every change with a non-decreasing marker (the record's
/// last-modified time in milliseconds). Only the ordering matters to the
/// core.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Creates a version from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Which signal produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// On-demand fetch issued by the poll scheduler.
    Poll,
    /// Event received on the push channel.
    Push,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotSource::Poll => f.write_str("poll"),
            SnapshotSource::Push => f.write_str("push"),
        }
    }
}

/// One observed state of a tracked resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot<P> {
    /// Resource the snapshot describes.
    pub resource_id: ResourceId,
    /// Ordering marker.
    pub version: Version,
    /// Caller-owned representation of the resource.
    pub payload: P,
    /// Signal that produced the snapshot.
    pub source: SnapshotSource,
}

impl<P> ResourceSnapshot<P> {
    /// Creates a snapshot.
    pub fn new(
        resource_id: ResourceId,
        version: impl Into<Version>,
        payload: P,
        source: SnapshotSource,
    ) -> Self {
        Self {
            resource_id,
            version: version.into(),
            payload,
            source,
        }
    }

    /// Creates a snapshot obtained by fetching.
    pub fn poll(resource_id: ResourceId, version: impl Into<Version>, payload: P) -> Self {
        Self::new(resource_id, version, payload, SnapshotSource::Poll)
    }

    /// Creates a snapshot received from the push channel.
    pub fn push(resource_id: ResourceId, version: impl Into<Version>, payload: P) -> Self {
        Self::new(resource_id, version, payload, SnapshotSource::Push)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_by_value() {
        assert!(Version::new(1) < Version::new(2));
        assert_eq!(Version::from(7).get(), 7);
        assert_eq!(Version::new(3).to_string(), "v3");
    }

    #[test]
    fn resource_id_conversions() {
        let id = ResourceId::from("run-1");
        assert_eq!(id.as_str(), "run-1");
        assert_eq!(id, ResourceId::new(String::from("run-1")));
        assert_eq!(id.to_string(), "run-1");
    }

    #[test]
    fn snapshot_constructors_set_source() {
        let id = ResourceId::new("run-1");
        let polled = ResourceSnapshot::poll(id.clone(), 2, "processing");
        let pushed = ResourceSnapshot::push(id, 2, "processing");

        assert_eq!(polled.source, SnapshotSource::Poll);
        assert_eq!(pushed.source, SnapshotSource::Push);
        assert_eq!(polled.version, pushed.version);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let snapshot = ResourceSnapshot::push(ResourceId::new("run-1"), 5, "complete");
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["resource_id"], "run-1");
        assert_eq!(json["version"], 5);
        assert_eq!(json["source"], "push");
    }
}
