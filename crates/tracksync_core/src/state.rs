//! Canonical local view of a tracked resource.

use crate::types::{ResourceId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Whether a resource is still changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// The resource is still being mutated by the server.
    Active,
    /// The resource reached a final state and will not change again.
    Terminal,
    /// The payload does not say which of the two applies.
    Unknown,
}

impl Phase {
    /// Returns true for [`Phase::Terminal`].
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Terminal)
    }

    /// Returns the phase that follows `self` when a payload classifies as
    /// `next`. Terminal is absorbing.
    pub fn advance(self, next: Phase) -> Phase {
        if self.is_terminal() {
            Phase::Terminal
        } else {
            next
        }
    }
}

/// Fields populated once when a view attaches, such as denormalized labels
/// that the server payload does not carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientFields(BTreeMap<String, String>);

impl ClientFields {
    /// Creates an empty set of client fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns a field value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterates over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ClientFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The canonical view of a resource owned by one controller.
///
/// Values are immutable; the [`Reconciler`](crate::Reconciler) produces a
/// new `Arc<LocalState>` for every accepted snapshot and hands back the same
/// `Arc` for rejected ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState<P> {
    pub(crate) resource_id: ResourceId,
    pub(crate) last_applied_version: Version,
    pub(crate) payload: P,
    pub(crate) client_fields: Arc<ClientFields>,
    pub(crate) phase: Phase,
}

impl<P> LocalState<P> {
    /// Resource this state describes.
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Version of the last snapshot merged into this state.
    pub fn last_applied_version(&self) -> Version {
        self.last_applied_version
    }

    /// Latest payload.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Fields set at attach time.
    pub fn client_fields(&self) -> &Arc<ClientFields> {
        &self.client_fields
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Shorthand for `self.phase().is_terminal()`.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
