use serde::{Deserialize, Serialize};

use crate::SagaId;

/// Version number of a stored saga document, used for optimistic
/// concurrency control.
///
/// A saga that has never been written is at version 0; every successful
/// save increments the version by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a saga that has not been written.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A stored saga document together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// The saga the document belongs to.
    pub saga_id: SagaId,
    /// Version of the document as stored.
    pub version: Version,
    /// The serialized saga state.
    pub payload: serde_json::Value,
}
