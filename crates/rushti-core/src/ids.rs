use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier used for dependency resolution. Shared by every expanded
/// instance of a wildcard-expanded task (see [`crate::task::Task`] expansion).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of one concrete, dispatchable task instance. Multiple instances
/// can share a [`TaskId`] when the task was produced by wildcard expansion;
/// an id is complete only when every instance registered under it finishes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub id: TaskId,
    pub expansion_index: usize,
}

impl InstanceKey {
    pub fn new(id: TaskId, expansion_index: usize) -> Self {
        Self { id, expansion_index }
    }

    pub fn single(id: TaskId) -> Self {
        Self { id, expansion_index: 0 }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.expansion_index)
    }
}

/// 16-hex hash of `instance|process|sorted(parameters)`, used to key
/// runtime statistics. Only constructible via [`crate::signature::compute_signature`]
/// so a caller cannot smuggle an arbitrary string in where a signature is
/// expected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// Only callable from within this crate; external callers go through
    /// `compute_signature`.
    pub(crate) fn from_hex(hex: String) -> Self {
        debug_assert_eq!(hex.len(), 16);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrates a signature from a value already known to be a valid
    /// 16-hex digest, e.g. a column read back from the stats store.
    pub fn from_trusted_hex(hex: String) -> Self {
        Self::from_hex(hex)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp-based run identifier, `YYYYMMDD_HHMMSS`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_timestamp(ts: chrono::DateTime<chrono::Utc>) -> Self {
        Self(ts.format("%Y%m%d_%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
