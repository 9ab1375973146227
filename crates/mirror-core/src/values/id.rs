use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one physical write for warehouse-side deduplication.
///
/// Redelivery of the same change must produce the same id, so callers
/// normally derive it from the document key and the source write version.
/// Within one document, lexical order of derived ids follows write order,
/// which the latest-state view relies on to break timestamp ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsertId(String);

impl InsertId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for `document_key` at `write_version`.
    ///
    /// The version is zero-padded so lexical and numeric order agree.
    pub fn derive(document_key: &str, write_version: u64) -> Self {
        Self(format!("{document_key}@{write_version:020}"))
    }

    /// Generate an id with a UUID v7 (time-ordered) for sources that carry no
    /// write version. Not stable across redelivery.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InsertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InsertId {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}
