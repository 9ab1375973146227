use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type MirrorResult<T> = Result<T, MirrorError>;

/// A single row rejected by the destination during a batched append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    /// Position of the row within the submitted batch.
    pub index: usize,
    pub insert_id: String,
    pub reason: String,
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {} ({}): {}", self.index, self.insert_id, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),
    #[error("schema conflict on `{object}`: {message}")]
    SchemaConflict { object: String, message: String },
    #[error("{} of {attempted} rows rejected by `{table}`", .failures.len())]
    InsertPartialFailure {
        table: String,
        attempted: usize,
        failures: Vec<RowFailure>,
    },
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("invalid change event: {0}")]
    InvalidEvent(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MirrorError {
    pub fn conflict(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaConflict {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Indices of the rows a caller may resubmit after a partial insert failure.
    pub fn failed_rows(&self) -> &[RowFailure] {
        match self {
            Self::InsertPartialFailure { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Whether the failure is worth retrying from the invoking trigger.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DestinationUnreachable(_))
    }
}

impl From<StoreError> for MirrorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::DestinationUnreachable(msg),
            StoreError::NotFound(object) => {
                Self::DestinationUnreachable(format!("object disappeared: {object}"))
            }
            StoreError::AlreadyExists(object) => {
                Self::conflict(object, "object already exists")
            }
            StoreError::Conflict { object, message } | StoreError::Invalid { object, message } => {
                Self::SchemaConflict { object, message }
            }
        }
    }
}
