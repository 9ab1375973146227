//! The destination warehouse as seen by the mirror.
//!
//! [`DestinationStore`] is the only seam between the mirror and the outside
//! world. Every method is a single request/response round trip, and none of
//! them hold locks across calls: the mirror relies on the store to make
//! creation idempotent at its boundary rather than coordinating writers.
//!
//! ## Implementations
//!
//! - [`memory::InMemoryStore`]: a complete in-process warehouse for tests
//!   and local development

pub mod memory;

use crate::destination::TableRef;
use crate::schema::{FieldAddition, TableSchema};
use crate::values::{Fields, InsertId};
use crate::view::ViewDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store-specific failures, mapped into `MirrorError` by the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connectivity, auth, or quota failure; the request may succeed later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A create lost a race with another writer.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The object exists but the request is incompatible with it.
    #[error("conflict on {object}: {message}")]
    Conflict { object: String, message: String },
    /// The request itself is malformed for the target object.
    #[error("invalid request for {object}: {message}")]
    Invalid { object: String, message: String },
}

/// One row appended to a table. Columns are validated against the live
/// table schema by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub insert_id: InsertId,
    pub columns: Fields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    pub index: usize,
    pub reason: String,
}

/// Result of a batched append. Valid rows are kept even when others in the
/// same batch are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub rejected: Vec<RowRejection>,
}

impl InsertOutcome {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Warehouse capability consumed by the reconciler and the recorder.
///
/// Implementations must be `Send + Sync`; one handle is shared by every
/// invocation in a process.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn dataset_exists(&self, dataset_id: &str) -> StoreResult<bool>;

    /// Fails with `AlreadyExists` if another writer created it first.
    async fn create_dataset(&self, dataset_id: &str) -> StoreResult<()>;

    /// Live schema of a table, or `None` if it does not exist.
    async fn table_schema(&self, table: &TableRef) -> StoreResult<Option<TableSchema>>;

    /// Fails with `AlreadyExists` if another writer created it first.
    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()>;

    /// Add fields to a live table, returning the resulting schema.
    ///
    /// Adding a field that is already present with the same definition must
    /// be a no-op; a clashing definition fails with `Conflict`.
    async fn patch_table_schema(
        &self,
        table: &TableRef,
        additions: &[FieldAddition],
    ) -> StoreResult<TableSchema>;

    /// Stored query text of a view, or `None` if it does not exist.
    async fn view_query(&self, view: &TableRef) -> StoreResult<Option<String>>;

    /// Fails with `AlreadyExists` if another writer created it first.
    async fn create_view(&self, view: &TableRef, definition: &ViewDefinition) -> StoreResult<()>;

    /// Replace a view's definition in place.
    async fn update_view(&self, view: &TableRef, definition: &ViewDefinition) -> StoreResult<()>;

    /// Append rows in one request.
    async fn insert_rows(&self, table: &TableRef, rows: &[TableRow]) -> StoreResult<InsertOutcome>;
}
