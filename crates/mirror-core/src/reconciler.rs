//! Brings a destination's dataset, history table, and latest-state view to
//! the shape a [`DocumentSchema`] requires.
//!
//! Runs on every cold start, possibly in several processes at once, so every
//! step is check-then-act with the store's `AlreadyExists` treated as a lost
//! race: the object is re-read and reconciled like one found on the first
//! look. Table changes are additive only; a plan is computed in full before
//! the first change, so a conflict leaves the destination untouched.

use crate::destination::{DestinationDescriptor, TableRef};
use crate::error::{MirrorError, MirrorResult};
use crate::schema::{plan_additive_migration, DocumentSchema, TableSchema};
use crate::store::{DestinationStore, StoreError};
use crate::view::ViewDefinition;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct SchemaReconciler {
    store: Arc<dyn DestinationStore>,
}

impl SchemaReconciler {
    pub fn new(store: Arc<dyn DestinationStore>) -> Self {
        Self { store }
    }

    /// Ensure `dataset_id` holds `<table_name>_raw` and a `<table_name>` view
    /// matching `schema`, creating or widening them as needed.
    ///
    /// Idempotent: a second call with the same schema changes nothing and
    /// returns an equal descriptor.
    #[instrument(skip(self, schema))]
    pub async fn ensure_schema(
        &self,
        dataset_id: &str,
        table_name: &str,
        schema: &DocumentSchema,
    ) -> MirrorResult<DestinationDescriptor> {
        let destination = DestinationDescriptor::new(dataset_id, table_name);
        info!("initializing destination schema");

        self.ensure_dataset(dataset_id).await?;
        let live = self.ensure_table(destination.raw_table(), schema).await?;
        debug!(columns = live.fields.len(), "history table verified");
        self.ensure_view(destination.view(), destination.raw_table(), schema)
            .await?;

        info!("destination schema initialized");
        Ok(destination)
    }

    async fn ensure_dataset(&self, dataset_id: &str) -> MirrorResult<()> {
        if self.store.dataset_exists(dataset_id).await? {
            info!(dataset = dataset_id, "dataset already exists");
            return Ok(());
        }

        info!(dataset = dataset_id, "creating dataset");
        match self.store.create_dataset(dataset_id).await {
            Ok(()) => info!(dataset = dataset_id, "created dataset"),
            Err(StoreError::AlreadyExists(_)) => {
                debug!(dataset = dataset_id, "dataset created concurrently");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn ensure_table(
        &self,
        table: &TableRef,
        schema: &DocumentSchema,
    ) -> MirrorResult<TableSchema> {
        let desired = schema.raw_table_schema();

        if let Some(live) = self.store.table_schema(table).await? {
            return self.widen_table(table, &live, &desired).await;
        }

        info!(table = %table, "creating table");
        match self.store.create_table(table, &desired).await {
            Ok(()) => {
                info!(table = %table, "created table");
                Ok(desired)
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(table = %table, "table created concurrently, validating it");
                let live = self.store.table_schema(table).await?.ok_or_else(|| {
                    MirrorError::DestinationUnreachable(format!(
                        "{table} reported as existing but could not be read"
                    ))
                })?;
                self.widen_table(table, &live, &desired).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Add whatever `desired` declares that `live` lacks. Never removes or
    /// retypes a field.
    async fn widen_table(
        &self,
        table: &TableRef,
        live: &TableSchema,
        desired: &TableSchema,
    ) -> MirrorResult<TableSchema> {
        let plan = plan_additive_migration(&table.to_string(), live, desired)?;
        if plan.is_empty() {
            info!(table = %table, "table already exists with expected schema");
            return Ok(live.clone());
        }

        let added: Vec<String> = plan.additions.iter().map(|a| a.path()).collect();
        info!(table = %table, fields = ?added, "adding fields to table");
        let widened = self
            .store
            .patch_table_schema(table, &plan.additions)
            .await?;
        info!(table = %table, "table schema updated");
        Ok(widened)
    }

    async fn ensure_view(
        &self,
        view: &TableRef,
        source: &TableRef,
        schema: &DocumentSchema,
    ) -> MirrorResult<()> {
        let desired = ViewDefinition::latest_state(source, schema);

        if let Some(query) = self.store.view_query(view).await? {
            return self.refresh_view(view, &query, &desired).await;
        }

        info!(view = %view, "creating view");
        match self.store.create_view(view, &desired).await {
            Ok(()) => {
                info!(view = %view, "created view");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(view = %view, "view created concurrently, validating it");
                let query = self.store.view_query(view).await?.ok_or_else(|| {
                    MirrorError::DestinationUnreachable(format!(
                        "{view} reported as existing but could not be read"
                    ))
                })?;
                self.refresh_view(view, &query, &desired).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Views hold no data, so a stale definition is simply replaced.
    async fn refresh_view(
        &self,
        view: &TableRef,
        live_query: &str,
        desired: &ViewDefinition,
    ) -> MirrorResult<()> {
        if live_query == desired.sql() {
            info!(view = %view, "view already exists with expected definition");
            return Ok(());
        }

        info!(view = %view, "updating view definition");
        self.store.update_view(view, desired).await?;
        info!(view = %view, "updated view definition");
        Ok(())
    }
}
