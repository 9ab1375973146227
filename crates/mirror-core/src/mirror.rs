use crate::config::MirrorConfig;
use crate::error::MirrorResult;
use crate::event::ChangeEvent;
use crate::recorder::EventRecorder;
use crate::reconciler::SchemaReconciler;
use crate::schema::DocumentSchema;
use crate::store::DestinationStore;
use std::sync::Arc;
use tracing::instrument;

/// Per-invocation entry point for a change trigger: reconcile the
/// destination, then append the event(s).
///
/// Holds only immutable configuration. Reconciliation runs on every call;
/// nothing about the destination is cached between invocations.
pub struct Mirror {
    config: MirrorConfig,
    schema: DocumentSchema,
    reconciler: SchemaReconciler,
    recorder: EventRecorder,
}

impl Mirror {
    pub fn new(store: Arc<dyn DestinationStore>, config: MirrorConfig, schema: DocumentSchema) -> Self {
        Self {
            config,
            schema,
            reconciler: SchemaReconciler::new(store.clone()),
            recorder: EventRecorder::new(store),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn schema(&self) -> &DocumentSchema {
        &self.schema
    }

    pub async fn handle(&self, event: &ChangeEvent) -> MirrorResult<()> {
        self.handle_batch(std::slice::from_ref(event)).await.map(|_| ())
    }

    /// Returns the number of rows appended. Nothing is recorded if the
    /// destination could not be reconciled.
    #[instrument(skip_all, fields(dataset = %self.config.dataset_id, table = %self.config.table_name))]
    pub async fn handle_batch(&self, events: &[ChangeEvent]) -> MirrorResult<usize> {
        let destination = self
            .reconciler
            .ensure_schema(&self.config.dataset_id, &self.config.table_name, &self.schema)
            .await?;
        self.recorder
            .record(
                destination.dataset_id(),
                destination.table_name(),
                &self.schema,
                events,
            )
            .await
    }
}
