use crate::destination::{raw_table_name, TableRef};
use crate::error::{MirrorError, MirrorResult, RowFailure};
use crate::event::ChangeEvent;
use crate::schema::DocumentSchema;
use crate::store::DestinationStore;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Appends change events to a collection's history table.
///
/// There is no update path: every event becomes a new row and rows are
/// never touched again. Duplicate deliveries are recorded as-is and
/// collapsed by the latest-state view.
pub struct EventRecorder {
    store: Arc<dyn DestinationStore>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn DestinationStore>) -> Self {
        Self { store }
    }

    /// Record a single event.
    pub async fn record_one(
        &self,
        dataset_id: &str,
        table_name: &str,
        schema: &DocumentSchema,
        event: &ChangeEvent,
    ) -> MirrorResult<()> {
        self.record(dataset_id, table_name, schema, std::slice::from_ref(event))
            .await
            .map(|_| ())
    }

    /// Record a batch of events with one write to the store. Returns the
    /// number of rows appended.
    ///
    /// Every event is normalized before anything is written, so a malformed
    /// event fails the call without a partial append. Rows the store itself
    /// rejects are reported as `InsertPartialFailure` with their batch index;
    /// the others stay recorded.
    #[instrument(skip(self, schema, events), fields(rows = events.len()))]
    pub async fn record(
        &self,
        dataset_id: &str,
        table_name: &str,
        schema: &DocumentSchema,
        events: &[ChangeEvent],
    ) -> MirrorResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let table = TableRef::new(dataset_id, raw_table_name(table_name));
        let rows = events
            .iter()
            .map(|event| event.to_row(schema))
            .collect::<MirrorResult<Vec<_>>>()?;

        info!(table = %table, rows = rows.len(), "inserting rows");
        let outcome = self.store.insert_rows(&table, &rows).await?;

        if !outcome.is_complete() {
            let failures: Vec<RowFailure> = outcome
                .rejected
                .into_iter()
                .map(|rejection| RowFailure {
                    insert_id: rows
                        .get(rejection.index)
                        .map(|r| r.insert_id.to_string())
                        .unwrap_or_default(),
                    index: rejection.index,
                    reason: rejection.reason,
                })
                .collect();
            warn!(
                table = %table,
                inserted = outcome.inserted,
                rejected = failures.len(),
                "rows rejected by destination"
            );
            return Err(MirrorError::InsertPartialFailure {
                table: table.to_string(),
                attempted: rows.len(),
                failures,
            });
        }

        info!(table = %table, rows = outcome.inserted, "inserted rows");
        Ok(outcome.inserted)
    }
}
