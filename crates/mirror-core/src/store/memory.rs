//! In-memory destination store.
//!
//! Behaves like the warehouse the mirror targets: datasets hold tables and
//! views in one shared namespace, tables are append-only, rows are checked
//! strictly against the live table schema (TIMESTAMP text is stored typed),
//! and views are evaluated on read.
//! Every successful mutation is journaled so tests can assert exactly what a
//! reconciliation changed.
//!
//! ## Limitations
//!
//! - Single-process only; no persistence
//! - Views can only be read through [`InMemoryStore::query_view`]

use super::{
    DestinationStore, InsertOutcome, RowRejection, StoreError, StoreResult, TableRow,
};
use crate::destination::TableRef;
use crate::schema::{apply_additions, normalize_row, validate_row, FieldAddition, TableSchema};
use crate::values::Fields;
use crate::view::ViewDefinition;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A change applied to the store, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateDataset { dataset_id: String },
    CreateTable { table: TableRef },
    PatchTable { table: TableRef, added: Vec<String> },
    CreateView { view: TableRef },
    UpdateView { view: TableRef },
    InsertRows { table: TableRef, rows: usize },
}

#[derive(Debug)]
struct Table {
    schema: TableSchema,
    rows: Vec<TableRow>,
}

#[derive(Debug)]
enum Object {
    Table(Table),
    View(ViewDefinition),
}

#[derive(Debug, Default)]
struct Dataset {
    objects: BTreeMap<String, Object>,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, Dataset>,
    journal: Vec<Mutation>,
    /// Objects whose next lookup reports them missing, to replay a lost
    /// exists-then-create race.
    stale_lookups: BTreeSet<String>,
}

impl State {
    fn dataset(&self, dataset_id: &str) -> StoreResult<&Dataset> {
        self.datasets
            .get(dataset_id)
            .ok_or_else(|| StoreError::NotFound(format!("dataset {dataset_id}")))
    }

    fn dataset_mut(&mut self, dataset_id: &str) -> StoreResult<&mut Dataset> {
        self.datasets
            .get_mut(dataset_id)
            .ok_or_else(|| StoreError::NotFound(format!("dataset {dataset_id}")))
    }

    fn table(&self, table: &TableRef) -> StoreResult<Option<&Table>> {
        match self.dataset(&table.dataset_id)?.objects.get(&table.table_id) {
            None => Ok(None),
            Some(Object::Table(t)) => Ok(Some(t)),
            Some(Object::View(_)) => Err(StoreError::Conflict {
                object: table.to_string(),
                message: "is a view, not a table".into(),
            }),
        }
    }

    fn view(&self, view: &TableRef) -> StoreResult<Option<&ViewDefinition>> {
        match self.dataset(&view.dataset_id)?.objects.get(&view.table_id) {
            None => Ok(None),
            Some(Object::View(v)) => Ok(Some(v)),
            Some(Object::Table(_)) => Err(StoreError::Conflict {
                object: view.to_string(),
                message: "is a table, not a view".into(),
            }),
        }
    }

    fn take_stale(&mut self, object: &str) -> bool {
        self.stale_lookups.remove(object)
    }
}

/// Warehouse fake backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    unreachable: AtomicBool,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("lock poisoned".into())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every request fails with `Unavailable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make the next lookup of `object` (a dataset id or `dataset.table`)
    /// report it as missing even if it exists, as a concurrent creator would
    /// have seen it a moment earlier.
    pub fn stale_next_lookup(&self, object: impl Into<String>) -> StoreResult<()> {
        self.write()?.stale_lookups.insert(object.into());
        Ok(())
    }

    /// Mutations applied so far, oldest first.
    pub fn journal(&self) -> StoreResult<Vec<Mutation>> {
        Ok(self.read()?.journal.clone())
    }

    /// All rows of a table in append order.
    pub fn rows(&self, table: &TableRef) -> StoreResult<Vec<TableRow>> {
        let state = self.read()?;
        let stored = state
            .table(table)?
            .ok_or_else(|| StoreError::NotFound(table.to_string()))?;
        Ok(stored.rows.clone())
    }

    /// Evaluate a stored view against the current rows of its source table.
    pub fn query_view(&self, view: &TableRef) -> StoreResult<Vec<Fields>> {
        let state = self.read()?;
        let definition = state
            .view(view)?
            .ok_or_else(|| StoreError::NotFound(view.to_string()))?;
        let source = state
            .table(definition.source())?
            .ok_or_else(|| StoreError::NotFound(definition.source().to_string()))?;
        Ok(definition.evaluate(source.rows.iter().map(|r| &r.columns)))
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(poison_err)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(poison_err)
    }

    fn create_object(&self, at: &TableRef, object: Object, mutation: Mutation) -> StoreResult<()> {
        let mut state = self.write()?;
        let dataset = state.dataset_mut(&at.dataset_id)?;
        if dataset.objects.contains_key(&at.table_id) {
            return Err(StoreError::AlreadyExists(at.to_string()));
        }
        dataset.objects.insert(at.table_id.clone(), object);
        state.journal.push(mutation);
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for InMemoryStore {
    async fn dataset_exists(&self, dataset_id: &str) -> StoreResult<bool> {
        self.check_reachable()?;
        let mut state = self.write()?;
        if state.take_stale(dataset_id) {
            return Ok(false);
        }
        Ok(state.datasets.contains_key(dataset_id))
    }

    async fn create_dataset(&self, dataset_id: &str) -> StoreResult<()> {
        self.check_reachable()?;
        let mut state = self.write()?;
        if state.datasets.contains_key(dataset_id) {
            return Err(StoreError::AlreadyExists(dataset_id.to_string()));
        }
        state.datasets.insert(dataset_id.to_string(), Dataset::default());
        state.journal.push(Mutation::CreateDataset {
            dataset_id: dataset_id.to_string(),
        });
        Ok(())
    }

    async fn table_schema(&self, table: &TableRef) -> StoreResult<Option<TableSchema>> {
        self.check_reachable()?;
        let mut state = self.write()?;
        if state.take_stale(&table.to_string()) {
            return Ok(None);
        }
        Ok(state.table(table)?.map(|t| t.schema.clone()))
    }

    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()> {
        self.check_reachable()?;
        let object = Object::Table(Table {
            schema: schema.clone(),
            rows: Vec::new(),
        });
        self.create_object(
            table,
            object,
            Mutation::CreateTable {
                table: table.clone(),
            },
        )
    }

    async fn patch_table_schema(
        &self,
        table: &TableRef,
        additions: &[FieldAddition],
    ) -> StoreResult<TableSchema> {
        self.check_reachable()?;
        let mut state = self.write()?;
        let stored = match state.dataset_mut(&table.dataset_id)?.objects.get_mut(&table.table_id) {
            Some(Object::Table(t)) => t,
            Some(Object::View(_)) => {
                return Err(StoreError::Conflict {
                    object: table.to_string(),
                    message: "is a view, not a table".into(),
                });
            }
            None => return Err(StoreError::NotFound(table.to_string())),
        };

        let mut widened = stored.schema.clone();
        let added = apply_additions(&mut widened, additions).map_err(|message| {
            StoreError::Conflict {
                object: table.to_string(),
                message,
            }
        })?;
        if added.is_empty() {
            return Ok(widened);
        }
        stored.schema = widened.clone();
        state.journal.push(Mutation::PatchTable {
            table: table.clone(),
            added,
        });
        Ok(widened)
    }

    async fn view_query(&self, view: &TableRef) -> StoreResult<Option<String>> {
        self.check_reachable()?;
        let mut state = self.write()?;
        if state.take_stale(&view.to_string()) {
            return Ok(None);
        }
        Ok(state.view(view)?.map(ViewDefinition::sql))
    }

    async fn create_view(&self, view: &TableRef, definition: &ViewDefinition) -> StoreResult<()> {
        self.check_reachable()?;
        self.create_object(
            view,
            Object::View(definition.clone()),
            Mutation::CreateView { view: view.clone() },
        )
    }

    async fn update_view(&self, view: &TableRef, definition: &ViewDefinition) -> StoreResult<()> {
        self.check_reachable()?;
        let mut state = self.write()?;
        match state.dataset_mut(&view.dataset_id)?.objects.get_mut(&view.table_id) {
            Some(Object::View(existing)) => *existing = definition.clone(),
            Some(Object::Table(_)) => {
                return Err(StoreError::Conflict {
                    object: view.to_string(),
                    message: "is a table, not a view".into(),
                });
            }
            None => return Err(StoreError::NotFound(view.to_string())),
        }
        state.journal.push(Mutation::UpdateView { view: view.clone() });
        Ok(())
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[TableRow]) -> StoreResult<InsertOutcome> {
        self.check_reachable()?;
        let mut state = self.write()?;
        let stored = match state.dataset_mut(&table.dataset_id)?.objects.get_mut(&table.table_id) {
            Some(Object::Table(t)) => t,
            Some(Object::View(_)) => {
                return Err(StoreError::Invalid {
                    object: table.to_string(),
                    message: "cannot insert into a view".into(),
                });
            }
            None => return Err(StoreError::NotFound(table.to_string())),
        };

        let mut outcome = InsertOutcome::default();
        for (index, row) in rows.iter().enumerate() {
            match validate_row(&row.columns, &stored.schema) {
                Ok(()) => {
                    let mut row = row.clone();
                    normalize_row(&mut row.columns, &stored.schema);
                    stored.rows.push(row);
                    outcome.inserted += 1;
                }
                Err(reason) => outcome.rejected.push(RowRejection { index, reason }),
            }
        }
        if outcome.inserted > 0 {
            state.journal.push(Mutation::InsertRows {
                table: table.clone(),
                rows: outcome.inserted,
            });
        }
        Ok(outcome)
    }
}
