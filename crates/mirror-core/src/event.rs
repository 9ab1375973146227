use crate::error::{MirrorError, MirrorResult};
use crate::schema::{DocumentSchema, INSERT_ID_COLUMN, OPERATION_COLUMN, TIMESTAMP_COLUMN};
use crate::store::TableRow;
use crate::values::{Fields, InsertId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of write observed on the source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Backfill of a document that existed before mirroring started.
    Import,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Import => "IMPORT",
        }
    }

    pub fn carries_snapshot(self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = MirrorError;

    fn from_str(s: &str) -> MirrorResult<Self> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "IMPORT" => Ok(Self::Import),
            other => Err(MirrorError::InvalidEvent(format!(
                "unknown operation `{other}`"
            ))),
        }
    }
}

/// One write to a source document, as delivered by the change trigger.
///
/// Persisted unchanged as one history row; see [`ChangeEvent::to_row`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Values of the schema's identifier fields, in the schema's order.
    pub id_values: Vec<Value>,
    pub insert_id: InsertId,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    /// Document snapshot after the write; absent for deletes.
    #[serde(default)]
    pub data: Option<Fields>,
}

impl ChangeEvent {
    pub fn new(
        id_values: Vec<Value>,
        insert_id: InsertId,
        operation: Operation,
        timestamp: DateTime<Utc>,
        data: Option<Fields>,
    ) -> Self {
        Self {
            id_values,
            insert_id,
            operation,
            timestamp,
            data,
        }
    }

    pub fn create(
        id_values: Vec<Value>,
        insert_id: InsertId,
        timestamp: DateTime<Utc>,
        data: Fields,
    ) -> Self {
        Self::new(id_values, insert_id, Operation::Create, timestamp, Some(data))
    }

    pub fn update(
        id_values: Vec<Value>,
        insert_id: InsertId,
        timestamp: DateTime<Utc>,
        data: Fields,
    ) -> Self {
        Self::new(id_values, insert_id, Operation::Update, timestamp, Some(data))
    }

    pub fn import(
        id_values: Vec<Value>,
        insert_id: InsertId,
        timestamp: DateTime<Utc>,
        data: Fields,
    ) -> Self {
        Self::new(id_values, insert_id, Operation::Import, timestamp, Some(data))
    }

    pub fn delete(id_values: Vec<Value>, insert_id: InsertId, timestamp: DateTime<Utc>) -> Self {
        Self::new(id_values, insert_id, Operation::Delete, timestamp, None)
    }

    /// Check the event is well-formed for `schema`.
    pub fn validate(&self, schema: &DocumentSchema) -> MirrorResult<()> {
        let expected = schema.id_field_names().len();
        if self.id_values.len() != expected {
            return Err(MirrorError::InvalidEvent(format!(
                "{}: expected {expected} identifier values, got {}",
                self.insert_id,
                self.id_values.len()
            )));
        }
        if let Some(pos) = self.id_values.iter().position(Value::is_null) {
            return Err(MirrorError::InvalidEvent(format!(
                "{}: identifier `{}` is null",
                self.insert_id,
                schema.id_field_names()[pos]
            )));
        }
        match (&self.data, self.operation.carries_snapshot()) {
            (Some(_), false) => {
                return Err(MirrorError::InvalidEvent(format!(
                    "{}: {} must not carry a document snapshot",
                    self.insert_id, self.operation
                )));
            }
            (None, true) => {
                return Err(MirrorError::InvalidEvent(format!(
                    "{}: {} requires a document snapshot",
                    self.insert_id, self.operation
                )));
            }
            _ => {}
        }
        if let Some(key) = self
            .data
            .iter()
            .flat_map(|data| data.keys())
            .find(|key| key.starts_with('_'))
        {
            return Err(MirrorError::InvalidEvent(format!(
                "{}: snapshot field `{key}` uses the reserved `_` prefix",
                self.insert_id
            )));
        }
        Ok(())
    }

    /// Flatten into a history-table row: system columns, identifier columns,
    /// then the snapshot's fields. Identifier values always come from
    /// `id_values`; a same-named key in the snapshot is dropped.
    pub fn to_row(&self, schema: &DocumentSchema) -> MirrorResult<TableRow> {
        self.validate(schema)?;

        let mut columns = Fields::new();
        columns.insert(
            INSERT_ID_COLUMN.to_string(),
            Value::String(self.insert_id.to_string()),
        );
        columns.insert(
            OPERATION_COLUMN.to_string(),
            Value::String(self.operation.as_str().to_string()),
        );
        columns.insert(TIMESTAMP_COLUMN.to_string(), Value::Timestamp(self.timestamp));
        for (name, value) in schema.id_field_names().iter().zip(&self.id_values) {
            columns.insert(name.clone(), value.clone());
        }
        if let Some(data) = &self.data {
            for (name, value) in data {
                if !schema.is_id_field(name) {
                    columns.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(TableRow {
            insert_id: self.insert_id.clone(),
            columns,
        })
    }

    /// Rebuild the event a history row was recorded from.
    pub fn from_row(row: &TableRow, schema: &DocumentSchema) -> MirrorResult<Self> {
        let column = |name: &str| {
            row.columns.get(name).ok_or_else(|| {
                MirrorError::InvalidEvent(format!("{}: missing column `{name}`", row.insert_id))
            })
        };

        let operation: Operation = column(OPERATION_COLUMN)?
            .as_str()
            .ok_or_else(|| MirrorError::InvalidEvent(format!("{}: bad operation", row.insert_id)))?
            .parse()?;
        let timestamp = column(TIMESTAMP_COLUMN)?
            .as_timestamp()
            .ok_or_else(|| MirrorError::InvalidEvent(format!("{}: bad timestamp", row.insert_id)))?;
        let id_values = schema
            .id_field_names()
            .iter()
            .map(|name| column(name.as_str()).cloned())
            .collect::<MirrorResult<Vec<_>>>()?;

        let data = operation.carries_snapshot().then(|| {
            row.columns
                .iter()
                .filter(|(name, _)| !name.starts_with('_') && !schema.is_id_field(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect::<Fields>()
        });

        Ok(Self {
            id_values,
            insert_id: row.insert_id.clone(),
            operation,
            timestamp,
            data,
        })
    }
}
