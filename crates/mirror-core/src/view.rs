//! The latest-state view over an append-only history table.
//!
//! A [`ViewDefinition`] renders to the SQL a warehouse stores, and can also
//! be evaluated in process over history rows with the same semantics:
//!
//! - rows are grouped by identifier tuple
//! - within a group, the row with the greatest `_timestamp` wins; equal
//!   timestamps fall back to the greatest `_insert_id`
//! - a group whose winning row is a `DELETE` is left out
//!
//! Duplicate deliveries share timestamp and insert id, so they collapse to
//! one visible row at query time without any write-time deduplication.

use crate::destination::TableRef;
use crate::event::Operation;
use crate::schema::{
    DocumentSchema, INSERT_ID_COLUMN, LAST_UPDATED_COLUMN, OPERATION_COLUMN, TIMESTAMP_COLUMN,
};
use crate::values::{Fields, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Composite key of one logical document: its identifier values in order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RowKey(pub Vec<Value>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    source: TableRef,
    key_columns: Vec<String>,
    data_columns: Vec<String>,
}

impl ViewDefinition {
    /// Latest-state view of `source` for the current field set of `schema`.
    pub fn latest_state(source: &TableRef, schema: &DocumentSchema) -> Self {
        Self {
            source: source.clone(),
            key_columns: schema.id_field_names().to_vec(),
            data_columns: schema.data_fields().map(|f| f.name.clone()).collect(),
        }
    }

    pub fn source(&self) -> &TableRef {
        &self.source
    }

    /// Output columns, in order.
    pub fn columns(&self) -> Vec<&str> {
        self.key_columns
            .iter()
            .chain(&self.data_columns)
            .map(String::as_str)
            .chain(std::iter::once(LAST_UPDATED_COLUMN))
            .collect()
    }

    /// Query text as stored by the warehouse. Two definitions are equivalent
    /// exactly when their query text is equal.
    pub fn sql(&self) -> String {
        let projection = self
            .key_columns
            .iter()
            .chain(&self.data_columns)
            .map(|c| quote(c))
            .chain(std::iter::once(format!(
                "{} AS {}",
                quote(TIMESTAMP_COLUMN),
                quote(LAST_UPDATED_COLUMN)
            )))
            .collect::<Vec<_>>()
            .join(", ");
        let partition = self
            .key_columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "SELECT {projection}\n\
             FROM (\n  \
               SELECT *, ROW_NUMBER() OVER (\n    \
                 PARTITION BY {partition}\n    \
                 ORDER BY {ts} DESC, {insert_id} DESC\n  \
               ) AS `_row_rank`\n  \
               FROM `{source}`\n\
             )\n\
             WHERE `_row_rank` = 1 AND {op} != '{delete}'",
            ts = quote(TIMESTAMP_COLUMN),
            insert_id = quote(INSERT_ID_COLUMN),
            source = self.source,
            op = quote(OPERATION_COLUMN),
            delete = Operation::Delete.as_str(),
        )
    }

    /// Evaluate the view over history rows, returning one projected row per
    /// visible document ordered by identifier tuple.
    pub fn evaluate<'a>(&self, rows: impl IntoIterator<Item = &'a Fields>) -> Vec<Fields> {
        let mut latest: BTreeMap<RowKey, &Fields> = BTreeMap::new();
        for row in rows {
            let key = self.extract_key(row);
            let newer = latest
                .get(&key)
                .map_or(true, |current| rank(current, row) == Ordering::Less);
            if newer {
                latest.insert(key, row);
            }
        }

        let delete = Value::from(Operation::Delete.as_str());
        latest
            .into_values()
            .filter(|row| row.get(OPERATION_COLUMN) != Some(&delete))
            .map(|row| self.project(row))
            .collect()
    }

    fn extract_key(&self, row: &Fields) -> RowKey {
        RowKey(
            self.key_columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    fn project(&self, row: &Fields) -> Fields {
        let mut out: Fields = self
            .key_columns
            .iter()
            .chain(&self.data_columns)
            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
            .collect();
        out.insert(
            LAST_UPDATED_COLUMN.to_string(),
            instant(row).map_or(Value::Null, Value::Timestamp),
        );
        out
    }
}

/// Order two rows of the same document by recency. Timestamps compare as
/// instants whether stored typed or as RFC 3339 text. The whole-row
/// comparison only matters for rows sharing timestamp and insert id, and
/// keeps the result independent of scan order.
fn rank(a: &Fields, b: &Fields) -> Ordering {
    let column = |row: &Fields, name: &str| row.get(name).cloned().unwrap_or(Value::Null);
    instant(a)
        .cmp(&instant(b))
        .then_with(|| column(a, INSERT_ID_COLUMN).cmp(&column(b, INSERT_ID_COLUMN)))
        .then_with(|| a.cmp(b))
}

fn instant(row: &Fields) -> Option<DateTime<Utc>> {
    row.get(TIMESTAMP_COLUMN).and_then(Value::as_timestamp)
}

fn quote(identifier: &str) -> String {
    format!("`{identifier}`")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeEvent;
    use crate::fields;
    use crate::schema::{FieldDefinition, FieldType};
    use crate::values::InsertId;
    use chrono::TimeZone;

    fn schema() -> DocumentSchema {
        DocumentSchema::new(
            vec![
                FieldDefinition::required("id", FieldType::String),
                FieldDefinition::nullable("title", FieldType::String),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    fn view() -> ViewDefinition {
        ViewDefinition::latest_state(&TableRef::new("ds", "posts_raw"), &schema())
    }

    fn row(id: &str, insert_id: &str, secs: i64, op: Operation, title: &str) -> Fields {
        let ts = Utc.timestamp_opt(secs, 0).unwrap();
        let event = match op {
            Operation::Delete => {
                ChangeEvent::delete(vec![Value::from(id)], InsertId::from(insert_id), ts)
            }
            op => ChangeEvent::new(
                vec![Value::from(id)],
                InsertId::from(insert_id),
                op,
                ts,
                Some(fields! { "title" => title }),
            ),
        };
        event.to_row(&schema()).unwrap().columns
    }

    #[test]
    fn renders_latest_state_query() {
        let sql = view().sql();
        assert!(sql.starts_with("SELECT `id`, `title`, `_timestamp` AS `_last_updated`"));
        assert!(sql.contains("PARTITION BY `id`"));
        assert!(sql.contains("ORDER BY `_timestamp` DESC, `_insert_id` DESC"));
        assert!(sql.contains("FROM `ds.posts_raw`"));
        assert!(sql.ends_with("WHERE `_row_rank` = 1 AND `_operation` != 'DELETE'"));
        assert_eq!(view().columns(), vec!["id", "title", "_last_updated"]);
    }

    #[test]
    fn query_tracks_field_set() {
        let wider = DocumentSchema::new(
            vec![
                FieldDefinition::required("id", FieldType::String),
                FieldDefinition::nullable("title", FieldType::String),
                FieldDefinition::nullable("body", FieldType::String),
            ],
            vec!["id".into()],
        )
        .unwrap();
        let widened = ViewDefinition::latest_state(&TableRef::new("ds", "posts_raw"), &wider);
        assert_ne!(widened.sql(), view().sql());
        assert!(widened.sql().contains("`body`"));
    }

    #[test]
    fn latest_row_wins_and_deletes_hide() {
        let rows = vec![
            row("doc1", "a", 1, Operation::Create, "v1"),
            row("doc1", "b", 3, Operation::Delete, ""),
            row("doc1", "c", 2, Operation::Update, "v2"),
            row("doc2", "d", 1, Operation::Import, "other"),
        ];
        let out = view().evaluate(&rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("id"), Some(&Value::from("doc2")));
    }

    #[test]
    fn equal_timestamps_prefer_greater_insert_id() {
        let rows = vec![
            row("doc1", "doc1@00000000000000000002", 5, Operation::Update, "second"),
            row("doc1", "doc1@00000000000000000001", 5, Operation::Update, "first"),
        ];
        let forward = view().evaluate(&rows);
        let reversed = view().evaluate(rows.iter().rev());
        assert_eq!(forward, reversed);
        assert_eq!(forward[0].get("title"), Some(&Value::from("second")));
    }

    #[test]
    fn duplicate_delivery_collapses() {
        let dup = row("doc1", "a", 1, Operation::Create, "v1");
        let out = view().evaluate([&dup, &dup]);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].get("_last_updated"),
            Some(&Value::Timestamp(Utc.timestamp_opt(1, 0).unwrap()))
        );
    }

    #[test]
    fn textual_timestamps_order_by_instant() {
        let older = row("doc1", "a", 1, Operation::Update, "older");
        let mut newer = row("doc1", "b", 100, Operation::Update, "newer");
        newer.insert(TIMESTAMP_COLUMN.to_string(), Value::from("1970-01-01T00:01:40Z"));

        let out = view().evaluate([&older, &newer]);
        assert_eq!(out[0].get("title"), Some(&Value::from("newer")));
        assert_eq!(
            out[0].get("_last_updated"),
            Some(&Value::Timestamp(Utc.timestamp_opt(100, 0).unwrap()))
        );
    }
}
