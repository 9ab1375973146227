use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix of the append-only history table behind a mirrored collection.
pub const RAW_TABLE_SUFFIX: &str = "_raw";

/// Name of the history table for a collection published as `table_name`.
pub fn raw_table_name(table_name: &str) -> String {
    format!("{table_name}{RAW_TABLE_SUFFIX}")
}

/// Fully qualified table or view: `dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(dataset_id: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset_id, self.table_id)
    }
}

/// Where one collection's history table and latest-state view live.
///
/// The view is published under the bare table name; history goes to
/// `<table>_raw` in the same dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationDescriptor {
    dataset_id: String,
    table_name: String,
    raw_table: TableRef,
    view: TableRef,
}

impl DestinationDescriptor {
    pub fn new(dataset_id: impl Into<String>, table_name: impl Into<String>) -> Self {
        let dataset_id = dataset_id.into();
        let table_name = table_name.into();
        Self {
            raw_table: TableRef::new(dataset_id.clone(), raw_table_name(&table_name)),
            view: TableRef::new(dataset_id.clone(), table_name.clone()),
            dataset_id,
            table_name,
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn raw_table(&self) -> &TableRef {
        &self.raw_table
    }

    pub fn view(&self) -> &TableRef {
        &self.view
    }
}
