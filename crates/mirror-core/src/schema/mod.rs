mod diff;

pub use diff::{apply_additions, plan_additive_migration, FieldAddition, SchemaPlan};

use crate::error::{MirrorError, MirrorResult};
use crate::values::{Fields, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// System column holding the caller-supplied insert id.
pub const INSERT_ID_COLUMN: &str = "_insert_id";
/// System column holding the change operation (`CREATE`, `UPDATE`, ...).
pub const OPERATION_COLUMN: &str = "_operation";
/// System column holding the event time.
pub const TIMESTAMP_COLUMN: &str = "_timestamp";
/// Column under which the latest-state view exposes the event time.
pub const LAST_UPDATED_COLUMN: &str = "_last_updated";
/// Identifier field added by [`DocumentSchema::keyed_by_document_id`].
pub const DOCUMENT_ID_FIELD: &str = "document_id";

/// Warehouse column type.
///
/// Nested documents are described structurally with `Record`; `Json` opts a
/// field out of structural checking entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Bytes,
    Json,
    Record(Vec<FieldDefinition>),
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Bytes => "BYTES",
            Self::Json => "JSON",
            Self::Record(_) => "RECORD",
        }
    }

    fn is_scalar(&self) -> bool {
        !matches!(self, Self::Json | Self::Record(_))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Nullable => "NULLABLE",
            Self::Required => "REQUIRED",
            Self::Repeated => "REPEATED",
        }
    }
}

/// A single named column (or nested record member).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
}

impl FieldDefinition {
    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }

    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Required,
        }
    }

    pub fn repeated(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Repeated,
        }
    }

    /// Copy of this field with every `Required` mode, nested ones included,
    /// relaxed to `Nullable`.
    fn relaxed(&self) -> Self {
        let field_type = match &self.field_type {
            FieldType::Record(members) => {
                FieldType::Record(members.iter().map(Self::relaxed).collect())
            }
            other => other.clone(),
        };
        let mode = match self.mode {
            FieldMode::Required => FieldMode::Nullable,
            mode => mode,
        };
        Self {
            name: self.name.clone(),
            field_type,
            mode,
        }
    }
}

/// Ordered column layout of a warehouse table, as stored or as desired.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldDefinition>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldDefinition>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// The caller-declared shape of a mirrored document collection.
///
/// Always valid once constructed: identifier fields are non-empty, declared,
/// and scalar; field names are unique and outside the reserved `_` namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedDocumentSchema")]
pub struct DocumentSchema {
    fields: Vec<FieldDefinition>,
    id_field_names: Vec<String>,
}

#[derive(Deserialize)]
struct UncheckedDocumentSchema {
    fields: Vec<FieldDefinition>,
    id_field_names: Vec<String>,
}

impl TryFrom<UncheckedDocumentSchema> for DocumentSchema {
    type Error = MirrorError;

    fn try_from(raw: UncheckedDocumentSchema) -> MirrorResult<Self> {
        Self::new(raw.fields, raw.id_field_names)
    }
}

impl DocumentSchema {
    pub fn new(fields: Vec<FieldDefinition>, id_field_names: Vec<String>) -> MirrorResult<Self> {
        check_field_names(&fields, "")?;

        if id_field_names.is_empty() {
            return Err(MirrorError::InvalidSchema(
                "at least one identifier field is required".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for id_name in &id_field_names {
            if !seen.insert(id_name.as_str()) {
                return Err(MirrorError::InvalidSchema(format!(
                    "identifier field `{id_name}` listed twice"
                )));
            }
            let field = fields.iter().find(|f| &f.name == id_name).ok_or_else(|| {
                MirrorError::InvalidSchema(format!(
                    "identifier field `{id_name}` is not a declared field"
                ))
            })?;
            if field.mode == FieldMode::Repeated || !field.field_type.is_scalar() {
                return Err(MirrorError::InvalidSchema(format!(
                    "identifier field `{id_name}` must be a single scalar, got {} {}",
                    field.mode.name(),
                    field.field_type
                )));
            }
        }

        Ok(Self {
            fields,
            id_field_names,
        })
    }

    /// Schema keyed by the source document id, stored in a leading
    /// `document_id` STRING column.
    pub fn keyed_by_document_id(fields: Vec<FieldDefinition>) -> MirrorResult<Self> {
        let mut all = Vec::with_capacity(fields.len() + 1);
        all.push(FieldDefinition::required(DOCUMENT_ID_FIELD, FieldType::String));
        all.extend(fields);
        Self::new(all, vec![DOCUMENT_ID_FIELD.to_string()])
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn id_field_names(&self) -> &[String] {
        &self.id_field_names
    }

    pub fn is_id_field(&self, name: &str) -> bool {
        self.id_field_names.iter().any(|id| id == name)
    }

    /// Declared fields that are not identifiers, in declaration order.
    pub fn data_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| !self.is_id_field(&f.name))
    }

    /// Layout of the append-only history table: system columns, then the
    /// declared fields with identifiers `REQUIRED` and everything else
    /// relaxed so DELETE rows (which carry no snapshot) stay valid.
    pub fn raw_table_schema(&self) -> TableSchema {
        let mut fields = vec![
            FieldDefinition::required(INSERT_ID_COLUMN, FieldType::String),
            FieldDefinition::required(OPERATION_COLUMN, FieldType::String),
            FieldDefinition::required(TIMESTAMP_COLUMN, FieldType::Timestamp),
        ];
        for field in &self.fields {
            if self.is_id_field(&field.name) {
                fields.push(FieldDefinition::required(
                    field.name.clone(),
                    field.field_type.clone(),
                ));
            } else {
                fields.push(field.relaxed());
            }
        }
        TableSchema::new(fields)
    }
}

fn check_field_names(fields: &[FieldDefinition], parent: &str) -> MirrorResult<()> {
    let mut seen = BTreeSet::new();
    for field in fields {
        let path = join_path(parent, &field.name);
        if field.name.is_empty() {
            return Err(MirrorError::InvalidSchema(format!(
                "empty field name under `{parent}`"
            )));
        }
        if field.name.starts_with('_') {
            return Err(MirrorError::InvalidSchema(format!(
                "field names cannot start with underscore: `{path}`"
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(MirrorError::InvalidSchema(format!(
                "duplicate field `{path}`"
            )));
        }
        if let FieldType::Record(members) = &field.field_type {
            if members.is_empty() {
                return Err(MirrorError::InvalidSchema(format!(
                    "record `{path}` declares no fields"
                )));
            }
            check_field_names(members, &path)?;
        }
    }
    Ok(())
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

/// Validate a row's columns against a table schema.
///
/// Rejects unknown columns, missing or null `REQUIRED` columns, and values
/// that do not match the column type. Returns a descriptive error message.
pub fn validate_row(columns: &Fields, schema: &TableSchema) -> Result<(), String> {
    validate_members(columns, &schema.fields, "")
}

fn validate_members(
    columns: &Fields,
    definitions: &[FieldDefinition],
    parent: &str,
) -> Result<(), String> {
    for definition in definitions {
        let path = join_path(parent, &definition.name);
        match (definition.mode, columns.get(&definition.name)) {
            (FieldMode::Required, None | Some(Value::Null)) => {
                return Err(format!("missing required field: `{path}`"));
            }
            (_, None | Some(Value::Null)) => {}
            (FieldMode::Repeated, Some(Value::Array(items))) => {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item, &definition.field_type, &format!("{path}[{i}]"))?;
                }
            }
            (FieldMode::Repeated, Some(other)) => {
                return Err(type_error(&path, "array", other));
            }
            (_, Some(value)) => validate_value(value, &definition.field_type, &path)?,
        }
    }

    for name in columns.keys() {
        if !definitions.iter().any(|d| &d.name == name) {
            return Err(format!("unknown field `{}`", join_path(parent, name)));
        }
    }

    Ok(())
}

/// Validate a single value against a column type, recursively.
fn validate_value(value: &Value, expected: &FieldType, path: &str) -> Result<(), String> {
    match expected {
        FieldType::Json => Ok(()),
        FieldType::String => match value {
            Value::String(_) => Ok(()),
            _ => Err(type_error(path, "string", value)),
        },
        FieldType::Integer => match value {
            Value::Int64(_) => Ok(()),
            _ => Err(type_error(path, "integer", value)),
        },
        FieldType::Float => match value {
            Value::Int64(_) | Value::Float64(_) => Ok(()),
            _ => Err(type_error(path, "float", value)),
        },
        FieldType::Boolean => match value {
            Value::Boolean(_) => Ok(()),
            _ => Err(type_error(path, "boolean", value)),
        },
        FieldType::Timestamp => match value.as_timestamp() {
            Some(_) => Ok(()),
            None => Err(type_error(path, "timestamp", value)),
        },
        FieldType::Bytes => match value {
            Value::Bytes(_) => Ok(()),
            _ => Err(type_error(path, "bytes", value)),
        },
        FieldType::Record(members) => match value {
            Value::Object(obj) => validate_members(obj, members, path),
            _ => Err(type_error(path, "record", value)),
        },
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> String {
    format!("field `{path}`: expected {expected}, got {}", got.type_name())
}

/// Rewrite TIMESTAMP cells given as RFC 3339 text into `Value::Timestamp`,
/// so stored rows order by instant rather than by value kind. Expects a row
/// that already passed [`validate_row`].
pub fn normalize_row(columns: &mut Fields, schema: &TableSchema) {
    normalize_members(columns, &schema.fields);
}

fn normalize_members(columns: &mut Fields, definitions: &[FieldDefinition]) {
    for definition in definitions {
        let Some(value) = columns.get_mut(&definition.name) else {
            continue;
        };
        match value {
            Value::Array(items) if definition.mode == FieldMode::Repeated => {
                for item in items.iter_mut() {
                    normalize_value(item, &definition.field_type);
                }
            }
            other => normalize_value(other, &definition.field_type),
        }
    }
}

fn normalize_value(value: &mut Value, field_type: &FieldType) {
    match field_type {
        FieldType::Timestamp => {
            if matches!(value, Value::String(_)) {
                if let Some(ts) = value.as_timestamp() {
                    *value = Value::Timestamp(ts);
                }
            }
        }
        FieldType::Record(members) => {
            if let Value::Object(obj) = value {
                normalize_members(obj, members);
            }
        }
        _ => {}
    }
}
