pub mod id;

pub use id::InsertId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

const BYTES_TAG: &str = "$bytes";
const TIMESTAMP_TAG: &str = "$timestamp";

/// A document snapshot: top-level field name to value.
pub type Fields = BTreeMap<String, Value>;

/// A single cell of a mirrored document or warehouse row.
///
/// Covers what a document store can hold and what the warehouse can
/// store in a column:
/// - Distinct integer (Int64) and floating-point (Float64) numbers
/// - Binary data (Bytes) and instants (Timestamp)
/// - All standard JSON types (Null, Boolean, String, Array, Object)
///
/// Values have a defined total ordering so identifier tuples can key a
/// `BTreeMap`:
/// Null < Numbers < Boolean < String < Bytes < Timestamp < Array < Object
///
/// Serializes through its JSON form, so trigger payloads deserialize
/// directly into snapshots. JSON has no binary or instant type, so `Bytes`
/// and `Timestamp` are written as single-key `$bytes` / `$timestamp` objects
/// and read back from the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the type name as a string, useful for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::Boolean(_) => "boolean",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// Int64 and Float64 share the same sort bucket so they compare numerically.
    fn type_order(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int64(_) | Self::Float64(_) => 1,
            Self::Boolean(_) => 2,
            Self::String(_) => 3,
            Self::Bytes(_) => 4,
            Self::Timestamp(_) => 5,
            Self::Array(_) => 6,
            Self::Object(_) => 7,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// The instant this value holds, reading RFC 3339 text as well.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::String(s) => parse_rfc3339(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

// NaN != NaN for Float64, standard equality for everything else.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let type_ord = self.type_order().cmp(&other.type_order());
        if type_ord != Ordering::Equal {
            return type_ord;
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Float64(a), Self::Float64(b)) => a.total_cmp(b),
            (Self::Int64(a), Self::Float64(b)) => (*a as f64).total_cmp(b),
            (Self::Float64(a), Self::Int64(b)) => a.total_cmp(&(*b as f64)),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a.cmp(b),
            (Self::Object(a), Self::Object(b)) => a.iter().cmp(b.iter()),
            _ => Ordering::Equal,
        }
    }
}

// ---------------------------------------------------------------------------
// From conversions for ergonomic value construction
// ---------------------------------------------------------------------------

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Object(v)
    }
}

// ---------------------------------------------------------------------------
// JSON interop: document snapshots usually arrive as JSON
// ---------------------------------------------------------------------------

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int64(i)
                } else {
                    Self::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(arr) => Self::Array(arr.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(obj) => match from_tagged(&obj) {
                Some(value) => value,
                None => Self::Object(obj.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
            },
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(b),
            Value::Int64(i) => serde_json::json!(i),
            Value::Float64(f) => serde_json::json!(f),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(b) => tagged(BYTES_TAG, serde_json::json!(b)),
            Value::Timestamp(ts) => {
                tagged(TIMESTAMP_TAG, serde_json::Value::String(ts.to_rfc3339()))
            }
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

fn tagged(tag: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(tag.to_string(), value);
    serde_json::Value::Object(map)
}

/// Recognize a single-key `$bytes` / `$timestamp` object. Anything else,
/// including a malformed payload under one of those keys, stays an object.
fn from_tagged(obj: &serde_json::Map<String, serde_json::Value>) -> Option<Value> {
    if obj.len() != 1 {
        return None;
    }
    match (obj.get(BYTES_TAG), obj.get(TIMESTAMP_TAG)) {
        (Some(serde_json::Value::Array(items)), _) => items
            .iter()
            .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .map(Value::Bytes),
        (_, Some(serde_json::Value::String(s))) => parse_rfc3339(s).map(Value::Timestamp),
        _ => None,
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Helper macro for building a document snapshot (`Fields`) inline.
///
/// # Example
/// ```
/// use mirror_core::fields;
/// use mirror_core::values::Value;
///
/// let doc = fields! {
///     "name" => "Alice",
///     "age" => 30i64
/// };
/// assert_eq!(doc.get("age"), Some(&Value::Int64(30)));
/// ```
#[macro_export]
macro_rules! fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = $crate::values::Fields::new();
        $(
            map.insert($key.to_string(), $crate::values::Value::from($value));
        )*
        map
    }};
}
