use crate::destination::{raw_table_name, DestinationDescriptor};
use crate::error::{MirrorError, MirrorResult};
use serde::{Deserialize, Serialize};

/// Environment variable naming the destination dataset.
pub const DATASET_ID_ENV: &str = "DATASET_ID";
/// Environment variable naming the published table (view).
pub const TABLE_ID_ENV: &str = "TABLE_ID";

const MAX_NAME_LEN: usize = 1024;

/// Where one mirrored collection is published.
///
/// Deserializing validates, like [`MirrorConfig::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedMirrorConfig")]
pub struct MirrorConfig {
    pub dataset_id: String,
    pub table_name: String,
}

#[derive(Deserialize)]
struct UncheckedMirrorConfig {
    dataset_id: String,
    table_name: String,
}

impl TryFrom<UncheckedMirrorConfig> for MirrorConfig {
    type Error = MirrorError;

    fn try_from(raw: UncheckedMirrorConfig) -> MirrorResult<Self> {
        Self::new(raw.dataset_id, raw.table_name)
    }
}

impl MirrorConfig {
    pub fn new(dataset_id: impl Into<String>, table_name: impl Into<String>) -> MirrorResult<Self> {
        let config = Self {
            dataset_id: dataset_id.into(),
            table_name: table_name.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read `DATASET_ID` and `TABLE_ID` from the process environment.
    pub fn from_env() -> MirrorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (environment, extension parameters, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> MirrorResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| MirrorError::Config(format!("{key} is not set")))
        };
        Self::new(required(DATASET_ID_ENV)?, required(TABLE_ID_ENV)?)
    }

    pub fn from_json_str(json: &str) -> MirrorResult<Self> {
        serde_json::from_str(json).map_err(|e| MirrorError::Config(e.to_string()))
    }

    /// Dataset and table names must be non-empty warehouse identifiers
    /// (`[A-Za-z0-9_]`, at most 1024 characters, counting the `_raw` suffix
    /// for the table).
    pub fn validate(&self) -> MirrorResult<()> {
        check_identifier("dataset_id", &self.dataset_id)?;
        check_identifier("table_name", &self.table_name)?;
        check_identifier("table_name", &raw_table_name(&self.table_name))
    }

    pub fn destination(&self) -> DestinationDescriptor {
        DestinationDescriptor::new(&self.dataset_id, &self.table_name)
    }
}

fn check_identifier(key: &str, value: &str) -> MirrorResult<()> {
    if value.is_empty() {
        return Err(MirrorError::Config(format!("{key} is empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(MirrorError::Config(format!(
            "{key} `{value}` is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(MirrorError::Config(format!(
            "{key} `{value}` contains invalid character `{c}`"
        )));
    }
    Ok(())
}
