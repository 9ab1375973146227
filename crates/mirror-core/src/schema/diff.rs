//! Additive-only schema migration.
//!
//! A live table is reconciled toward a desired layout by adding the fields it
//! lacks. Existing fields are never removed, retyped, or relaxed; any
//! difference that would need one of those is reported as a conflict before
//! anything is changed.

use super::{join_path, FieldDefinition, FieldMode, FieldType, TableSchema};
use crate::error::{MirrorError, MirrorResult};
use serde::{Deserialize, Serialize};

/// A field to add under `parent` (empty for a top-level column, otherwise the
/// path of record names leading to the nested member list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAddition {
    pub parent: Vec<String>,
    pub field: FieldDefinition,
}

impl FieldAddition {
    pub fn path(&self) -> String {
        let mut path = self.parent.join(".");
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(&self.field.name);
        path
    }
}

/// The set of changes needed to widen a live table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaPlan {
    pub additions: Vec<FieldAddition>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty()
    }
}

/// Compare `live` against `desired` field-by-field (by name) and plan the
/// additions that bring `live` up to date.
///
/// Fails with `SchemaConflict` naming `object` when a declared field exists
/// with a different type or repetition, when a live field is stricter than
/// declared, or when a `REQUIRED` field is missing (required columns cannot
/// be added to a populated table).
pub fn plan_additive_migration(
    object: &str,
    live: &TableSchema,
    desired: &TableSchema,
) -> MirrorResult<SchemaPlan> {
    let mut plan = SchemaPlan::default();
    diff_members(object, &live.fields, &desired.fields, &mut Vec::new(), &mut plan)?;
    Ok(plan)
}

fn diff_members(
    object: &str,
    live: &[FieldDefinition],
    desired: &[FieldDefinition],
    parent: &mut Vec<String>,
    plan: &mut SchemaPlan,
) -> MirrorResult<()> {
    for wanted in desired {
        let path = join_path(&parent.join("."), &wanted.name);
        let Some(existing) = live.iter().find(|f| f.name == wanted.name) else {
            if wanted.mode == FieldMode::Required {
                return Err(MirrorError::conflict(
                    object,
                    format!("required field `{path}` is missing and cannot be added"),
                ));
            }
            plan.additions.push(FieldAddition {
                parent: parent.clone(),
                field: wanted.clone(),
            });
            continue;
        };

        match (existing.mode, wanted.mode) {
            (FieldMode::Repeated, FieldMode::Repeated) => {}
            (FieldMode::Repeated, _) | (_, FieldMode::Repeated) => {
                return Err(MirrorError::conflict(
                    object,
                    format!(
                        "field `{path}` is {}, declared {}",
                        existing.mode.name(),
                        wanted.mode.name()
                    ),
                ));
            }
            (FieldMode::Required, FieldMode::Nullable) => {
                return Err(MirrorError::conflict(
                    object,
                    format!("field `{path}` is REQUIRED, declared NULLABLE"),
                ));
            }
            _ => {}
        }

        match (&existing.field_type, &wanted.field_type) {
            (FieldType::Record(live_members), FieldType::Record(wanted_members)) => {
                parent.push(wanted.name.clone());
                diff_members(object, live_members, wanted_members, parent, plan)?;
                parent.pop();
            }
            (have, want) if have != want => {
                return Err(MirrorError::conflict(
                    object,
                    format!("field `{path}` is {have}, declared {want}"),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Apply additions to a schema in place, as a store would, returning the
/// paths of the fields actually added.
///
/// Adding a field that already exists with an identical definition is a
/// no-op, so concurrent reconcilers racing on the same widening converge.
pub fn apply_additions(
    schema: &mut TableSchema,
    additions: &[FieldAddition],
) -> Result<Vec<String>, String> {
    let mut added = Vec::new();
    for addition in additions {
        let mut members = &mut schema.fields;
        for name in &addition.parent {
            let record = members
                .iter_mut()
                .find(|f| &f.name == name)
                .ok_or_else(|| format!("no record `{name}` for `{}`", addition.path()))?;
            members = match &mut record.field_type {
                FieldType::Record(inner) => inner,
                other => return Err(format!("`{name}` is {other}, not a RECORD")),
            };
        }

        match members.iter().position(|f| f.name == addition.field.name) {
            Some(i) if members[i] == addition.field => {}
            Some(_) => {
                return Err(format!(
                    "field `{}` already exists with a different definition",
                    addition.path()
                ));
            }
            None if addition.field.mode == FieldMode::Required => {
                return Err(format!("cannot add REQUIRED field `{}`", addition.path()));
            }
            None => {
                members.push(addition.field.clone());
                added.push(addition.path());
            }
        }
    }
    Ok(added)
}
