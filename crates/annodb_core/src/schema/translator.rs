//! Schema-to-table translation.
//!
//! # Responsibility
//! - Expand a schema descriptor into the physical column set of an
//!   annotation table, including the generated point columns and the
//!   mandatory id/timestamp/versioning columns.
//! - Derive the paired segmentation table definition from the same
//!   descriptor.
//!
//! # Invariants
//! - Every annotation table carries exactly the system columns in
//!   `SYSTEM_COLUMNS`, in that order, before any schema field column.
//! - Translation is pure: no connection is touched here.

use super::{FieldSpec, SchemaDescriptor, SchemaError, SchemaResult};
use crate::model::field::FieldKind;
use crate::naming::is_valid_identifier;

/// Reserved column names present on every materialized annotation table.
pub const SYSTEM_COLUMNS: &[&str] = &["id", "created", "deleted", "superseded_id", "valid"];

/// One physical column of a materialized table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: &'static str,
}

impl ColumnDef {
    fn new(name: impl Into<String>, sql_type: &'static str) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// Complete relational definition of one materialized table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    table_name: String,
    create_sql: String,
    column_names: Vec<String>,
}

impl TableDefinition {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// CREATE TABLE statement for this definition.
    pub fn create_table_sql(&self) -> &str {
        &self.create_sql
    }

    /// Physical column names in declaration order. Used to detect drift
    /// between a live table and what its schema type implies.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }
}

/// Columns materialized for one schema field.
///
/// A `Point` expands to three numeric columns; every other kind maps to a
/// single column.
pub fn field_columns(field: &FieldSpec) -> Vec<ColumnDef> {
    match field.kind {
        FieldKind::Point => vec![
            ColumnDef::new(format!("{}_x", field.name), "REAL"),
            ColumnDef::new(format!("{}_y", field.name), "REAL"),
            ColumnDef::new(format!("{}_z", field.name), "REAL"),
        ],
        FieldKind::Number => vec![ColumnDef::new(field.name.clone(), "REAL")],
        FieldKind::Text => vec![ColumnDef::new(field.name.clone(), "TEXT")],
        FieldKind::Reference => vec![ColumnDef::new(field.name.clone(), "INTEGER")],
    }
}

/// Builds the annotation table definition for `descriptor`.
///
/// Reference schemas must supply `reference_table`; non-reference schemas
/// must not. The target table's existence is checked at the registry layer,
/// inside the creation transaction.
pub fn build_annotation_table(
    table_name: &str,
    descriptor: &SchemaDescriptor,
    reference_table: Option<&str>,
) -> SchemaResult<TableDefinition> {
    vet_table_name(table_name)?;
    match (descriptor.is_reference(), reference_table) {
        (true, None) => {
            return Err(SchemaError::ReferenceTargetRequired {
                schema: descriptor.name().to_string(),
            })
        }
        (false, Some(_)) => {
            return Err(SchemaError::NotAReferenceSchema {
                schema: descriptor.name().to_string(),
            })
        }
        _ => {}
    }
    if let Some(target) = reference_table {
        vet_table_name(target)?;
    }

    let mut columns: Vec<ColumnDef> = vec![
        ColumnDef::new("id", "INTEGER PRIMARY KEY AUTOINCREMENT"),
        ColumnDef::new("created", "INTEGER NOT NULL"),
        ColumnDef::new("deleted", "INTEGER"),
        ColumnDef::new("superseded_id", "INTEGER"),
        ColumnDef::new("valid", "INTEGER NOT NULL DEFAULT 1"),
    ];

    for field in descriptor.fields() {
        for column in field_columns(field) {
            if columns.iter().any(|existing| existing.name == column.name) {
                return Err(SchemaError::ColumnConflict {
                    schema: descriptor.name().to_string(),
                    field: field.name.clone(),
                    column: column.name,
                });
            }
            columns.push(column);
        }
    }

    Ok(assemble(table_name, columns, None))
}

/// Builds the segmentation table definition paired with `annotation_table`.
///
/// One row per annotation row (`id` is both primary key and foreign key),
/// with a supervoxel/root id column pair per `Point` field.
pub fn build_segmentation_table(
    segmentation_table_name: &str,
    annotation_table: &str,
    descriptor: &SchemaDescriptor,
) -> SchemaResult<TableDefinition> {
    vet_table_name(segmentation_table_name)?;
    vet_table_name(annotation_table)?;

    let mut columns = vec![ColumnDef::new("id", "INTEGER PRIMARY KEY")];
    for point_field in descriptor.point_fields() {
        columns.push(ColumnDef::new(
            format!("{point_field}_supervoxel_id"),
            "INTEGER",
        ));
        columns.push(ColumnDef::new(format!("{point_field}_root_id"), "INTEGER"));
    }

    Ok(assemble(
        segmentation_table_name,
        columns,
        Some(annotation_table),
    ))
}

fn assemble(
    table_name: &str,
    columns: Vec<ColumnDef>,
    annotation_fk: Option<&str>,
) -> TableDefinition {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|column| format!("\"{}\" {}", column.name, column.sql_type))
        .collect();
    if let Some(target) = annotation_fk {
        parts.push(format!("FOREIGN KEY (\"id\") REFERENCES \"{target}\"(\"id\")"));
    }

    let create_sql = format!("CREATE TABLE \"{table_name}\" (\n    {}\n);", parts.join(",\n    "));
    let column_names = columns.into_iter().map(|column| column.name).collect();

    TableDefinition {
        table_name: table_name.to_string(),
        create_sql,
        column_names,
    }
}

fn vet_table_name(name: &str) -> SchemaResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidName {
            kind: "table",
            name: name.to_string(),
        })
    }
}
