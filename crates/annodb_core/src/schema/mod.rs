//! Schema descriptors and schema-to-table translation.
//!
//! # Responsibility
//! - Hold the registered set of named schema descriptors.
//! - Translate a descriptor into a relational table definition, including
//!   the expanded point columns and mandatory versioning columns.
//!
//! # Invariants
//! - A descriptor is resolved once per operation; row handling never
//!   re-interprets field semantics.
//! - Generated column names never collide with the reserved system columns.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod registry;
pub mod translator;

pub use registry::{FieldSpec, SchemaDescriptor, SchemaRegistry};
pub use translator::{
    build_annotation_table, build_segmentation_table, ColumnDef, TableDefinition, SYSTEM_COLUMNS,
};

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while resolving or translating schema descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The requested schema type is not registered.
    SchemaNotFound(String),
    /// A schema field (or a column generated from it) collides with a
    /// reserved system column.
    ColumnConflict {
        schema: String,
        field: String,
        column: String,
    },
    /// A table or field name failed identifier vetting.
    InvalidName { kind: &'static str, name: String },
    /// Two fields of one descriptor share a name.
    DuplicateField { schema: String, field: String },
    /// The schema carries a `Reference` field but no target table was given.
    ReferenceTargetRequired { schema: String },
    /// Reference metadata was supplied for a schema without a `Reference`
    /// field.
    NotAReferenceSchema { schema: String },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchemaNotFound(name) => write!(f, "schema type not registered: {name}"),
            Self::ColumnConflict {
                schema,
                field,
                column,
            } => write!(
                f,
                "schema {schema} field {field} collides with reserved column {column}"
            ),
            Self::InvalidName { kind, name } => {
                write!(f, "invalid {kind} name `{name}`: expected [a-z][a-z0-9_]*")
            }
            Self::DuplicateField { schema, field } => {
                write!(f, "schema {schema} declares field {field} more than once")
            }
            Self::ReferenceTargetRequired { schema } => write!(
                f,
                "schema {schema} is a reference schema and requires a reference_table metadata entry"
            ),
            Self::NotAReferenceSchema { schema } => write!(
                f,
                "schema {schema} has no reference field; reference_table metadata is not allowed"
            ),
        }
    }
}

impl Error for SchemaError {}
