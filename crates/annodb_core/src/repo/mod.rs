//! Repository layer: metadata registry and row CRUD over materialized tables.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQL details from service/business orchestration.
//!
//! # Invariants
//! - Every write path validates rows against the resolved schema descriptor
//!   before touching SQL.
//! - Every multi-statement operation runs inside one transaction; partial
//!   effects are never observable.
//! - Repository APIs return semantic errors (`RowNotFound`,
//!   `TableAlreadyExists`, ...) in addition to DB transport errors.

use crate::db::DbError;
use crate::model::field::FieldKind;
use crate::schema::SchemaError;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotation_repo;
pub mod segmentation_repo;
pub mod table_registry;

pub type RepoResult<T> = Result<T, RepoError>;

/// Hard ceiling on rows accepted by one insert call.
pub const ANNOTATION_INSERT_LIMIT: usize = 10_000;

/// Errors raised by registry and CRUD operations.
#[derive(Debug)]
pub enum RepoError {
    Schema(SchemaError),
    Db(DbError),
    /// A table of this name is already tracked in metadata.
    TableAlreadyExists { table: String },
    /// No metadata row exists for this table.
    TableNotFound { table: String },
    /// Reference metadata names a target table that does not exist.
    ReferenceTargetNotFound { table: String, target: String },
    /// Insert batch exceeded `ANNOTATION_INSERT_LIMIT`.
    BatchSizeExceeded { limit: usize, attempted: usize },
    /// A batch mixed caller-supplied and engine-generated ids.
    InconsistentIdMode { table: String },
    /// No live (non-superseded, non-deleted) row carries this id.
    RowNotFound { table: String, id: i64 },
    /// The annotation table (or its paired segmentation table) required by a
    /// linking operation does not exist.
    LinkTargetMissing { table: String },
    /// Segmentation rows already exist for these annotation ids.
    LinkAlreadyExists { table: String, ids: Vec<i64> },
    /// A row carried a field the table's schema does not declare.
    UnknownField { table: String, field: String },
    /// A row field value does not match its declared kind.
    FieldTypeMismatch {
        table: String,
        field: String,
        expected: FieldKind,
    },
    /// A row is missing a field the table's schema requires.
    MissingField { table: String, field: String },
    /// The physical column set of a table no longer matches what its
    /// schema type implies. Fatal configuration error.
    SchemaDrift { table: String, detail: String },
    /// The connection has not been bootstrapped through `db::open`.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// A required metadata table is absent.
    MissingRequiredTable(&'static str),
    /// Persisted state failed to parse into the domain model.
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::TableAlreadyExists { table } => {
                write!(f, "table creation failed: {table} already exists")
            }
            Self::TableNotFound { table } => {
                write!(f, "no table named {table} in metadata")
            }
            Self::ReferenceTargetNotFound { table, target } => write!(
                f,
                "table {table} references target table {target}, which does not exist"
            ),
            Self::BatchSizeExceeded { limit, attempted } => write!(
                f,
                "the insertion limit is {limit}, {attempted} were attempted to be inserted"
            ),
            Self::InconsistentIdMode { table } => write!(
                f,
                "insert into {table} mixed caller-supplied and generated ids; a batch must use one id mode"
            ),
            Self::RowNotFound { table, id } => {
                write!(f, "no live annotation with id {id} in table {table}")
            }
            Self::LinkTargetMissing { table } => write!(
                f,
                "linking failed: annotation table {table} (or its segmentation table) does not exist"
            ),
            Self::LinkAlreadyExists { table, ids } => write!(
                f,
                "annotation ids {ids:?} already linked in segmentation table {table}"
            ),
            Self::UnknownField { table, field } => {
                write!(f, "table {table} schema does not declare field {field}")
            }
            Self::FieldTypeMismatch {
                table,
                field,
                expected,
            } => write!(
                f,
                "table {table} field {field} expects a {} value",
                expected.label()
            ),
            Self::MissingField { table, field } => {
                write!(f, "table {table} row is missing required field {field}")
            }
            Self::SchemaDrift { table, detail } => write!(
                f,
                "table {table} drifted from its schema definition: {detail}"
            ),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "connection not bootstrapped: metadata version {actual_version}, expected {expected_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "required metadata table {table} is missing")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Schema(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SchemaError> for RepoError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Current time as Unix epoch milliseconds.
pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn int_to_bool(table: &str, column: &str, value: i64) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean value `{other}` in {table}.{column}"
        ))),
    }
}

/// Verifies the connection went through `db::open` bootstrap: migration
/// version current and both metadata tables present.
pub(crate) fn check_initialized(conn: &Connection) -> RepoResult<()> {
    let expected_version = crate::db::migrations::latest_version();
    let actual_version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in ["annotation_table_metadata", "segmentation_table_metadata"] {
        if !physical_table_exists(conn, table)? {
            return Err(RepoError::MissingRequiredTable(table));
        }
    }

    Ok(())
}

/// Whether a physical table (or view) of this name exists.
pub(crate) fn physical_table_exists(conn: &Connection, table_name: &str) -> RepoResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1;",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
