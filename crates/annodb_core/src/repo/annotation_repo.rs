//! Annotation CRUD contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide insert/update/delete/query operations over materialized
//!   annotation tables.
//! - Enforce per-call schema validation, the batch ceiling, and the
//!   single-id-mode rule.
//!
//! # Invariants
//! - Updates are supersede-and-insert; historical rows are never mutated
//!   beyond their versioning columns.
//! - Deletes are tombstones; storage is never erased here.
//! - A failed call commits zero rows.

use super::table_registry::{fetch_metadata, SqliteTableRegistry, TableRegistry};
use super::{
    bool_to_int, check_initialized, int_to_bool, now_epoch_ms, RepoError, RepoResult,
    ANNOTATION_INSERT_LIMIT,
};
use crate::model::field::{AnnotationFields, AnnotationInsert, AnnotationRow, FieldKind, FieldValue};
use crate::schema::{build_annotation_table, translator::field_columns, SchemaDescriptor,
    SchemaRegistry, TableDefinition};
use log::info;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

/// Filter options for `get_annotations`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationQuery {
    /// Restrict to these annotation ids.
    pub ids: Option<Vec<i64>>,
    /// Include superseded and soft-deleted rows.
    pub include_history: bool,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Repository interface for annotation row CRUD.
pub trait AnnotationRepository {
    fn insert_annotations(&self, table_name: &str, rows: &[AnnotationInsert])
        -> RepoResult<Vec<i64>>;
    fn update_annotation(
        &self,
        table_name: &str,
        id: i64,
        fields: &AnnotationFields,
    ) -> RepoResult<i64>;
    fn delete_annotation(&self, table_name: &str, id: i64) -> RepoResult<i64>;
    fn get_annotation(
        &self,
        table_name: &str,
        id: i64,
        include_history: bool,
    ) -> RepoResult<Option<AnnotationRow>>;
    fn get_annotations(
        &self,
        table_name: &str,
        query: &AnnotationQuery,
    ) -> RepoResult<Vec<AnnotationRow>>;
    fn get_valid_table_names(&self) -> RepoResult<Vec<String>>;
}

/// SQLite-backed annotation repository.
pub struct SqliteAnnotationRepository<'a> {
    conn: &'a Connection,
    schemas: &'a SchemaRegistry,
}

impl<'a> SqliteAnnotationRepository<'a> {
    /// Binds the repository to a bootstrapped connection.
    pub fn try_new(conn: &'a Connection, schemas: &'a SchemaRegistry) -> RepoResult<Self> {
        check_initialized(conn)?;
        Ok(Self { conn, schemas })
    }
}

impl AnnotationRepository for SqliteAnnotationRepository<'_> {
    fn insert_annotations(
        &self,
        table_name: &str,
        rows: &[AnnotationInsert],
    ) -> RepoResult<Vec<i64>> {
        if rows.len() > ANNOTATION_INSERT_LIMIT {
            return Err(RepoError::BatchSizeExceeded {
                limit: ANNOTATION_INSERT_LIMIT,
                attempted: rows.len(),
            });
        }
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let model = AnnotationModel::load(self.conn, self.schemas, table_name)?;

        let tx = self.conn.unchecked_transaction()?;
        let ids = insert_annotation_rows(&tx, &model, rows)?;
        bump_last_modified(&tx, table_name)?;
        tx.commit()?;

        info!(
            "event=annotation_insert module=annotation status=ok table={table_name} rows={}",
            ids.len()
        );
        Ok(ids)
    }

    fn update_annotation(
        &self,
        table_name: &str,
        id: i64,
        fields: &AnnotationFields,
    ) -> RepoResult<i64> {
        let model = AnnotationModel::load(self.conn, self.schemas, table_name)?;
        validate_fields(table_name, &model.descriptor, fields)?;

        let tx = self.conn.unchecked_transaction()?;
        let new_id = supersede_annotation_row(&tx, &model, id, fields)?;
        bump_last_modified(&tx, table_name)?;
        tx.commit()?;

        info!(
            "event=annotation_update module=annotation status=ok table={table_name} old_id={id} new_id={new_id}"
        );
        Ok(new_id)
    }

    fn delete_annotation(&self, table_name: &str, id: i64) -> RepoResult<i64> {
        let model = AnnotationModel::load(self.conn, self.schemas, table_name)?;

        let tx = self.conn.unchecked_transaction()?;
        require_live_row(&tx, table_name, id)?;

        tx.execute(
            &format!(
                "UPDATE \"{}\" SET deleted = ?1, valid = 0 WHERE id = ?2;",
                model.table_name()
            ),
            params![now_epoch_ms(), id],
        )?;
        bump_last_modified(&tx, table_name)?;
        tx.commit()?;

        info!("event=annotation_delete module=annotation status=ok table={table_name} id={id}");
        Ok(id)
    }

    fn get_annotation(
        &self,
        table_name: &str,
        id: i64,
        include_history: bool,
    ) -> RepoResult<Option<AnnotationRow>> {
        let query = AnnotationQuery {
            ids: Some(vec![id]),
            include_history,
            ..AnnotationQuery::default()
        };
        Ok(self.get_annotations(table_name, &query)?.into_iter().next())
    }

    fn get_annotations(
        &self,
        table_name: &str,
        query: &AnnotationQuery,
    ) -> RepoResult<Vec<AnnotationRow>> {
        let model = AnnotationModel::load(self.conn, self.schemas, table_name)?;

        let mut sql = format!("{} WHERE 1 = 1", select_sql(&model));
        let mut bind_values: Vec<Value> = Vec::new();

        if !query.include_history {
            sql.push_str(" AND valid = 1 AND deleted IS NULL AND superseded_id IS NULL");
        }
        if let Some(ids) = &query.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND id IN ({placeholders})"));
            bind_values.extend(ids.iter().map(|id| Value::Integer(*id)));
        }

        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(Value::Integer(i64::from(query.offset)));
            }
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut annotations = Vec::new();
        while let Some(row) = rows.next()? {
            annotations.push(parse_annotation_row(&model, row)?);
        }
        Ok(annotations)
    }

    fn get_valid_table_names(&self) -> RepoResult<Vec<String>> {
        SqliteTableRegistry::try_new(self.conn, self.schemas)?.get_valid_table_names()
    }
}

/// Resolved per-call model of one materialized annotation table: schema
/// descriptor and physical definition, verified against the live table.
pub(crate) struct AnnotationModel {
    pub(crate) descriptor: SchemaDescriptor,
    definition: TableDefinition,
}

impl AnnotationModel {
    /// Loads the model, re-reading authoritative metadata and verifying the
    /// physical column set still matches what the schema type implies.
    pub(crate) fn load(
        conn: &Connection,
        schemas: &SchemaRegistry,
        table_name: &str,
    ) -> RepoResult<Self> {
        let metadata =
            fetch_metadata(conn, table_name)?.ok_or_else(|| RepoError::TableNotFound {
                table: table_name.to_string(),
            })?;
        let descriptor = schemas.get(&metadata.schema_type)?.clone();
        let definition =
            build_annotation_table(table_name, &descriptor, metadata.reference_table.as_deref())?;
        verify_columns(conn, &definition)?;
        Ok(Self {
            descriptor,
            definition,
        })
    }

    pub(crate) fn table_name(&self) -> &str {
        self.definition.table_name()
    }
}

/// Compares the physical column set against the definition; any drift is a
/// fatal configuration error.
pub(crate) fn verify_columns(conn: &Connection, definition: &TableDefinition) -> RepoResult<()> {
    let table = definition.table_name();
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\");"))?;
    let mut rows = stmt.query([])?;
    let mut actual: Vec<String> = Vec::new();
    while let Some(row) = rows.next()? {
        actual.push(row.get(1)?);
    }

    if actual.is_empty() {
        return Err(RepoError::SchemaDrift {
            table: table.to_string(),
            detail: "physical table is missing".to_string(),
        });
    }
    if actual != definition.column_names() {
        return Err(RepoError::SchemaDrift {
            table: table.to_string(),
            detail: format!(
                "expected columns {:?}, found {:?}",
                definition.column_names(),
                actual
            ),
        });
    }
    Ok(())
}

/// Validates one row's field map against the descriptor: every declared
/// field present with the declared kind, nothing extra.
pub(crate) fn validate_fields(
    table_name: &str,
    descriptor: &SchemaDescriptor,
    fields: &AnnotationFields,
) -> RepoResult<()> {
    for field in descriptor.fields() {
        match fields.get(&field.name) {
            None => {
                return Err(RepoError::MissingField {
                    table: table_name.to_string(),
                    field: field.name.clone(),
                })
            }
            Some(value) if value.kind() != field.kind => {
                return Err(RepoError::FieldTypeMismatch {
                    table: table_name.to_string(),
                    field: field.name.clone(),
                    expected: field.kind,
                })
            }
            Some(_) => {}
        }
    }
    for name in fields.keys() {
        if descriptor.field(name).is_none() {
            return Err(RepoError::UnknownField {
                table: table_name.to_string(),
                field: name.clone(),
            });
        }
    }
    Ok(())
}

/// Inserts validated rows inside the caller's transaction and returns the
/// committed ids in input order. Enforces the single-id-mode rule.
pub(crate) fn insert_annotation_rows(
    conn: &Connection,
    model: &AnnotationModel,
    rows: &[AnnotationInsert],
) -> RepoResult<Vec<i64>> {
    let table_name = model.table_name();

    let with_ids = rows.iter().filter(|row| row.id.is_some()).count();
    let caller_ids = match with_ids {
        0 => false,
        n if n == rows.len() => true,
        _ => {
            return Err(RepoError::InconsistentIdMode {
                table: table_name.to_string(),
            })
        }
    };

    for row in rows {
        validate_fields(table_name, &model.descriptor, &row.fields)?;
    }

    let now = now_epoch_ms();
    let sql = insert_sql(model, caller_ids);
    let mut stmt = conn.prepare(&sql)?;
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        stmt.execute(params_from_iter(row_bind_values(
            &model.descriptor,
            row.id,
            &row.fields,
            now,
        )))?;
        ids.push(match row.id {
            Some(id) => id,
            None => conn.last_insert_rowid(),
        });
    }
    Ok(ids)
}

/// Inserts the replacement row for `id` and tombstones the original inside
/// the caller's transaction; returns the replacement's id. Fails when no
/// live row carries `id`.
pub(crate) fn supersede_annotation_row(
    conn: &Connection,
    model: &AnnotationModel,
    id: i64,
    fields: &AnnotationFields,
) -> RepoResult<i64> {
    require_live_row(conn, model.table_name(), id)?;

    let now = now_epoch_ms();
    let sql = insert_sql(model, false);
    conn.execute(
        &sql,
        params_from_iter(row_bind_values(&model.descriptor, None, fields, now)),
    )?;
    let new_id = conn.last_insert_rowid();

    conn.execute(
        &format!(
            "UPDATE \"{}\"
             SET deleted = ?1, superseded_id = ?2, valid = 0
             WHERE id = ?3;",
            model.table_name()
        ),
        params![now, new_id, id],
    )?;
    Ok(new_id)
}

/// Marks `table_name`'s metadata row as just modified.
pub(crate) fn bump_last_modified(conn: &Connection, table_name: &str) -> RepoResult<()> {
    conn.execute(
        "UPDATE annotation_table_metadata SET last_modified = ?1 WHERE table_name = ?2;",
        params![now_epoch_ms(), table_name],
    )?;
    Ok(())
}

/// Fails with `RowNotFound` unless a live row carries `id`.
pub(crate) fn require_live_row(conn: &Connection, table_name: &str, id: i64) -> RepoResult<()> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM \"{table_name}\"
             WHERE id = ?1 AND valid = 1 AND deleted IS NULL AND superseded_id IS NULL;"
        ),
        [id],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Err(RepoError::RowNotFound {
            table: table_name.to_string(),
            id,
        });
    }
    Ok(())
}

fn insert_sql(model: &AnnotationModel, with_id: bool) -> String {
    let mut columns: Vec<String> = Vec::new();
    if with_id {
        columns.push("id".to_string());
    }
    columns.push("created".to_string());
    columns.push("valid".to_string());
    for field in model.descriptor.fields() {
        for column in field_columns(field) {
            columns.push(column.name);
        }
    }

    let quoted: Vec<String> = columns.iter().map(|name| format!("\"{name}\"")).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({});",
        model.table_name(),
        quoted.join(", "),
        placeholders
    )
}

fn row_bind_values(
    descriptor: &SchemaDescriptor,
    id: Option<i64>,
    fields: &AnnotationFields,
    created: i64,
) -> Vec<Value> {
    let mut values = Vec::new();
    if let Some(id) = id {
        values.push(Value::Integer(id));
    }
    values.push(Value::Integer(created));
    values.push(Value::Integer(bool_to_int(true)));
    for field in descriptor.fields() {
        // Validated upstream; a missing field cannot occur here.
        match fields.get(&field.name) {
            Some(FieldValue::Point([x, y, z])) => {
                values.push(Value::Real(*x));
                values.push(Value::Real(*y));
                values.push(Value::Real(*z));
            }
            Some(FieldValue::Number(number)) => values.push(Value::Real(*number)),
            Some(FieldValue::Text(text)) => values.push(Value::Text(text.clone())),
            Some(FieldValue::Reference(target)) => values.push(Value::Integer(*target)),
            None => values.push(Value::Null),
        }
    }
    values
}

fn select_sql(model: &AnnotationModel) -> String {
    let mut columns = vec![
        "id".to_string(),
        "created".to_string(),
        "deleted".to_string(),
        "superseded_id".to_string(),
        "valid".to_string(),
    ];
    for field in model.descriptor.fields() {
        for column in field_columns(field) {
            columns.push(column.name);
        }
    }
    let quoted: Vec<String> = columns.iter().map(|name| format!("\"{name}\"")).collect();
    format!("SELECT {} FROM \"{}\"", quoted.join(", "), model.table_name())
}

/// Parses one SELECT result row into the domain shape.
pub(crate) fn parse_annotation_row(
    model: &AnnotationModel,
    row: &Row<'_>,
) -> RepoResult<AnnotationRow> {
    let table_name = model.table_name();
    let id: i64 = row.get("id")?;
    let valid = int_to_bool(table_name, "valid", row.get("valid")?)?;

    let mut fields = AnnotationFields::new();
    for field in model.descriptor.fields() {
        let value = match field.kind {
            FieldKind::Point => {
                let x: f64 = row.get(format!("{}_x", field.name).as_str())?;
                let y: f64 = row.get(format!("{}_y", field.name).as_str())?;
                let z: f64 = row.get(format!("{}_z", field.name).as_str())?;
                FieldValue::Point([x, y, z])
            }
            FieldKind::Number => FieldValue::Number(row.get(field.name.as_str())?),
            FieldKind::Text => FieldValue::Text(row.get(field.name.as_str())?),
            FieldKind::Reference => FieldValue::Reference(row.get(field.name.as_str())?),
        };
        fields.insert(field.name.clone(), value);
    }

    Ok(AnnotationRow {
        id,
        created: row.get("created")?,
        deleted: row.get("deleted")?,
        superseded_id: row.get("superseded_id")?,
        valid,
        fields,
    })
}
