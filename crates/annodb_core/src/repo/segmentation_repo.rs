//! Segmentation linking contracts and SQLite implementation.
//!
//! # Responsibility
//! - Create segmentation tables paired 1:1 with annotation tables.
//! - Insert and query segmentation rows linked to annotation row ids.
//!
//! # Invariants
//! - A segmentation table only exists alongside its annotation table; the
//!   pairing is encoded in the `{table}__{source}` name and in metadata.
//! - Linked inserts are atomic: an annotation row and its segmentation row
//!   commit together or not at all.

use super::annotation_repo::{
    bump_last_modified, insert_annotation_rows, parse_annotation_row, require_live_row,
    supersede_annotation_row, validate_fields, verify_columns, AnnotationModel,
};
use super::table_registry::fetch_metadata;
use super::{check_initialized, int_to_bool, now_epoch_ms, RepoError, RepoResult,
    ANNOTATION_INSERT_LIMIT};
use crate::model::field::{
    AnnotationFields, LinkedAnnotationInsert, LinkedAnnotationRow, SegmentationIds,
    SegmentationRow,
};
use crate::model::metadata::SegmentationTableMetadata;
use crate::naming::{build_segmentation_table_name, is_valid_identifier};
use crate::schema::{build_segmentation_table, SchemaError, SchemaRegistry, TableDefinition};
use log::info;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

const SEG_METADATA_SELECT_SQL: &str = "SELECT
    table_name,
    schema_type,
    annotation_table,
    pcg_table_name,
    valid,
    created,
    deleted,
    last_updated
FROM segmentation_table_metadata";

/// Repository interface for segmentation-linked operations.
pub trait SegmentationRepository {
    fn create_segmentation_table(
        &self,
        table_name: &str,
        schema_type: &str,
        segmentation_source: &str,
    ) -> RepoResult<SegmentationTableMetadata>;
    fn get_segmentation_table_metadata(
        &self,
        table_name: &str,
        pcg_table_name: &str,
    ) -> RepoResult<Option<SegmentationTableMetadata>>;
    fn get_linked_tables(&self, table_name: &str) -> RepoResult<Vec<SegmentationTableMetadata>>;
    fn insert_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotations: &[LinkedAnnotationInsert],
    ) -> RepoResult<Vec<i64>>;
    fn insert_linked_segmentations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        rows: &[SegmentationRow],
    ) -> RepoResult<Vec<i64>>;
    fn update_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        id: i64,
        fields: &AnnotationFields,
    ) -> RepoResult<i64>;
    fn get_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotation_ids: &[i64],
    ) -> RepoResult<Vec<LinkedAnnotationRow>>;
    fn delete_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotation_ids: &[i64],
    ) -> RepoResult<Vec<i64>>;
}

/// SQLite-backed segmentation repository.
pub struct SqliteSegmentationRepository<'a> {
    conn: &'a Connection,
    schemas: &'a SchemaRegistry,
}

impl<'a> SqliteSegmentationRepository<'a> {
    /// Binds the repository to a bootstrapped connection.
    pub fn try_new(conn: &'a Connection, schemas: &'a SchemaRegistry) -> RepoResult<Self> {
        check_initialized(conn)?;
        Ok(Self { conn, schemas })
    }

    /// Resolves the annotation model plus the segmentation table definition
    /// for one linked pair, verifying both physical tables.
    fn load_linked_model(
        &self,
        table_name: &str,
        pcg_table_name: &str,
    ) -> RepoResult<LinkedModel> {
        let annotation = AnnotationModel::load(self.conn, self.schemas, table_name)
            .map_err(|err| missing_link(err, table_name))?;

        let seg_table_name = build_segmentation_table_name(table_name, pcg_table_name);
        if fetch_seg_metadata(self.conn, &seg_table_name)?.is_none() {
            return Err(RepoError::LinkTargetMissing {
                table: seg_table_name,
            });
        }

        let definition =
            build_segmentation_table(&seg_table_name, table_name, &annotation.descriptor)?;
        verify_columns(self.conn, &definition)?;

        Ok(LinkedModel {
            annotation,
            definition,
        })
    }
}

impl SegmentationRepository for SqliteSegmentationRepository<'_> {
    fn create_segmentation_table(
        &self,
        table_name: &str,
        schema_type: &str,
        segmentation_source: &str,
    ) -> RepoResult<SegmentationTableMetadata> {
        if !is_valid_identifier(segmentation_source) {
            return Err(RepoError::Schema(SchemaError::InvalidName {
                kind: "segmentation source",
                name: segmentation_source.to_string(),
            }));
        }

        let annotation_metadata =
            fetch_metadata(self.conn, table_name)?.ok_or_else(|| RepoError::LinkTargetMissing {
                table: table_name.to_string(),
            })?;
        if annotation_metadata.schema_type != schema_type {
            return Err(RepoError::InvalidData(format!(
                "segmentation schema_type {schema_type} does not match annotation table {} schema_type {}",
                table_name, annotation_metadata.schema_type
            )));
        }
        let descriptor = self.schemas.get(schema_type)?;

        let seg_table_name = build_segmentation_table_name(table_name, segmentation_source);
        let definition = build_segmentation_table(&seg_table_name, table_name, descriptor)?;

        let tx = self.conn.unchecked_transaction()?;
        if fetch_seg_metadata(&tx, &seg_table_name)?.is_some()
            || super::physical_table_exists(&tx, &seg_table_name)?
        {
            return Err(RepoError::TableAlreadyExists {
                table: seg_table_name,
            });
        }

        tx.execute_batch(definition.create_table_sql())?;
        tx.execute(
            "INSERT INTO segmentation_table_metadata (
                table_name,
                schema_type,
                annotation_table,
                pcg_table_name,
                valid,
                created,
                deleted,
                last_updated
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, NULL, NULL);",
            params![
                seg_table_name,
                schema_type,
                table_name,
                segmentation_source,
                now_epoch_ms(),
            ],
        )?;
        tx.commit()?;

        info!(
            "event=segmentation_table_create module=segmentation status=ok table={seg_table_name} annotation_table={table_name}"
        );
        fetch_seg_metadata(self.conn, &seg_table_name)?.ok_or_else(|| {
            RepoError::InvalidData(format!(
                "segmentation metadata for {seg_table_name} vanished after commit"
            ))
        })
    }

    fn get_segmentation_table_metadata(
        &self,
        table_name: &str,
        pcg_table_name: &str,
    ) -> RepoResult<Option<SegmentationTableMetadata>> {
        let seg_table_name = build_segmentation_table_name(table_name, pcg_table_name);
        fetch_seg_metadata(self.conn, &seg_table_name)
    }

    fn get_linked_tables(&self, table_name: &str) -> RepoResult<Vec<SegmentationTableMetadata>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SEG_METADATA_SELECT_SQL} WHERE annotation_table = ?1;"))?;
        let mut rows = stmt.query([table_name])?;
        let mut tables = Vec::new();
        while let Some(row) = rows.next()? {
            tables.push(parse_seg_metadata_row(row)?);
        }
        Ok(tables)
    }

    fn insert_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotations: &[LinkedAnnotationInsert],
    ) -> RepoResult<Vec<i64>> {
        if annotations.len() > ANNOTATION_INSERT_LIMIT {
            return Err(RepoError::BatchSizeExceeded {
                limit: ANNOTATION_INSERT_LIMIT,
                attempted: annotations.len(),
            });
        }
        if annotations.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.load_linked_model(table_name, pcg_table_name)?;
        for item in annotations {
            validate_segmentation_ids(&model, &item.segmentation)?;
        }

        let anno_rows: Vec<_> = annotations
            .iter()
            .map(|item| item.annotation.clone())
            .collect();

        let tx = self.conn.unchecked_transaction()?;
        let ids = insert_annotation_rows(&tx, &model.annotation, &anno_rows)?;

        let seg_sql = seg_insert_sql(&model);
        {
            let mut stmt = tx.prepare(&seg_sql)?;
            for (item, id) in annotations.iter().zip(&ids) {
                stmt.execute(params_from_iter(seg_bind_values(
                    &model,
                    *id,
                    &item.segmentation,
                )))?;
            }
        }

        bump_last_modified(&tx, table_name)?;
        bump_last_updated(&tx, model.seg_table_name())?;
        tx.commit()?;

        info!(
            "event=linked_insert module=segmentation status=ok table={table_name} pcg_table={pcg_table_name} rows={}",
            ids.len()
        );
        Ok(ids)
    }

    fn insert_linked_segmentations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        rows: &[SegmentationRow],
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

        let model = self.load_linked_model(table_name, pcg_table_name)?;
        for row in rows {
            validate_segmentation_ids(&model, &row.ids)?;
        }

        let tx = self.conn.unchecked_transaction()?;

        let ids: Vec<i64> = rows.iter().map(|row| row.annotation_id).collect();
        let existing = existing_seg_ids(&tx, model.seg_table_name(), &ids)?;
        if !existing.is_empty() {
            return Err(RepoError::LinkAlreadyExists {
                table: model.seg_table_name().to_string(),
                ids: existing,
            });
        }
        for id in &ids {
            // Segmentation state may lag behind annotation updates, so any
            // persisted annotation row (live or historical) is linkable.
            let count: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM \"{}\" WHERE id = ?1;",
                    model.annotation.table_name()
                ),
                [id],
                |row| row.get(0),
            )?;
            if count == 0 {
                return Err(RepoError::RowNotFound {
                    table: table_name.to_string(),
                    id: *id,
                });
            }
        }

        let seg_sql = seg_insert_sql(&model);
        {
            let mut stmt = tx.prepare(&seg_sql)?;
            for row in rows {
                stmt.execute(params_from_iter(seg_bind_values(
                    &model,
                    row.annotation_id,
                    &row.ids,
                )))?;
            }
        }
        bump_last_updated(&tx, model.seg_table_name())?;
        tx.commit()?;

        Ok(ids)
    }

    fn update_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        id: i64,
        fields: &AnnotationFields,
    ) -> RepoResult<i64> {
        let model = self.load_linked_model(table_name, pcg_table_name)?;
        validate_fields(table_name, &model.annotation.descriptor, fields)?;

        let tx = self.conn.unchecked_transaction()?;
        if existing_seg_ids(&tx, model.seg_table_name(), &[id])?.is_empty() {
            return Err(RepoError::RowNotFound {
                table: model.seg_table_name().to_string(),
                id,
            });
        }

        // The replacement row starts unlinked; its segmentation row arrives
        // later via `insert_linked_segmentations` once graph state catches
        // up.
        let new_id = supersede_annotation_row(&tx, &model.annotation, id, fields)?;
        bump_last_modified(&tx, table_name)?;
        tx.commit()?;

        info!(
            "event=linked_update module=segmentation status=ok table={table_name} pcg_table={pcg_table_name} old_id={id} new_id={new_id}"
        );
        Ok(new_id)
    }

    fn get_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotation_ids: &[i64],
    ) -> RepoResult<Vec<LinkedAnnotationRow>> {
        if annotation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.load_linked_model(table_name, pcg_table_name)?;

        let placeholders = vec!["?"; annotation_ids.len()].join(", ");
        let bind_values: Vec<Value> = annotation_ids
            .iter()
            .map(|id| Value::Integer(*id))
            .collect();

        let mut segmentations: BTreeMap<i64, SegmentationRow> = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(&format!(
                "{} WHERE id IN ({placeholders}) ORDER BY id ASC;",
                seg_select_sql(&model)
            ))?;
            let mut rows = stmt.query(params_from_iter(bind_values.clone()))?;
            while let Some(row) = rows.next()? {
                let parsed = parse_seg_row(&model, row)?;
                segmentations.insert(parsed.annotation_id, parsed);
            }
        }

        let mut linked = Vec::new();
        {
            // The row parser reads columns by name, so the verified physical
            // column set makes `SELECT *` safe here.
            let sql = format!(
                "SELECT * FROM \"{}\" WHERE id IN ({placeholders}) ORDER BY id ASC;",
                model.annotation.table_name()
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(bind_values))?;
            while let Some(row) = rows.next()? {
                let annotation = parse_annotation_row(&model.annotation, row)?;
                if let Some(segmentation) = segmentations.remove(&annotation.id) {
                    linked.push(LinkedAnnotationRow {
                        annotation,
                        segmentation,
                    });
                }
            }
        }
        Ok(linked)
    }

    fn delete_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotation_ids: &[i64],
    ) -> RepoResult<Vec<i64>> {
        if annotation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.load_linked_model(table_name, pcg_table_name)?;

        let tx = self.conn.unchecked_transaction()?;
        let linked_ids = existing_seg_ids(&tx, model.seg_table_name(), annotation_ids)?;

        let mut deleted = Vec::new();
        let now = now_epoch_ms();
        for id in linked_ids {
            if require_live_row(&tx, model.annotation.table_name(), id).is_err() {
                continue;
            }
            tx.execute(
                &format!(
                    "UPDATE \"{}\" SET deleted = ?1, valid = 0 WHERE id = ?2;",
                    model.annotation.table_name()
                ),
                params![now, id],
            )?;
            deleted.push(id);
        }
        if !deleted.is_empty() {
            bump_last_modified(&tx, table_name)?;
        }
        tx.commit()?;
        Ok(deleted)
    }
}

struct LinkedModel {
    annotation: AnnotationModel,
    definition: TableDefinition,
}

impl LinkedModel {
    fn seg_table_name(&self) -> &str {
        self.definition.table_name()
    }
}

fn missing_link(err: RepoError, table_name: &str) -> RepoError {
    match err {
        RepoError::TableNotFound { .. } => RepoError::LinkTargetMissing {
            table: table_name.to_string(),
        },
        other => other,
    }
}

/// Segmentation ids must cover exactly the schema's point fields.
fn validate_segmentation_ids(
    model: &LinkedModel,
    ids: &BTreeMap<String, SegmentationIds>,
) -> RepoResult<()> {
    let table = model.seg_table_name();
    for point_field in model.annotation.descriptor.point_fields() {
        if !ids.contains_key(point_field) {
            return Err(RepoError::MissingField {
                table: table.to_string(),
                field: point_field.to_string(),
            });
        }
    }
    for name in ids.keys() {
        let is_point = model
            .annotation
            .descriptor
            .point_fields()
            .any(|field| field == name);
        if !is_point {
            return Err(RepoError::UnknownField {
                table: table.to_string(),
                field: name.clone(),
            });
        }
    }
    Ok(())
}

fn seg_insert_sql(model: &LinkedModel) -> String {
    let mut columns = vec!["id".to_string()];
    for point_field in model.annotation.descriptor.point_fields() {
        columns.push(format!("{point_field}_supervoxel_id"));
        columns.push(format!("{point_field}_root_id"));
    }
    let quoted: Vec<String> = columns.iter().map(|name| format!("\"{name}\"")).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({});",
        model.seg_table_name(),
        quoted.join(", "),
        placeholders
    )
}

fn seg_select_sql(model: &LinkedModel) -> String {
    let mut columns = vec!["id".to_string()];
    for point_field in model.annotation.descriptor.point_fields() {
        columns.push(format!("{point_field}_supervoxel_id"));
        columns.push(format!("{point_field}_root_id"));
    }
    let quoted: Vec<String> = columns.iter().map(|name| format!("\"{name}\"")).collect();
    format!(
        "SELECT {} FROM \"{}\"",
        quoted.join(", "),
        model.seg_table_name()
    )
}

fn seg_bind_values(
    model: &LinkedModel,
    annotation_id: i64,
    ids: &BTreeMap<String, SegmentationIds>,
) -> Vec<Value> {
    let mut values = vec![Value::Integer(annotation_id)];
    for point_field in model.annotation.descriptor.point_fields() {
        // Validated upstream; every point field is present.
        match ids.get(point_field) {
            Some(seg) => {
                values.push(Value::Integer(seg.supervoxel_id));
                values.push(Value::Integer(seg.root_id));
            }
            None => {
                values.push(Value::Null);
                values.push(Value::Null);
            }
        }
    }
    values
}

fn parse_seg_row(model: &LinkedModel, row: &Row<'_>) -> RepoResult<SegmentationRow> {
    let annotation_id: i64 = row.get("id")?;
    let mut ids = BTreeMap::new();
    for point_field in model.annotation.descriptor.point_fields() {
        let supervoxel_id: i64 = row.get(format!("{point_field}_supervoxel_id").as_str())?;
        let root_id: i64 = row.get(format!("{point_field}_root_id").as_str())?;
        ids.insert(
            point_field.to_string(),
            SegmentationIds {
                supervoxel_id,
                root_id,
            },
        );
    }
    Ok(SegmentationRow { annotation_id, ids })
}

fn existing_seg_ids(conn: &Connection, seg_table: &str, ids: &[i64]) -> RepoResult<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let bind_values: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM \"{seg_table}\" WHERE id IN ({placeholders}) ORDER BY id ASC;"
    ))?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut existing = Vec::new();
    while let Some(row) = rows.next()? {
        existing.push(row.get(0)?);
    }
    Ok(existing)
}

/// Marks a segmentation table's metadata as just updated.
fn bump_last_updated(conn: &Connection, seg_table_name: &str) -> RepoResult<()> {
    conn.execute(
        "UPDATE segmentation_table_metadata SET last_updated = ?1 WHERE table_name = ?2;",
        params![now_epoch_ms(), seg_table_name],
    )?;
    Ok(())
}

/// Reads one segmentation-table metadata row, `None` when absent.
pub(crate) fn fetch_seg_metadata(
    conn: &Connection,
    seg_table_name: &str,
) -> RepoResult<Option<SegmentationTableMetadata>> {
    let mut stmt = conn.prepare(&format!("{SEG_METADATA_SELECT_SQL} WHERE table_name = ?1;"))?;
    let metadata = stmt
        .query_row([seg_table_name], |row| Ok(parse_seg_metadata_row(row)))
        .optional()?;
    metadata.transpose()
}

fn parse_seg_metadata_row(row: &Row<'_>) -> RepoResult<SegmentationTableMetadata> {
    let table_name: String = row.get("table_name")?;
    let valid = int_to_bool(&table_name, "valid", row.get("valid")?)?;
    Ok(SegmentationTableMetadata {
        schema_type: row.get("schema_type")?,
        annotation_table: row.get("annotation_table")?,
        pcg_table_name: row.get("pcg_table_name")?,
        valid,
        created: row.get("created")?,
        deleted: row.get("deleted")?,
        last_updated: row.get("last_updated")?,
        table_name,
    })
}
