//! Table registry contracts and SQLite implementation.
//!
//! # Responsibility
//! - Track one metadata row per materialized annotation table.
//! - Materialize the physical table and its metadata as a single
//!   transactional unit.
//!
//! # Invariants
//! - `table_name` is unique across the metadata table; duplicates fail
//!   before any DDL runs.
//! - Reference tables only commit when their target table already exists.
//! - Deprecation never removes metadata while the physical table exists.

use super::{
    bool_to_int, check_initialized, int_to_bool, now_epoch_ms, physical_table_exists, RepoError,
    RepoResult,
};
use crate::model::metadata::{
    CreateTableRequest, TableFilter, TableMetadata, TableMetadataUpdate, VoxelResolution,
};
use crate::naming::is_valid_identifier;
use crate::schema::{build_annotation_table, SchemaError, SchemaRegistry};
use log::info;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

const METADATA_SELECT_SQL: &str = "SELECT
    table_name,
    schema_type,
    description,
    user_id,
    valid,
    created,
    deleted,
    flat_segmentation_source,
    reference_table,
    track_target_id_updates,
    last_modified,
    voxel_resolution_x,
    voxel_resolution_y,
    voxel_resolution_z
FROM annotation_table_metadata";

/// Registry interface for annotation-table lifecycle operations.
pub trait TableRegistry {
    fn create_table(&self, request: &CreateTableRequest) -> RepoResult<TableMetadata>;
    fn get_table_metadata(&self, table_name: &str) -> RepoResult<TableMetadata>;
    fn table_exists(&self, table_name: &str) -> RepoResult<bool>;
    fn list_tables(&self, filter: &TableFilter) -> RepoResult<Vec<TableMetadata>>;
    fn get_valid_table_names(&self) -> RepoResult<Vec<String>>;
    fn update_table_metadata(
        &self,
        table_name: &str,
        update: &TableMetadataUpdate,
    ) -> RepoResult<TableMetadata>;
    fn delete_table(&self, table_name: &str) -> RepoResult<TableMetadata>;
    fn drop_table(&self, table_name: &str) -> RepoResult<()>;
}

/// SQLite-backed table registry.
pub struct SqliteTableRegistry<'a> {
    conn: &'a Connection,
    schemas: &'a SchemaRegistry,
}

impl<'a> SqliteTableRegistry<'a> {
    /// Binds the registry to a bootstrapped connection.
    ///
    /// Fails when the connection has not run migrations or lacks the
    /// metadata tables.
    pub fn try_new(conn: &'a Connection, schemas: &'a SchemaRegistry) -> RepoResult<Self> {
        check_initialized(conn)?;
        Ok(Self { conn, schemas })
    }

    /// Row count of a materialized table, optionally restricted to live
    /// rows.
    pub fn get_table_row_count(&self, table_name: &str, live_only: bool) -> RepoResult<i64> {
        let table = self.vetted_existing_table(table_name)?;
        let mut sql = format!("SELECT COUNT(*) FROM \"{table}\"");
        if live_only {
            sql.push_str(" WHERE valid = 1 AND deleted IS NULL AND superseded_id IS NULL");
        }
        let count = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    /// Smallest annotation id in a materialized table, `None` when empty.
    pub fn get_min_id_value(&self, table_name: &str) -> RepoResult<Option<i64>> {
        let table = self.vetted_existing_table(table_name)?;
        let min = self
            .conn
            .query_row(&format!("SELECT MIN(id) FROM \"{table}\""), [], |row| {
                row.get(0)
            })?;
        Ok(min)
    }

    /// Largest annotation id in a materialized table, `None` when empty.
    pub fn get_max_id_value(&self, table_name: &str) -> RepoResult<Option<i64>> {
        let table = self.vetted_existing_table(table_name)?;
        let max = self
            .conn
            .query_row(&format!("SELECT MAX(id) FROM \"{table}\""), [], |row| {
                row.get(0)
            })?;
        Ok(max)
    }

    fn vetted_existing_table(&self, table_name: &str) -> RepoResult<String> {
        if !is_valid_identifier(table_name) {
            return Err(RepoError::Schema(SchemaError::InvalidName {
                kind: "table",
                name: table_name.to_string(),
            }));
        }
        if fetch_metadata(self.conn, table_name)?.is_none() {
            return Err(RepoError::TableNotFound {
                table: table_name.to_string(),
            });
        }
        Ok(table_name.to_string())
    }
}

impl TableRegistry for SqliteTableRegistry<'_> {
    fn create_table(&self, request: &CreateTableRequest) -> RepoResult<TableMetadata> {
        let descriptor = self.schemas.get(&request.schema_type)?;
        let definition = build_annotation_table(
            &request.table_name,
            descriptor,
            request.reference_table.as_deref(),
        )?;

        let tx = self.conn.unchecked_transaction()?;

        if fetch_metadata(&tx, &request.table_name)?.is_some()
            || physical_table_exists(&tx, &request.table_name)?
        {
            return Err(RepoError::TableAlreadyExists {
                table: request.table_name.clone(),
            });
        }

        if let Some(target) = request.reference_table.as_deref() {
            if fetch_metadata(&tx, target)?.is_none() {
                return Err(RepoError::ReferenceTargetNotFound {
                    table: request.table_name.clone(),
                    target: target.to_string(),
                });
            }
        }

        tx.execute_batch(definition.create_table_sql())?;

        let now = now_epoch_ms();
        tx.execute(
            "INSERT INTO annotation_table_metadata (
                table_name,
                schema_type,
                description,
                user_id,
                valid,
                created,
                deleted,
                flat_segmentation_source,
                reference_table,
                track_target_id_updates,
                last_modified,
                voxel_resolution_x,
                voxel_resolution_y,
                voxel_resolution_z
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, NULL, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
            params![
                request.table_name,
                request.schema_type,
                request.description,
                request.user_id,
                now,
                request.flat_segmentation_source.as_deref(),
                request.reference_table.as_deref(),
                request.track_target_id_updates.map(bool_to_int),
                now,
                request.voxel_resolution.x,
                request.voxel_resolution.y,
                request.voxel_resolution.z,
            ],
        )?;
        tx.commit()?;

        info!(
            "event=table_create module=registry status=ok table={} schema_type={}",
            request.table_name, request.schema_type
        );
        self.get_table_metadata(&request.table_name)
    }

    fn get_table_metadata(&self, table_name: &str) -> RepoResult<TableMetadata> {
        fetch_metadata(self.conn, table_name)?.ok_or_else(|| RepoError::TableNotFound {
            table: table_name.to_string(),
        })
    }

    fn table_exists(&self, table_name: &str) -> RepoResult<bool> {
        Ok(fetch_metadata(self.conn, table_name)?.is_some())
    }

    fn list_tables(&self, filter: &TableFilter) -> RepoResult<Vec<TableMetadata>> {
        let mut sql = format!("{METADATA_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if !filter.include_deprecated {
            sql.push_str(" AND valid = 1 AND deleted IS NULL");
        }
        if let Some(schema_type) = &filter.schema_type {
            sql.push_str(" AND schema_type = ?");
            bind_values.push(Value::Text(schema_type.clone()));
        }
        sql.push_str(" ORDER BY table_name ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut tables = Vec::new();
        while let Some(row) = rows.next()? {
            tables.push(parse_metadata_row(row)?);
        }
        Ok(tables)
    }

    fn get_valid_table_names(&self) -> RepoResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name FROM annotation_table_metadata
             WHERE valid = 1 AND deleted IS NULL
             ORDER BY table_name ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut names = Vec::new();
        while let Some(row) = rows.next()? {
            names.push(row.get(0)?);
        }
        Ok(names)
    }

    fn update_table_metadata(
        &self,
        table_name: &str,
        update: &TableMetadataUpdate,
    ) -> RepoResult<TableMetadata> {
        self.get_table_metadata(table_name)?;

        let mut assignments = Vec::new();
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some(description) = &update.description {
            assignments.push("description = ?");
            bind_values.push(Value::Text(description.clone()));
        }
        if let Some(user_id) = &update.user_id {
            assignments.push("user_id = ?");
            bind_values.push(Value::Text(user_id.clone()));
        }
        if let Some(source) = &update.flat_segmentation_source {
            assignments.push("flat_segmentation_source = ?");
            bind_values.push(Value::Text(source.clone()));
        }

        if !assignments.is_empty() {
            assignments.push("last_modified = ?");
            bind_values.push(Value::Integer(now_epoch_ms()));
            bind_values.push(Value::Text(table_name.to_string()));
            let sql = format!(
                "UPDATE annotation_table_metadata SET {} WHERE table_name = ?;",
                assignments.join(", ")
            );
            self.conn.execute(&sql, params_from_iter(bind_values))?;
        }

        self.get_table_metadata(table_name)
    }

    fn delete_table(&self, table_name: &str) -> RepoResult<TableMetadata> {
        self.get_table_metadata(table_name)?;

        self.conn.execute(
            "UPDATE annotation_table_metadata
             SET valid = 0, deleted = ?1
             WHERE table_name = ?2;",
            params![now_epoch_ms(), table_name],
        )?;
        info!("event=table_deprecate module=registry status=ok table={table_name}");
        self.get_table_metadata(table_name)
    }

    fn drop_table(&self, table_name: &str) -> RepoResult<()> {
        let table = self.vetted_existing_table(table_name)?;

        let tx = self.conn.unchecked_transaction()?;

        let mut seg_tables: Vec<String> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT table_name FROM segmentation_table_metadata
                 WHERE annotation_table = ?1;",
            )?;
            let mut rows = stmt.query([&table])?;
            while let Some(row) = rows.next()? {
                seg_tables.push(row.get(0)?);
            }
        }

        for seg_table in &seg_tables {
            if !is_valid_identifier(seg_table) {
                return Err(RepoError::InvalidData(format!(
                    "segmentation metadata names unsafe table `{seg_table}`"
                )));
            }
            tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{seg_table}\";"))?;
        }
        tx.execute(
            "DELETE FROM segmentation_table_metadata WHERE annotation_table = ?1;",
            [&table],
        )?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
        tx.execute(
            "DELETE FROM annotation_table_metadata WHERE table_name = ?1;",
            [&table],
        )?;
        tx.commit()?;

        info!(
            "event=table_drop module=registry status=ok table={table} segmentation_tables={}",
            seg_tables.len()
        );
        Ok(())
    }
}

/// Reads one annotation-table metadata row, `None` when absent.
pub(crate) fn fetch_metadata(
    conn: &Connection,
    table_name: &str,
) -> RepoResult<Option<TableMetadata>> {
    let mut stmt = conn.prepare(&format!("{METADATA_SELECT_SQL} WHERE table_name = ?1;"))?;
    let metadata = stmt
        .query_row([table_name], |row| Ok(parse_metadata_row(row)))
        .optional()?;
    metadata.transpose()
}

fn parse_metadata_row(row: &Row<'_>) -> RepoResult<TableMetadata> {
    let table_name: String = row.get("table_name")?;
    let valid = int_to_bool(&table_name, "valid", row.get("valid")?)?;
    let track_target_id_updates = match row.get::<_, Option<i64>>("track_target_id_updates")? {
        Some(value) => Some(int_to_bool(&table_name, "track_target_id_updates", value)?),
        None => None,
    };

    Ok(TableMetadata {
        schema_type: row.get("schema_type")?,
        description: row.get("description")?,
        user_id: row.get("user_id")?,
        valid,
        created: row.get("created")?,
        deleted: row.get("deleted")?,
        flat_segmentation_source: row.get("flat_segmentation_source")?,
        reference_table: row.get("reference_table")?,
        track_target_id_updates,
        last_modified: row.get("last_modified")?,
        voxel_resolution: VoxelResolution {
            x: row.get("voxel_resolution_x")?,
            y: row.get("voxel_resolution_y")?,
            z: row.get("voxel_resolution_z")?,
        },
        table_name,
    })
}
