//! Aligned-volume use-case service.
//!
//! # Responsibility
//! - Own one connection per aligned volume for the service lifetime.
//! - Expose the public call surface over registry, annotation, and
//!   segmentation repositories.
//!
//! # Invariants
//! - No table or schema state is cached across calls: every operation
//!   re-reads authoritative metadata through a freshly bound repository.
//! - The service never bypasses repository validation or transaction
//!   boundaries.

use crate::db::{create_or_select_database, open_db_in_memory};
use crate::model::field::{
    AnnotationFields, AnnotationInsert, AnnotationRow, LinkedAnnotationInsert, LinkedAnnotationRow,
    SegmentationRow,
};
use crate::model::metadata::{
    CreateTableRequest, SegmentationTableMetadata, TableFilter, TableMetadata, TableMetadataUpdate,
};
use crate::repo::annotation_repo::{
    AnnotationQuery, AnnotationRepository, SqliteAnnotationRepository,
};
use crate::repo::segmentation_repo::{SegmentationRepository, SqliteSegmentationRepository};
use crate::repo::table_registry::{SqliteTableRegistry, TableRegistry};
use crate::repo::RepoResult;
use crate::schema::{SchemaDescriptor, SchemaRegistry};
use rusqlite::Connection;
use std::path::Path;

/// Facade over one aligned-volume database.
pub struct AnnotationService {
    conn: Connection,
    schemas: SchemaRegistry,
}

impl AnnotationService {
    /// Opens (creating when absent) the aligned volume named `aligned_volume`
    /// under `root_dir`, with the default schema registry.
    pub fn create_or_select(
        aligned_volume: &str,
        root_dir: impl AsRef<Path>,
    ) -> RepoResult<Self> {
        let conn = create_or_select_database(aligned_volume, root_dir)?;
        Self::with_connection(conn, SchemaRegistry::with_defaults())
    }

    /// In-memory volume with the default schema registry. Intended for
    /// tests.
    pub fn in_memory() -> RepoResult<Self> {
        Self::with_connection(open_db_in_memory()?, SchemaRegistry::with_defaults())
    }

    /// Wraps an already bootstrapped connection.
    pub fn with_connection(conn: Connection, schemas: SchemaRegistry) -> RepoResult<Self> {
        // Rejects connections that skipped db::open bootstrap.
        SqliteTableRegistry::try_new(&conn, &schemas)?;
        Ok(Self { conn, schemas })
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Registers an additional schema descriptor for subsequent calls.
    pub fn register_schema(&mut self, descriptor: SchemaDescriptor) {
        self.schemas.register(descriptor);
    }

    fn registry(&self) -> RepoResult<SqliteTableRegistry<'_>> {
        SqliteTableRegistry::try_new(&self.conn, &self.schemas)
    }

    fn annotations(&self) -> RepoResult<SqliteAnnotationRepository<'_>> {
        SqliteAnnotationRepository::try_new(&self.conn, &self.schemas)
    }

    fn segmentations(&self) -> RepoResult<SqliteSegmentationRepository<'_>> {
        SqliteSegmentationRepository::try_new(&self.conn, &self.schemas)
    }

    // Table registry surface.

    /// Materializes a new annotation table from its schema type.
    pub fn create_table(&self, request: &CreateTableRequest) -> RepoResult<TableMetadata> {
        self.registry()?.create_table(request)
    }

    pub fn get_table_metadata(&self, table_name: &str) -> RepoResult<TableMetadata> {
        self.registry()?.get_table_metadata(table_name)
    }

    pub fn table_exists(&self, table_name: &str) -> RepoResult<bool> {
        self.registry()?.table_exists(table_name)
    }

    pub fn list_tables(&self, filter: &TableFilter) -> RepoResult<Vec<TableMetadata>> {
        self.registry()?.list_tables(filter)
    }

    /// Names of tables not marked deprecated.
    pub fn get_valid_table_names(&self) -> RepoResult<Vec<String>> {
        self.registry()?.get_valid_table_names()
    }

    pub fn update_table_metadata(
        &self,
        table_name: &str,
        update: &TableMetadataUpdate,
    ) -> RepoResult<TableMetadata> {
        self.registry()?.update_table_metadata(table_name, update)
    }

    /// Marks a table deprecated; hides it from valid-table queries without
    /// touching the physical table.
    pub fn delete_table(&self, table_name: &str) -> RepoResult<TableMetadata> {
        self.registry()?.delete_table(table_name)
    }

    /// Hard-drops a table, its segmentation tables, and their metadata.
    pub fn drop_table(&self, table_name: &str) -> RepoResult<()> {
        self.registry()?.drop_table(table_name)
    }

    pub fn get_table_row_count(&self, table_name: &str, live_only: bool) -> RepoResult<i64> {
        self.registry()?.get_table_row_count(table_name, live_only)
    }

    pub fn get_min_id_value(&self, table_name: &str) -> RepoResult<Option<i64>> {
        self.registry()?.get_min_id_value(table_name)
    }

    pub fn get_max_id_value(&self, table_name: &str) -> RepoResult<Option<i64>> {
        self.registry()?.get_max_id_value(table_name)
    }

    // Annotation CRUD surface.

    /// Inserts a batch of rows, returning the committed ids in input order.
    pub fn insert_annotations(
        &self,
        table_name: &str,
        rows: &[AnnotationInsert],
    ) -> RepoResult<Vec<i64>> {
        self.annotations()?.insert_annotations(table_name, rows)
    }

    /// Supersedes the live row for `id` with a new row carrying `fields`;
    /// returns the new row's id.
    pub fn update_annotation(
        &self,
        table_name: &str,
        id: i64,
        fields: &AnnotationFields,
    ) -> RepoResult<i64> {
        self.annotations()?.update_annotation(table_name, id, fields)
    }

    /// Soft-deletes the live row for `id`.
    pub fn delete_annotation(&self, table_name: &str, id: i64) -> RepoResult<i64> {
        self.annotations()?.delete_annotation(table_name, id)
    }

    pub fn get_annotation(
        &self,
        table_name: &str,
        id: i64,
        include_history: bool,
    ) -> RepoResult<Option<AnnotationRow>> {
        self.annotations()?.get_annotation(table_name, id, include_history)
    }

    pub fn get_annotations(
        &self,
        table_name: &str,
        query: &AnnotationQuery,
    ) -> RepoResult<Vec<AnnotationRow>> {
        self.annotations()?.get_annotations(table_name, query)
    }

    // Segmentation linking surface.

    pub fn create_segmentation_table(
        &self,
        table_name: &str,
        schema_type: &str,
        segmentation_source: &str,
    ) -> RepoResult<SegmentationTableMetadata> {
        self.segmentations()?
            .create_segmentation_table(table_name, schema_type, segmentation_source)
    }

    pub fn get_segmentation_table_metadata(
        &self,
        table_name: &str,
        pcg_table_name: &str,
    ) -> RepoResult<Option<SegmentationTableMetadata>> {
        self.segmentations()?
            .get_segmentation_table_metadata(table_name, pcg_table_name)
    }

    pub fn get_linked_tables(
        &self,
        table_name: &str,
    ) -> RepoResult<Vec<SegmentationTableMetadata>> {
        self.segmentations()?.get_linked_tables(table_name)
    }

    /// Inserts annotation rows and their segmentation rows as one unit.
    pub fn insert_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotations: &[LinkedAnnotationInsert],
    ) -> RepoResult<Vec<i64>> {
        self.segmentations()?
            .insert_linked_annotations(table_name, pcg_table_name, annotations)
    }

    /// Inserts segmentation rows for already-committed annotation ids.
    pub fn insert_linked_segmentations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        rows: &[SegmentationRow],
    ) -> RepoResult<Vec<i64>> {
        self.segmentations()?
            .insert_linked_segmentations(table_name, pcg_table_name, rows)
    }

    /// Supersedes the live annotation row of a linked pair; the replacement
    /// row is re-linked later through `insert_linked_segmentations`.
    pub fn update_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        id: i64,
        fields: &AnnotationFields,
    ) -> RepoResult<i64> {
        self.segmentations()?
            .update_linked_annotations(table_name, pcg_table_name, id, fields)
    }

    pub fn get_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotation_ids: &[i64],
    ) -> RepoResult<Vec<LinkedAnnotationRow>> {
        self.segmentations()?
            .get_linked_annotations(table_name, pcg_table_name, annotation_ids)
    }

    pub fn delete_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        annotation_ids: &[i64],
    ) -> RepoResult<Vec<i64>> {
        self.segmentations()?
            .delete_linked_annotations(table_name, pcg_table_name, annotation_ids)
    }

    /// Closes the underlying connection, surfacing any close-time error.
    pub fn close(self) -> RepoResult<()> {
        self.conn
            .close()
            .map_err(|(_conn, err)| crate::repo::RepoError::from(err))
    }
}
