//! Core domain logic for AnnoDB, a spatial-annotation data-access layer.
//! This crate is the single source of truth for annotation, segmentation,
//! and table-metadata invariants.

pub mod db;
pub mod logging;
pub mod model;
pub mod naming;
pub mod repo;
pub mod schema;
pub mod service;

pub use db::{create_or_select_database, open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::field::{
    AnnotationFields, AnnotationInsert, AnnotationRow, FieldKind, FieldValue,
    LinkedAnnotationInsert, LinkedAnnotationRow, SegmentationIds, SegmentationRow,
};
pub use model::metadata::{
    CreateTableRequest, SegmentationTableMetadata, TableFilter, TableMetadata,
    TableMetadataUpdate, VoxelResolution,
};
pub use naming::build_segmentation_table_name;
pub use repo::annotation_repo::{
    AnnotationQuery, AnnotationRepository, SqliteAnnotationRepository,
};
pub use repo::segmentation_repo::{SegmentationRepository, SqliteSegmentationRepository};
pub use repo::table_registry::{SqliteTableRegistry, TableRegistry};
pub use repo::{RepoError, RepoResult, ANNOTATION_INSERT_LIMIT};
pub use schema::{
    FieldSpec, SchemaDescriptor, SchemaError, SchemaRegistry, SchemaResult, TableDefinition,
};
pub use service::annotation_service::AnnotationService;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
