//! Table metadata records and registry request shapes.
//!
//! # Responsibility
//! - Mirror the persistent metadata rows tracked per annotation and
//!   segmentation table.
//! - Define the request/filter structs accepted by the table registry.
//!
//! # Invariants
//! - `table_name` is the unique key of both metadata tables.
//! - A metadata row is never physically deleted while the underlying table
//!   exists; deprecation only sets `deleted`/`valid`.

use serde::{Deserialize, Serialize};

/// Voxel resolution of a table's spatial points, typically in nanometers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelResolution {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl VoxelResolution {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Isotropic resolution shortcut.
    pub fn uniform(value: f64) -> Self {
        Self::new(value, value, value)
    }
}

/// Metadata row for one materialized annotation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_name: String,
    pub schema_type: String,
    pub description: String,
    pub user_id: String,
    pub valid: bool,
    /// Creation time, Unix epoch milliseconds.
    pub created: i64,
    /// Deprecation time, when the table is marked deleted.
    pub deleted: Option<i64>,
    /// Path to a flat segmentation source associated with this table.
    pub flat_segmentation_source: Option<String>,
    /// Target table for reference-type schemas.
    pub reference_table: Option<String>,
    /// Whether target-id updates should be tracked for reference schemas.
    pub track_target_id_updates: Option<bool>,
    /// Last row-mutation time, Unix epoch milliseconds.
    pub last_modified: i64,
    pub voxel_resolution: VoxelResolution,
}

/// Metadata row for one segmentation table linked to an annotation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationTableMetadata {
    pub table_name: String,
    pub schema_type: String,
    /// Name of the paired annotation table.
    pub annotation_table: String,
    /// Chunkedgraph table backing the segmentation ids.
    pub pcg_table_name: String,
    pub valid: bool,
    pub created: i64,
    pub deleted: Option<i64>,
    pub last_updated: Option<i64>,
}

/// Request shape for `create_table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub table_name: String,
    pub schema_type: String,
    pub description: String,
    pub user_id: String,
    pub voxel_resolution: VoxelResolution,
    /// Required when the schema carries a `Reference` field.
    pub reference_table: Option<String>,
    pub track_target_id_updates: Option<bool>,
    pub flat_segmentation_source: Option<String>,
}

impl CreateTableRequest {
    /// Minimal request with only the mandatory fields set.
    pub fn new(
        table_name: impl Into<String>,
        schema_type: impl Into<String>,
        description: impl Into<String>,
        user_id: impl Into<String>,
        voxel_resolution: VoxelResolution,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            schema_type: schema_type.into(),
            description: description.into(),
            user_id: user_id.into(),
            voxel_resolution,
            reference_table: None,
            track_target_id_updates: None,
            flat_segmentation_source: None,
        }
    }
}

/// Filter options for `list_tables`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub schema_type: Option<String>,
    pub include_deprecated: bool,
}

/// Soft administrative metadata fields that may change after creation.
///
/// Schema-bearing fields (`schema_type`, `reference_table`, resolution) are
/// deliberately absent: those are fixed at materialization time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMetadataUpdate {
    pub description: Option<String>,
    pub user_id: Option<String>,
    pub flat_segmentation_source: Option<String>,
}
