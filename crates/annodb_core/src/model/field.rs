//! Field kinds and runtime values for dynamically materialized tables.
//!
//! # Responsibility
//! - Provide the closed set of semantic field types a schema descriptor may
//!   declare.
//! - Provide the matching runtime value variants carried by annotation rows.
//!
//! # Invariants
//! - `FieldKind` is closed: schema interpretation happens once at
//!   table-creation time, never per row.
//! - A `FieldValue` is only accepted where its `kind()` matches the
//!   descriptor entry of the same field name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Semantic type of one schema field.
///
/// `Reference` does not carry its target table: the target is resolved from
/// table metadata when the table is materialized, so that row handling never
/// re-interprets schema intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Spatial point, materialized as three numeric columns.
    Point,
    /// Scalar numeric value.
    Number,
    /// Free-form text value.
    Text,
    /// Row id in the table named by `TableMetadata::reference_table`.
    Reference,
}

impl FieldKind {
    /// Stable lowercase label used in error messages and serialization.
    pub fn label(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Number => "number",
            Self::Text => "text",
            Self::Reference => "reference",
        }
    }
}

/// Runtime value for one field of an annotation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Point([f64; 3]),
    Number(f64),
    Text(String),
    Reference(i64),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Point(_) => FieldKind::Point,
            Self::Number(_) => FieldKind::Number,
            Self::Text(_) => FieldKind::Text,
            Self::Reference(_) => FieldKind::Reference,
        }
    }
}

/// Ordered field name to value mapping for one row.
pub type AnnotationFields = BTreeMap<String, FieldValue>;

/// One row handed to `insert_annotations`.
///
/// `id` is optional: within a single insert call either every row supplies
/// an id or none does. Mixed batches are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationInsert {
    pub id: Option<i64>,
    pub fields: AnnotationFields,
}

impl AnnotationInsert {
    pub fn new(fields: AnnotationFields) -> Self {
        Self { id: None, fields }
    }

    pub fn with_id(id: i64, fields: AnnotationFields) -> Self {
        Self {
            id: Some(id),
            fields,
        }
    }
}

/// One persisted annotation row, including versioning columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRow {
    pub id: i64,
    /// Creation time, Unix epoch milliseconds.
    pub created: i64,
    /// Soft-delete tombstone time, when set.
    pub deleted: Option<i64>,
    /// Id of the row that replaced this one via update, when set.
    pub superseded_id: Option<i64>,
    pub valid: bool,
    pub fields: AnnotationFields,
}

impl AnnotationRow {
    /// Whether this row is visible to live (non-history) queries.
    pub fn is_live(&self) -> bool {
        self.valid && self.deleted.is_none() && self.superseded_id.is_none()
    }
}

/// Segmentation-graph identifiers linked to one spatial point field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationIds {
    pub supervoxel_id: i64,
    pub root_id: i64,
}

/// One row of a segmentation table, keyed by its annotation row id.
///
/// `ids` maps each `Point` field of the annotation schema to its linked
/// segmentation-graph identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationRow {
    pub annotation_id: i64,
    pub ids: BTreeMap<String, SegmentationIds>,
}

/// Input for a linked annotation + segmentation insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedAnnotationInsert {
    pub annotation: AnnotationInsert,
    /// Segmentation ids per `Point` field of the schema.
    pub segmentation: BTreeMap<String, SegmentationIds>,
}

/// Joined annotation + segmentation row returned by linked queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedAnnotationRow {
    pub annotation: AnnotationRow,
    pub segmentation: SegmentationRow,
}
