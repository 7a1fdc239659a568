//! Table and identifier naming rules.
//!
//! # Responsibility
//! - Vet every name interpolated into dynamic SQL.
//! - Build the combined annotation/segmentation table names.
//!
//! # Invariants
//! - Only names matching `^[a-z][a-z0-9_]*$` ever reach DDL/DML text.
//! - A segmentation table is named `{annotation_table}__{segmentation_source}`.

use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z][a-z0-9_]*$").expect("identifier pattern must compile"));

/// Maximum identifier length accepted for table and field names.
pub const MAX_IDENTIFIER_LEN: usize = 100;

/// Returns whether `name` is safe to use as a SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    name.len() <= MAX_IDENTIFIER_LEN && IDENTIFIER_RE.is_match(name)
}

/// Builds the physical name for a segmentation table paired with
/// `annotation_table` and sourced from the chunkedgraph table
/// `segmentation_source`.
pub fn build_segmentation_table_name(annotation_table: &str, segmentation_source: &str) -> String {
    format!("{annotation_table}__{segmentation_source}")
}
