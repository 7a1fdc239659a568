//! Domain model for dynamic annotation storage.
//!
//! # Responsibility
//! - Define the canonical field/value shapes shared by schema translation
//!   and row CRUD.
//! - Define metadata records mirroring the `annotation_table_metadata` and
//!   `segmentation_table_metadata` tables.
//!
//! # Invariants
//! - A table's field set is fixed by its schema descriptor at creation time.
//! - Row deletion and update are append-only: tombstones and supersession
//!   links, never in-place mutation of annotation data.

pub mod field;
pub mod metadata;
