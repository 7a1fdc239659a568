//! Registered set of named schema descriptors.
//!
//! # Responsibility
//! - Provide lookup from schema type name to field descriptor.
//! - Ship the core schema types of the annotation framework and accept
//!   caller-registered additions.
//!
//! # Invariants
//! - A descriptor is immutable once registered; tables materialized from it
//!   rely on its field set never changing.

use super::{SchemaError, SchemaResult};
use crate::model::field::FieldKind;
use crate::naming::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One named, typed field of a schema descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered field-type template for one schema type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    name: String,
    fields: Vec<FieldSpec>,
}

impl SchemaDescriptor {
    /// Builds a descriptor, vetting the schema name and every field name.
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> SchemaResult<Self> {
        let name = name.into();
        if !is_valid_identifier(&name) {
            return Err(SchemaError::InvalidName {
                kind: "schema",
                name,
            });
        }
        let mut seen = BTreeMap::new();
        for field in &fields {
            if !is_valid_identifier(&field.name) {
                return Err(SchemaError::InvalidName {
                    kind: "field",
                    name: field.name.clone(),
                });
            }
            if seen.insert(field.name.clone(), ()).is_some() {
                return Err(SchemaError::DuplicateField {
                    schema: name,
                    field: field.name.clone(),
                });
            }
        }
        Ok(Self { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Names of the `Point` fields, in declaration order.
    pub fn point_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|field| field.kind == FieldKind::Point)
            .map(|field| field.name.as_str())
    }

    /// Whether this descriptor carries a `Reference` field and therefore
    /// requires reference metadata at table creation.
    pub fn is_reference(&self) -> bool {
        self.fields
            .iter()
            .any(|field| field.kind == FieldKind::Reference)
    }
}

/// Lookup registry mapping schema type names to descriptors.
///
/// Stands in for the external schema-definition collaborator: descriptors
/// are consumed read-only by the rest of the crate.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, SchemaDescriptor>,
}

impl SchemaRegistry {
    /// Registry with no schema types.
    pub fn empty() -> Self {
        Self {
            schemas: BTreeMap::new(),
        }
    }

    /// Registry preloaded with the core schema types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for descriptor in default_schemas() {
            registry.register(descriptor);
        }
        registry
    }

    /// Registers (or replaces) a descriptor under its own name.
    pub fn register(&mut self, descriptor: SchemaDescriptor) {
        self.schemas
            .insert(descriptor.name().to_string(), descriptor);
    }

    /// Resolves a schema type name to its descriptor.
    pub fn get(&self, schema_type: &str) -> SchemaResult<&SchemaDescriptor> {
        self.schemas
            .get(schema_type)
            .ok_or_else(|| SchemaError::SchemaNotFound(schema_type.to_string()))
    }

    pub fn contains(&self, schema_type: &str) -> bool {
        self.schemas.contains_key(schema_type)
    }

    /// Registered schema type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn default_schemas() -> Vec<SchemaDescriptor> {
    let synapse = SchemaDescriptor::new(
        "synapse",
        vec![
            FieldSpec::new("pre_pt", FieldKind::Point),
            FieldSpec::new("ctr_pt", FieldKind::Point),
            FieldSpec::new("post_pt", FieldKind::Point),
            FieldSpec::new("size", FieldKind::Number),
        ],
    );
    let bound_tag = SchemaDescriptor::new(
        "bound_tag",
        vec![
            FieldSpec::new("pt", FieldKind::Point),
            FieldSpec::new("tag", FieldKind::Text),
        ],
    );
    let cell_type_local = SchemaDescriptor::new(
        "cell_type_local",
        vec![
            FieldSpec::new("pt", FieldKind::Point),
            FieldSpec::new("cell_type", FieldKind::Text),
            FieldSpec::new("classification_system", FieldKind::Text),
        ],
    );
    let presynaptic_bouton_type = SchemaDescriptor::new(
        "presynaptic_bouton_type",
        vec![
            FieldSpec::new("target_id", FieldKind::Reference),
            FieldSpec::new("bouton_type", FieldKind::Text),
        ],
    );

    [synapse, bound_tag, cell_type_local, presynaptic_bouton_type]
        .into_iter()
        .map(|descriptor| descriptor.expect("built-in schemas must be valid"))
        .collect()
}
