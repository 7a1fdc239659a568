//! End-to-end pass over one aligned volume through the service facade.

use annodb_core::{
    AnnotationInsert, AnnotationQuery, CreateTableRequest, FieldKind, FieldSpec, FieldValue,
    LinkedAnnotationInsert, RepoError, SchemaDescriptor, SegmentationIds, TableFilter,
    VoxelResolution,
};
use annodb_core::AnnotationService;
use std::collections::BTreeMap;

fn synapse_fields() -> BTreeMap<String, FieldValue> {
    let mut fields = BTreeMap::new();
    fields.insert(
        "pre_pt".to_string(),
        FieldValue::Point([121.0, 123.0, 1232.0]),
    );
    fields.insert(
        "ctr_pt".to_string(),
        FieldValue::Point([128.0, 143.0, 1232.0]),
    );
    fields.insert(
        "post_pt".to_string(),
        FieldValue::Point([235.0, 187.0, 1232.0]),
    );
    fields.insert("size".to_string(), FieldValue::Number(1.0));
    fields
}

#[test]
fn synapse_lifecycle_through_service() {
    let service = AnnotationService::in_memory().unwrap();

    service
        .create_table(&CreateTableRequest::new(
            "synapses_v1",
            "synapse",
            "manually proofread synapses",
            "user_42",
            VoxelResolution::new(4.0, 4.0, 40.0),
        ))
        .unwrap();

    let ids = service
        .insert_annotations("synapses_v1", &[AnnotationInsert::new(synapse_fields())])
        .unwrap();
    assert_eq!(ids.len(), 1);

    let row = service
        .get_annotation("synapses_v1", ids[0], false)
        .unwrap()
        .unwrap();
    assert_eq!(
        row.fields.get("pre_pt"),
        Some(&FieldValue::Point([121.0, 123.0, 1232.0]))
    );
    assert_eq!(row.fields.get("size"), Some(&FieldValue::Number(1.0)));

    // Proofreading moves the presynaptic point; the row is superseded.
    let mut corrected = synapse_fields();
    corrected.insert(
        "pre_pt".to_string(),
        FieldValue::Point([122.0, 123.0, 1232.0]),
    );
    let new_id = service
        .update_annotation("synapses_v1", ids[0], &corrected)
        .unwrap();
    assert_ne!(new_id, ids[0]);

    let live = service
        .get_annotations(
            "synapses_v1",
            &AnnotationQuery {
                include_history: false,
                ..AnnotationQuery::default()
            },
        )
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, new_id);

    let history = service
        .get_annotations(
            "synapses_v1",
            &AnnotationQuery {
                include_history: true,
                ..AnnotationQuery::default()
            },
        )
        .unwrap();
    assert_eq!(history.len(), 2);

    service.delete_annotation("synapses_v1", new_id).unwrap();
    assert_eq!(service.get_table_row_count("synapses_v1", true).unwrap(), 0);

    service.close().unwrap();
}

#[test]
fn linked_synapse_lifecycle_through_service() {
    let service = AnnotationService::in_memory().unwrap();

    service
        .create_table(&CreateTableRequest::new(
            "synapses_v1",
            "synapse",
            "synapses",
            "user_42",
            VoxelResolution::uniform(4.0),
        ))
        .unwrap();
    service
        .create_segmentation_table("synapses_v1", "synapse", "pcg_v2")
        .unwrap();

    let mut segmentation = BTreeMap::new();
    for (offset, field) in ["pre_pt", "ctr_pt", "post_pt"].iter().enumerate() {
        segmentation.insert(
            (*field).to_string(),
            SegmentationIds {
                supervoxel_id: 88_000 + offset as i64,
                root_id: 648_518 + offset as i64,
            },
        );
    }

    let ids = service
        .insert_linked_annotations(
            "synapses_v1",
            "pcg_v2",
            &[LinkedAnnotationInsert {
                annotation: AnnotationInsert::new(synapse_fields()),
                segmentation,
            }],
        )
        .unwrap();

    let linked = service
        .get_linked_annotations("synapses_v1", "pcg_v2", &ids)
        .unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(
        linked[0].segmentation.ids.get("ctr_pt"),
        Some(&SegmentationIds {
            supervoxel_id: 88_001,
            root_id: 648_519,
        })
    );

    let deleted = service
        .delete_linked_annotations("synapses_v1", "pcg_v2", &ids)
        .unwrap();
    assert_eq!(deleted, ids);
}

#[test]
fn custom_schema_registration_is_usable_immediately() {
    let mut service = AnnotationService::in_memory().unwrap();

    let descriptor = SchemaDescriptor::new(
        "nucleus_detection",
        vec![
            FieldSpec::new("pt", FieldKind::Point),
            FieldSpec::new("volume", FieldKind::Number),
        ],
    )
    .unwrap();
    service.register_schema(descriptor);

    service
        .create_table(&CreateTableRequest::new(
            "nuclei_v1",
            "nucleus_detection",
            "detected nuclei",
            "user_42",
            VoxelResolution::uniform(4.0),
        ))
        .unwrap();

    let mut fields = BTreeMap::new();
    fields.insert("pt".to_string(), FieldValue::Point([10.0, 20.0, 30.0]));
    fields.insert("volume".to_string(), FieldValue::Number(815.5));
    let ids = service
        .insert_annotations("nuclei_v1", &[AnnotationInsert::new(fields)])
        .unwrap();
    assert_eq!(ids.len(), 1);
}

#[test]
fn aligned_volumes_are_isolated_database_files() {
    let root = tempfile::tempdir().unwrap();

    let volume_a = AnnotationService::create_or_select("volume_a", root.path()).unwrap();
    volume_a
        .create_table(&CreateTableRequest::new(
            "synapses_v1",
            "synapse",
            "synapses",
            "user_42",
            VoxelResolution::uniform(4.0),
        ))
        .unwrap();
    volume_a.close().unwrap();

    assert!(root.path().join("volume_a.db").exists());

    // A second volume under the same root sees none of the first's tables.
    let volume_b = AnnotationService::create_or_select("volume_b", root.path()).unwrap();
    assert!(!volume_b.table_exists("synapses_v1").unwrap());
    volume_b.close().unwrap();

    // Reopening the first volume finds its tables again.
    let reopened = AnnotationService::create_or_select("volume_a", root.path()).unwrap();
    let tables = reopened.list_tables(&TableFilter::default()).unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].table_name, "synapses_v1");
    reopened.close().unwrap();
}

#[test]
fn invalid_volume_name_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let err = AnnotationService::create_or_select("Bad Name; --", root.path())
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, RepoError::Db(_)));
}
