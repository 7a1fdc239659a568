use annodb_core::db::open_db_in_memory;
use annodb_core::{
    build_segmentation_table_name, AnnotationInsert, AnnotationRepository, CreateTableRequest,
    FieldValue, LinkedAnnotationInsert, RepoError, SchemaRegistry, SegmentationIds,
    SegmentationRepository, SegmentationRow, SqliteAnnotationRepository,
    SqliteSegmentationRepository, SqliteTableRegistry, TableRegistry, VoxelResolution,
};
use rusqlite::Connection;
use std::collections::BTreeMap;

const PCG_TABLE: &str = "pcg_v2";

fn setup_synapse_table(conn: &Connection, schemas: &SchemaRegistry, table_name: &str) {
    let registry = SqliteTableRegistry::try_new(conn, schemas).unwrap();
    registry
        .create_table(&CreateTableRequest::new(
            table_name,
            "synapse",
            "synapses for test volume",
            "user_1",
            VoxelResolution::uniform(4.0),
        ))
        .unwrap();
}

fn synapse_fields(size: f64) -> BTreeMap<String, FieldValue> {
    let mut fields = BTreeMap::new();
    fields.insert("pre_pt".to_string(), FieldValue::Point([1.0, 2.0, 3.0]));
    fields.insert("ctr_pt".to_string(), FieldValue::Point([4.0, 5.0, 6.0]));
    fields.insert("post_pt".to_string(), FieldValue::Point([7.0, 8.0, 9.0]));
    fields.insert("size".to_string(), FieldValue::Number(size));
    fields
}

fn synapse_segmentation(base: i64) -> BTreeMap<String, SegmentationIds> {
    let mut ids = BTreeMap::new();
    for (offset, field) in ["pre_pt", "ctr_pt", "post_pt"].iter().enumerate() {
        ids.insert(
            (*field).to_string(),
            SegmentationIds {
                supervoxel_id: base + offset as i64,
                root_id: base + 100 + offset as i64,
            },
        );
    }
    ids
}

#[test]
fn create_segmentation_table_records_metadata_and_name() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();

    let metadata = repo
        .create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();
    assert_eq!(
        metadata.table_name,
        build_segmentation_table_name("synapses_v1", PCG_TABLE)
    );
    assert_eq!(metadata.annotation_table, "synapses_v1");
    assert_eq!(metadata.pcg_table_name, PCG_TABLE);
    assert!(metadata.valid);
    assert!(metadata.last_updated.is_none());

    let loaded = repo
        .get_segmentation_table_metadata("synapses_v1", PCG_TABLE)
        .unwrap()
        .unwrap();
    assert_eq!(loaded, metadata);

    let linked = repo.get_linked_tables("synapses_v1").unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].table_name, "synapses_v1__pcg_v2");
}

#[test]
fn duplicate_segmentation_table_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();

    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();
    let err = repo
        .create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap_err();
    assert!(matches!(err, RepoError::TableAlreadyExists { .. }));
}

#[test]
fn segmentation_table_requires_existing_annotation_table() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();

    let err = repo
        .create_segmentation_table("missing", "synapse", PCG_TABLE)
        .unwrap_err();
    assert!(matches!(err, RepoError::LinkTargetMissing { ref table } if table == "missing"));
}

#[test]
fn segmentation_schema_type_must_match_annotation_table() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();

    let err = repo
        .create_segmentation_table("synapses_v1", "bound_tag", PCG_TABLE)
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidData(_)));
}

#[test]
fn linked_insert_commits_both_rows() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let ids = repo
        .insert_linked_annotations(
            "synapses_v1",
            PCG_TABLE,
            &[LinkedAnnotationInsert {
                annotation: AnnotationInsert::new(synapse_fields(12.0)),
                segmentation: synapse_segmentation(1000),
            }],
        )
        .unwrap();
    assert_eq!(ids.len(), 1);

    let linked = repo
        .get_linked_annotations("synapses_v1", PCG_TABLE, &ids)
        .unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].annotation.id, ids[0]);
    assert_eq!(linked[0].segmentation.annotation_id, ids[0]);
    assert_eq!(
        linked[0].segmentation.ids.get("pre_pt"),
        Some(&SegmentationIds {
            supervoxel_id: 1000,
            root_id: 1100,
        })
    );

    let metadata = repo
        .get_segmentation_table_metadata("synapses_v1", PCG_TABLE)
        .unwrap()
        .unwrap();
    assert!(metadata.last_updated.is_some());
}

#[test]
fn linked_insert_with_bad_segmentation_ids_commits_nothing() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    let registry = SqliteTableRegistry::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let mut incomplete = synapse_segmentation(1000);
    incomplete.remove("post_pt");
    let err = repo
        .insert_linked_annotations(
            "synapses_v1",
            PCG_TABLE,
            &[
                LinkedAnnotationInsert {
                    annotation: AnnotationInsert::new(synapse_fields(1.0)),
                    segmentation: synapse_segmentation(2000),
                },
                LinkedAnnotationInsert {
                    annotation: AnnotationInsert::new(synapse_fields(2.0)),
                    segmentation: incomplete,
                },
            ],
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::MissingField { ref field, .. } if field == "post_pt"));
    assert_eq!(registry.get_table_row_count("synapses_v1", false).unwrap(), 0);
}

#[test]
fn linked_insert_rejects_non_point_segmentation_field() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let mut extra = synapse_segmentation(1000);
    extra.insert(
        "size".to_string(),
        SegmentationIds {
            supervoxel_id: 1,
            root_id: 2,
        },
    );
    let err = repo
        .insert_linked_annotations(
            "synapses_v1",
            PCG_TABLE,
            &[LinkedAnnotationInsert {
                annotation: AnnotationInsert::new(synapse_fields(1.0)),
                segmentation: extra,
            }],
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::UnknownField { ref field, .. } if field == "size"));
}

#[test]
fn insert_requires_segmentation_table_to_exist() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();

    let err = repo
        .insert_linked_annotations(
            "synapses_v1",
            PCG_TABLE,
            &[LinkedAnnotationInsert {
                annotation: AnnotationInsert::new(synapse_fields(1.0)),
                segmentation: synapse_segmentation(1000),
            }],
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::LinkTargetMissing { .. }));
}

#[test]
fn backfilling_segmentations_for_existing_annotations() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let annotations = SqliteAnnotationRepository::try_new(&conn, &schemas).unwrap();
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let ids = annotations
        .insert_annotations(
            "synapses_v1",
            &[
                AnnotationInsert::new(synapse_fields(1.0)),
                AnnotationInsert::new(synapse_fields(2.0)),
            ],
        )
        .unwrap();

    let rows: Vec<_> = ids
        .iter()
        .map(|id| SegmentationRow {
            annotation_id: *id,
            ids: synapse_segmentation(id * 10),
        })
        .collect();
    let linked_ids = repo
        .insert_linked_segmentations("synapses_v1", PCG_TABLE, &rows)
        .unwrap();
    assert_eq!(linked_ids, ids);

    // A second pass over the same annotation ids must fail.
    let err = repo
        .insert_linked_segmentations("synapses_v1", PCG_TABLE, &rows)
        .unwrap_err();
    assert!(matches!(
        err,
        RepoError::LinkAlreadyExists { ref ids, .. } if *ids == linked_ids
    ));
}

#[test]
fn segmentation_rows_require_persisted_annotation_ids() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let err = repo
        .insert_linked_segmentations(
            "synapses_v1",
            PCG_TABLE,
            &[SegmentationRow {
                annotation_id: 999,
                ids: synapse_segmentation(1000),
            }],
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::RowNotFound { id: 999, .. }));
}

#[test]
fn linked_update_supersedes_row_and_allows_relinking() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let annotations = SqliteAnnotationRepository::try_new(&conn, &schemas).unwrap();
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let ids = repo
        .insert_linked_annotations(
            "synapses_v1",
            PCG_TABLE,
            &[LinkedAnnotationInsert {
                annotation: AnnotationInsert::new(synapse_fields(1.0)),
                segmentation: synapse_segmentation(1000),
            }],
        )
        .unwrap();

    let new_id = repo
        .update_linked_annotations("synapses_v1", PCG_TABLE, ids[0], &synapse_fields(2.0))
        .unwrap();
    assert_ne!(new_id, ids[0]);

    let old = annotations
        .get_annotation("synapses_v1", ids[0], true)
        .unwrap()
        .unwrap();
    assert!(!old.valid);
    assert_eq!(old.superseded_id, Some(new_id));

    // The replacement row is live but unlinked until a backfill pass
    // refreshes its segmentation ids.
    let live = annotations
        .get_annotation("synapses_v1", new_id, false)
        .unwrap()
        .unwrap();
    assert_eq!(live.fields.get("size"), Some(&FieldValue::Number(2.0)));
    assert!(repo
        .get_linked_annotations("synapses_v1", PCG_TABLE, &[new_id])
        .unwrap()
        .is_empty());

    repo.insert_linked_segmentations(
        "synapses_v1",
        PCG_TABLE,
        &[SegmentationRow {
            annotation_id: new_id,
            ids: synapse_segmentation(9000),
        }],
    )
    .unwrap();
    let linked = repo
        .get_linked_annotations("synapses_v1", PCG_TABLE, &[new_id])
        .unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(
        linked[0].segmentation.ids.get("pre_pt"),
        Some(&SegmentationIds {
            supervoxel_id: 9000,
            root_id: 9100,
        })
    );

    // The superseded id is no longer updatable.
    let err = repo
        .update_linked_annotations("synapses_v1", PCG_TABLE, ids[0], &synapse_fields(3.0))
        .unwrap_err();
    assert!(matches!(err, RepoError::RowNotFound { id, .. } if id == ids[0]));
}

#[test]
fn linked_update_requires_a_segmentation_row() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let annotations = SqliteAnnotationRepository::try_new(&conn, &schemas).unwrap();
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let ids = annotations
        .insert_annotations("synapses_v1", &[AnnotationInsert::new(synapse_fields(1.0))])
        .unwrap();

    let err = repo
        .update_linked_annotations("synapses_v1", PCG_TABLE, ids[0], &synapse_fields(2.0))
        .unwrap_err();
    assert!(matches!(err, RepoError::RowNotFound { ref table, .. } if table == "synapses_v1__pcg_v2"));

    // The unlinked row stays live and untouched.
    let row = annotations
        .get_annotation("synapses_v1", ids[0], false)
        .unwrap()
        .unwrap();
    assert!(row.is_live());
}

#[test]
fn get_linked_annotations_skips_unlinked_ids() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let annotations = SqliteAnnotationRepository::try_new(&conn, &schemas).unwrap();
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let linked_ids = repo
        .insert_linked_annotations(
            "synapses_v1",
            PCG_TABLE,
            &[LinkedAnnotationInsert {
                annotation: AnnotationInsert::new(synapse_fields(1.0)),
                segmentation: synapse_segmentation(1000),
            }],
        )
        .unwrap();
    let unlinked_ids = annotations
        .insert_annotations("synapses_v1", &[AnnotationInsert::new(synapse_fields(2.0))])
        .unwrap();

    let mut query_ids = linked_ids.clone();
    query_ids.extend(&unlinked_ids);
    let linked = repo
        .get_linked_annotations("synapses_v1", PCG_TABLE, &query_ids)
        .unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].annotation.id, linked_ids[0]);
}

#[test]
fn delete_linked_annotations_tombstones_only_linked_live_rows() {
    let conn = open_db_in_memory().unwrap();
    let schemas = SchemaRegistry::with_defaults();
    setup_synapse_table(&conn, &schemas, "synapses_v1");
    let annotations = SqliteAnnotationRepository::try_new(&conn, &schemas).unwrap();
    let repo = SqliteSegmentationRepository::try_new(&conn, &schemas).unwrap();
    repo.create_segmentation_table("synapses_v1", "synapse", PCG_TABLE)
        .unwrap();

    let linked_ids = repo
        .insert_linked_annotations(
            "synapses_v1",
            PCG_TABLE,
            &[
                LinkedAnnotationInsert {
                    annotation: AnnotationInsert::new(synapse_fields(1.0)),
                    segmentation: synapse_segmentation(1000),
                },
                LinkedAnnotationInsert {
                    annotation: AnnotationInsert::new(synapse_fields(2.0)),
                    segmentation: synapse_segmentation(2000),
                },
            ],
        )
        .unwrap();
    let unlinked_ids = annotations
        .insert_annotations("synapses_v1", &[AnnotationInsert::new(synapse_fields(3.0))])
        .unwrap();

    annotations
        .delete_annotation("synapses_v1", linked_ids[1])
        .unwrap();

    let mut request = linked_ids.clone();
    request.extend(&unlinked_ids);
    let deleted = repo
        .delete_linked_annotations("synapses_v1", PCG_TABLE, &request)
        .unwrap();
    // Already-deleted and unlinked rows are skipped.
    assert_eq!(deleted, vec![linked_ids[0]]);

    let remaining = annotations
        .get_annotation("synapses_v1", linked_ids[0], false)
        .unwrap();
    assert!(remaining.is_none());
    let untouched = annotations
        .get_annotation("synapses_v1", unlinked_ids[0], false)
        .unwrap();
    assert!(untouched.is_some());
}
