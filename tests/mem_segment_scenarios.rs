use pilum::config::MemSegmentConfig;
use pilum::error::{ErrorKind, PilumError};
use pilum::meta::{CollectionId, FieldSchema, LocalSnapshotStore, PartitionId, SnapshotStore};
use pilum::segment::{
    EntityBatch, MemSegment, SegmentReader, SegmentState, VectorBatch, VectorSource,
};
use pilum::storage::memory::{MemoryStorage, MemoryStorageConfig};
use pilum::vector::Vector;
use std::sync::Arc;

struct Setup {
    store: Arc<LocalSnapshotStore>,
    storage: Arc<MemoryStorage>,
    collection: CollectionId,
    partition: PartitionId,
}

fn setup(dimension: i64) -> Setup {
    let store = Arc::new(LocalSnapshotStore::new());
    let collection = store
        .create_collection("docs", vec![FieldSchema::vector("vector", dimension)])
        .unwrap();
    let partition = store.create_partition(collection, "p0").unwrap();
    Setup {
        store,
        storage: Arc::new(MemoryStorage::new(MemoryStorageConfig::default())),
        collection,
        partition,
    }
}

fn segment(setup: &Setup, budget: usize) -> MemSegment {
    MemSegment::create(
        setup.collection,
        setup.partition,
        MemSegmentConfig::with_budget(budget),
        setup.store.clone(),
        setup.storage.clone(),
    )
    .unwrap()
}

fn vectors(ids: impl IntoIterator<Item = u64>, dimension: usize) -> VectorBatch {
    VectorBatch::from_rows(
        ids.into_iter()
            .map(|id| (id, vec![id as f32 * 0.5; dimension]))
            .collect(),
    )
}

#[test]
fn test_end_to_end_budget_1000_dimension_128() {
    let setup = setup(128);
    let mut segment = segment(&setup, 1000);

    // 512 bytes per row: floor(1000 / 512) = 1
    let mut source = vectors(1..=10, 128);
    assert_eq!(segment.insert(&mut source).unwrap(), 1);
    assert_eq!(segment.current_memory_used(), 512);
    assert_eq!(segment.memory_remaining(), 488);
    assert!(segment.is_full().unwrap());

    assert_eq!(segment.insert(&mut source).unwrap(), 0);
    assert_eq!(segment.current_memory_used(), 512);

    assert_eq!(segment.delete(1).unwrap(), 1);
    assert_eq!(segment.current_memory_used(), 0);
    assert!(!segment.is_full().unwrap());

    let report = segment.flush(7).unwrap();
    assert_eq!(report.row_count, 0);
    assert_eq!(report.wal_lsn, 7);

    let snapshot = setup.store.get_snapshot(setup.collection).unwrap();
    let files = snapshot.files_of_segment(segment.segment_id());
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].row_count, 0);
    assert_eq!(files[0].element_name, "raw");
    assert_eq!(files[0].field_name, "vector");
}

#[test]
fn test_flushed_rows_match_buffer() {
    let setup = setup(128);
    let mut segment = segment(&setup, 1000);
    segment.insert(&mut vectors(1..=10, 128)).unwrap();

    let report = segment.flush(1).unwrap();
    assert_eq!(report.row_count, 1);
    assert_eq!(report.buffered_bytes, 512);

    let data = SegmentReader::open(setup.storage.as_ref(), &report.file_name).unwrap();
    assert_eq!(data.ids(), vec![1]);
    assert_eq!(data.header.dimension, 128);
    assert_eq!(data.rows[0].1.data, vec![0.5; 128]);
}

#[test]
fn test_budget_invariant_over_insert_sequences() {
    let setup = setup(3);
    // 12 bytes per row
    for budget in [1usize, 11, 12, 13, 100, 1000, 4097] {
        let mut segment = segment(&setup, budget);
        for chunk in 0..20u64 {
            let mut source = vectors(chunk * 7..chunk * 7 + 7, 3);
            segment.insert(&mut source).unwrap();
            assert!(segment.current_memory_used() <= budget);
            assert_eq!(
                segment.is_full().unwrap(),
                segment.memory_remaining() < 12
            );
        }
        assert_eq!(segment.current_memory_used(), (budget / 12).min(140) * 12);
    }
}

#[test]
fn test_admission_exactness() {
    let setup = setup(2);
    let mut segment = segment(&setup, 100);

    // remaining 100, 8 bytes per row: exactly 12 of 50
    let mut source = vectors(0..50, 2);
    assert_eq!(segment.insert(&mut source).unwrap(), 12);
    assert_eq!(segment.row_count(), 12);
    assert_eq!(source.remaining(), 38);

    // freeing 3 rows makes room for exactly 3 more
    segment.delete_batch(&[0, 1, 2]).unwrap();
    assert_eq!(segment.memory_remaining(), 28);
    assert_eq!(segment.insert(&mut source).unwrap(), 3);
    assert_eq!(segment.ids(), (3..15).collect::<Vec<u64>>());
}

#[test]
fn test_source_shorter_than_room() {
    let setup = setup(2);
    let mut segment = segment(&setup, 1000);
    assert_eq!(segment.insert(&mut vectors(0..3, 2)).unwrap(), 3);
    assert_eq!(segment.current_memory_used(), 24);
}

#[test]
fn test_single_delete_leaves_other_rows_unchanged() {
    let setup = setup(2);
    let mut segment = segment(&setup, 1000);
    segment.insert(&mut vectors([4, 8, 15, 16, 23, 42], 2)).unwrap();
    let before: Vec<_> = segment.rows().to_vec();

    assert_eq!(segment.delete(15).unwrap(), 1);
    let expected: Vec<_> = before.into_iter().filter(|row| row.id != 15).collect();
    assert_eq!(segment.rows(), expected.as_slice());

    assert_eq!(segment.delete(1000).unwrap(), 0);
    assert_eq!(segment.rows(), expected.as_slice());
}

#[test]
fn test_batch_delete_is_multiset_difference() {
    let setup = setup(1);
    let buffered = [5u64, 3, 5, 9, 1, 3, 7, 5];
    let deletes = [5u64, 7, 100, 1];

    let mut forward = segment(&setup, 1000);
    forward.insert(&mut vectors(buffered, 1)).unwrap();
    let removed = forward.delete_batch(&deletes).unwrap();

    let expected: Vec<u64> = buffered
        .iter()
        .copied()
        .filter(|id| !deletes.contains(id))
        .collect();
    assert_eq!(removed, buffered.len() - expected.len());
    assert_eq!(forward.ids(), expected);

    let mut reversed_deletes = deletes;
    reversed_deletes.reverse();
    let mut backward = segment(&setup, 1000);
    backward.insert(&mut vectors(buffered, 1)).unwrap();
    backward.delete_batch(&reversed_deletes).unwrap();
    assert_eq!(backward.ids(), expected);
    assert_eq!(backward.current_memory_used(), forward.current_memory_used());
}

#[test]
fn test_missing_dimension_is_schema_error() {
    let store = Arc::new(LocalSnapshotStore::new());
    let collection = store
        .create_collection("docs", vec![FieldSchema::new("vector")])
        .unwrap();
    let partition = store.create_partition(collection, "p0").unwrap();
    let mut segment = MemSegment::create(
        collection,
        partition,
        MemSegmentConfig::with_budget(1000),
        store,
        Arc::new(MemoryStorage::new(MemoryStorageConfig::default())),
    )
    .unwrap();

    let err = segment.insert(&mut vectors(0..4, 4)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(err.to_string().contains("dimension"));
    assert!(segment.is_empty());
    assert_eq!(segment.current_memory_used(), 0);
    assert!(segment.is_full().is_err());
    assert_eq!(segment.state(), SegmentState::Active);
}

#[test]
fn test_entity_rows_keep_attributes() {
    let setup = setup(2);
    let mut segment = segment(&setup, 1000);

    let mut source = EntityBatch::with_attribute(
        vec![
            (1, vec![1.0, 0.0], "red".to_string()),
            (2, vec![0.0, 1.0], "blue".to_string()),
        ],
        "color",
    );
    assert_eq!(segment.insert_entities(&mut source).unwrap(), 2);
    // id + payload + "color" + "blue"
    assert_eq!(segment.current_memory_used(), 2 * (8 + 8 + 9));

    let report = segment.flush(3).unwrap();
    let data = SegmentReader::open(setup.storage.as_ref(), &report.file_name).unwrap();
    assert_eq!(
        data.rows[1].1.get_metadata("color").map(String::as_str),
        Some("blue")
    );
}

#[test]
fn test_entity_dimension_mismatch_rejected() {
    let setup = setup(3);
    let mut segment = segment(&setup, 1000);
    let mut source = EntityBatch::new(vec![
        (1, Vector::new(vec![0.0; 3])),
        (2, Vector::new(vec![0.0; 4])),
    ]);

    let err = segment.insert_entities(&mut source).unwrap_err();
    assert!(matches!(err, PilumError::Schema(_)));
    assert!(segment.is_empty());
}

#[test]
fn test_segment_ids_are_distinct() {
    let setup = setup(2);
    let a = segment(&setup, 100);
    let b = segment(&setup, 100);
    assert_ne!(a.segment_id(), b.segment_id());
    assert_eq!(a.collection_id(), setup.collection);
    assert_eq!(a.partition_id(), setup.partition);

    // reserved segments are invisible until flushed
    let snapshot = setup.store.get_snapshot(setup.collection).unwrap();
    assert!(snapshot.segment(a.segment_id()).is_none());
}
