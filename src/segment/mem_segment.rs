//! Memory segment: admission-controlled write buffer for one partition.

use std::cell::OnceCell;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::{FLOAT_TYPE_SIZE, MAX_DIMENSION, MemSegmentConfig};
use crate::error::{PilumError, Result};
use crate::meta::{
    CollectionId, CommitHandle, PartitionId, SegmentFileContext, SegmentFileId, SegmentId,
    SeqNumber, SnapshotStore, Version,
};
use crate::segment::SegmentState;
use crate::segment::accountant::MemoryAccountant;
use crate::segment::format::segment_file_name;
use crate::segment::reconcile;
use crate::segment::source::{EntitySource, VectorSource};
use crate::segment::writer::{BufferedRow, SegmentWriter};
use crate::storage::Storage;

/// What a successful flush wrote and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub file_id: SegmentFileId,
    pub file_name: String,
    /// Bytes written to storage.
    pub file_size: u64,
    pub row_count: u64,
    /// Accounted buffer bytes when the flush started.
    pub buffered_bytes: usize,
    pub wal_lsn: SeqNumber,
    /// Snapshot version that made the file visible.
    pub version: Version,
    pub elapsed_ms: u64,
}

/// Buffers inserted rows for one partition until flushed as one segment file.
///
/// The segment identity is reserved when the segment is created. Rows are
/// admitted while the memory budget allows, deletes remove still-buffered rows,
/// and [`MemSegment::flush`] writes the buffer and publishes its metadata.
///
/// A `MemSegment` is a sequential object: callers serialize every mutating
/// call.
#[derive(Debug)]
pub struct MemSegment {
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    config: MemSegmentConfig,
    store: Arc<dyn SnapshotStore>,
    storage: Arc<dyn Storage>,
    commit: CommitHandle,
    writer: SegmentWriter,
    accountant: MemoryAccountant,
    dimension: OnceCell<usize>,
    state: SegmentState,
    flushed: Option<FlushReport>,
}

impl MemSegment {
    /// Create a segment for `partition_id`, reserving its identity in `store`.
    ///
    /// Fails when the collection or partition cannot be found; no segment
    /// exists afterwards.
    pub fn create(
        collection_id: CollectionId,
        partition_id: PartitionId,
        config: MemSegmentConfig,
        store: Arc<dyn SnapshotStore>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;

        let mut commit = CommitHandle::new(Arc::clone(&store), collection_id, partition_id);
        let segment_id = commit.reserve_segment().map_err(|err| {
            log::error!(
                "Failed to reserve segment in collection {collection_id} partition {partition_id}: {err}"
            );
            err
        })?;

        log::debug!(
            "Created memory segment {segment_id} for collection {collection_id} partition {partition_id}, budget {} bytes",
            config.max_segment_bytes
        );

        Ok(Self {
            collection_id,
            partition_id,
            segment_id,
            accountant: MemoryAccountant::new(config.max_segment_bytes),
            config,
            store,
            storage,
            commit,
            writer: SegmentWriter::new(segment_id),
            dimension: OnceCell::new(),
            state: SegmentState::Active,
            flushed: None,
        })
    }

    /// Admit as many vectors from `source` as the remaining budget allows.
    ///
    /// Returns the number of rows buffered. A full segment admits nothing and
    /// returns `Ok(0)`.
    pub fn insert<S>(&mut self, source: &mut S) -> Result<usize>
    where
        S: VectorSource + ?Sized,
    {
        self.ensure_active("insert")?;
        let dimension = self.checked_dimension("insert")?;
        let row_bytes = source.single_vector_size(dimension);
        self.admit(dimension, row_bytes, |writer, count| {
            source.add_vectors(writer, dimension, count)
        })
    }

    /// Entity counterpart of [`MemSegment::insert`].
    pub fn insert_entities<S>(&mut self, source: &mut S) -> Result<usize>
    where
        S: EntitySource + ?Sized,
    {
        self.ensure_active("insert_entities")?;
        let dimension = self.checked_dimension("insert_entities")?;
        let row_bytes = source.single_entity_size(dimension);
        self.admit(dimension, row_bytes, |writer, count| {
            source.add_entities(writer, dimension, count)
        })
    }

    fn admit<F>(&mut self, dimension: usize, row_bytes: usize, add: F) -> Result<usize>
    where
        F: FnOnce(&mut SegmentWriter, usize) -> Result<usize>,
    {
        if row_bytes == 0 {
            return Err(PilumError::invalid_operation(
                "source reported a row size of zero bytes",
            ));
        }
        if self.accountant.is_full(row_bytes) {
            log::debug!(
                "Segment {} is full: {} bytes left, row needs {row_bytes}",
                self.segment_id,
                self.accountant.remaining()
            );
            return Ok(0);
        }

        let requested = self.accountant.admissible_rows(row_bytes);
        let before = self.writer.vector_count();
        let supplied = match add(&mut self.writer, requested) {
            Ok(supplied) => supplied,
            Err(err) => {
                self.writer.truncate(before);
                log::error!("Failed to add rows to segment {}: {err}", self.segment_id);
                return Err(err);
            }
        };

        let Some(appended) = self.writer.vector_count().checked_sub(before) else {
            self.writer.retain_charged();
            let removed = self
                .accountant
                .consumed()
                .saturating_sub(self.writer.buffered_bytes());
            self.accountant.release(removed);
            return Err(PilumError::invalid_operation(format!(
                "source removed buffered rows from segment {}",
                self.segment_id
            )));
        };
        if appended > requested || supplied != appended {
            self.writer.truncate(before);
            return Err(PilumError::invalid_operation(format!(
                "source reported {supplied} rows and appended {appended}, {requested} were requested"
            )));
        }
        if !self.writer.rows_have_dimension(before, dimension) {
            self.writer.truncate(before);
            return Err(PilumError::schema(format!(
                "source appended rows whose width differs from dimension {dimension}"
            )));
        }

        self.accountant.charge(appended * row_bytes)?;
        self.writer.assign_charge(before, row_bytes);
        Ok(appended)
    }

    /// Remove the first buffered row with `id`. Absent ids are ignored.
    pub fn delete(&mut self, id: u64) -> Result<usize> {
        self.ensure_active("delete")?;
        let deleted = reconcile::delete_one(&mut self.writer, id);
        self.accountant.release(deleted.bytes);
        Ok(deleted.rows)
    }

    /// Remove every buffered row whose id is in `ids`.
    pub fn delete_batch(&mut self, ids: &[u64]) -> Result<usize> {
        self.ensure_active("delete_batch")?;
        let deleted = reconcile::delete_batch(&mut self.writer, ids);
        self.accountant.release(deleted.bytes);
        if deleted.rows > 0 {
            log::debug!(
                "Deleted {} of {} ids from segment {}, released {} bytes",
                deleted.rows,
                ids.len(),
                self.segment_id,
                deleted.bytes
            );
        }
        Ok(deleted.rows)
    }

    /// Write the buffer to storage and publish it, tagged with `wal_lsn`.
    ///
    /// The file record only becomes visible after its bytes are written. If
    /// writing or publishing fails, nothing is published, the buffer is kept
    /// and the flush may be retried.
    pub fn flush(&mut self, wal_lsn: SeqNumber) -> Result<FlushReport> {
        self.ensure_active("flush")?;
        let started = Instant::now();
        let buffered_bytes = self.accountant.consumed();

        let context = SegmentFileContext {
            field_name: self.config.vector_field.clone(),
            field_element_name: self.config.raw_element.clone(),
            collection_id: self.collection_id,
            partition_id: self.partition_id,
            segment_id: self.segment_id,
        };
        let file_id = match self.commit.reserve_segment_file(&context) {
            Ok(file_id) => file_id,
            Err(err) => return Err(self.fail_if_gone(err)),
        };

        let file_name = segment_file_name(self.segment_id);
        let written = match self.writer.serialize(
            self.storage.as_ref(),
            &file_name,
            self.config.sync_on_flush,
        ) {
            Ok(written) => written,
            Err(err) => {
                self.commit.discard_pending_files();
                log::error!("Failed to serialize segment: {}: {err}", self.segment_id);
                return Err(err);
            }
        };

        let published = match self
            .commit
            .set_file_stats(file_id, &written.file_name, written.size, written.row_count)
            .and_then(|()| self.commit.publish(wal_lsn))
        {
            Ok(published) => published,
            Err(err) => {
                self.commit.discard_pending_files();
                if let Err(cleanup) = self.storage.delete_file(&file_name) {
                    log::warn!("Failed to remove unpublished file {file_name}: {cleanup}");
                }
                log::error!("Failed to publish segment {}: {err}", self.segment_id);
                return Err(self.fail_if_gone(err));
            }
        };

        self.state = SegmentState::Flushed;
        let report = FlushReport {
            collection_id: self.collection_id,
            partition_id: self.partition_id,
            segment_id: self.segment_id,
            file_id,
            file_name: written.file_name,
            file_size: written.size,
            row_count: written.row_count,
            buffered_bytes,
            wal_lsn,
            version: published.version,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        log::debug!(
            "New file {} of size {} bytes, lsn = {}",
            report.file_id,
            report.file_size,
            wal_lsn
        );
        self.flushed = Some(report.clone());
        Ok(report)
    }

    /// Bytes charged for the rows currently buffered.
    pub fn current_memory_used(&self) -> usize {
        self.accountant.consumed()
    }

    pub fn memory_remaining(&self) -> usize {
        self.accountant.remaining()
    }

    /// Whether not even one more vector of the collection's dimension fits.
    pub fn is_full(&self) -> Result<bool> {
        let dimension = self.dimension()?;
        Ok(self.accountant.is_full(dimension * FLOAT_TYPE_SIZE))
    }

    /// Dimension of the collection's vector field.
    ///
    /// Resolved from the snapshot store on first use, then cached.
    pub fn dimension(&self) -> Result<usize> {
        if let Some(dimension) = self.dimension.get() {
            return Ok(*dimension);
        }
        let dimension = self.resolve_dimension()?;
        Ok(*self.dimension.get_or_init(|| dimension))
    }

    fn resolve_dimension(&self) -> Result<usize> {
        let snapshot = self.store.get_snapshot(self.collection_id)?;
        let field = snapshot.field(&self.config.vector_field).ok_or_else(|| {
            PilumError::schema(format!(
                "collection {} has no vector field: {}",
                self.collection_id, self.config.vector_field
            ))
        })?;
        let value = field.param(&self.config.dimension_param).ok_or_else(|| {
            PilumError::schema(format!(
                "Vector field params must contain: {}",
                self.config.dimension_param
            ))
        })?;

        let dimension = value
            .as_i64()
            .filter(|dimension| *dimension > 0)
            .and_then(|dimension| usize::try_from(dimension).ok());
        match dimension {
            Some(dimension) if dimension <= MAX_DIMENSION => Ok(dimension),
            _ => Err(PilumError::schema(format!(
                "invalid dimension {value} for field {}",
                self.config.vector_field
            ))),
        }
    }

    fn checked_dimension(&mut self, operation: &str) -> Result<usize> {
        self.dimension().map_err(|err| {
            log::error!(
                "{operation} on segment {}: dimension unavailable: {err}",
                self.segment_id
            );
            self.fail_if_gone(err)
        })
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        match self.state {
            SegmentState::Active => Ok(()),
            SegmentState::Flushed => Err(PilumError::invalid_operation(format!(
                "cannot {operation}: segment {} is already flushed",
                self.segment_id
            ))),
            SegmentState::Failed => Err(PilumError::invalid_operation(format!(
                "cannot {operation}: segment {} has failed",
                self.segment_id
            ))),
        }
    }

    /// Enter `Failed` when the store no longer knows the collection or
    /// partition. No retry can succeed after that.
    fn fail_if_gone(&mut self, err: PilumError) -> PilumError {
        if err.is_not_found() && self.state == SegmentState::Active {
            log::error!(
                "Segment {} failed, target is gone: {err}",
                self.segment_id
            );
            self.state = SegmentState::Failed;
        }
        err
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    pub fn row_count(&self) -> usize {
        self.writer.vector_count()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    /// Buffered external ids in insertion order.
    pub fn ids(&self) -> Vec<u64> {
        self.writer.ids()
    }

    pub fn rows(&self) -> &[BufferedRow] {
        self.writer.rows()
    }

    /// Report of the successful flush, once flushed.
    pub fn flushed_file(&self) -> Option<&FlushReport> {
        self.flushed.as_ref()
    }

    pub fn config(&self) -> &MemSegmentConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldSchema, LocalSnapshotStore};
    use crate::segment::format::SegmentReader;
    use crate::segment::source::{EntityBatch, VectorBatch};
    use crate::storage::memory::MemoryStorage;
    use crate::vector::Vector;

    struct Fixture {
        store: Arc<LocalSnapshotStore>,
        storage: Arc<MemoryStorage>,
        collection: CollectionId,
        partition: PartitionId,
    }

    impl Fixture {
        fn new(dimension: i64) -> Self {
            let store = Arc::new(LocalSnapshotStore::new());
            let collection = store
                .create_collection("c", vec![FieldSchema::vector("vector", dimension)])
                .unwrap();
            let partition = store.create_partition(collection, "p").unwrap();
            Self {
                store,
                storage: Arc::new(MemoryStorage::new_default()),
                collection,
                partition,
            }
        }

        fn segment(&self, budget: usize) -> MemSegment {
            MemSegment::create(
                self.collection,
                self.partition,
                MemSegmentConfig::with_budget(budget),
                self.store.clone(),
                self.storage.clone(),
            )
            .unwrap()
        }
    }

    fn batch(ids: std::ops::Range<u64>, dimension: usize) -> VectorBatch {
        VectorBatch::from_rows(ids.map(|id| (id, vec![id as f32; dimension])).collect())
    }

    #[test]
    fn test_insert_admits_floor_of_remaining() {
        let fixture = Fixture::new(4);
        let mut segment = fixture.segment(100);

        // 16 bytes per row, 100 / 16 = 6
        let mut source = batch(0..10, 4);
        assert_eq!(segment.insert(&mut source).unwrap(), 6);
        assert_eq!(segment.current_memory_used(), 96);
        assert_eq!(segment.memory_remaining(), 4);
        assert!(segment.is_full().unwrap());
        assert_eq!(segment.insert(&mut source).unwrap(), 0);
        assert_eq!(source.remaining(), 4);
    }

    #[test]
    fn test_delete_releases_bytes() {
        let fixture = Fixture::new(4);
        let mut segment = fixture.segment(64);
        segment.insert(&mut batch(0..4, 4)).unwrap();
        assert!(segment.is_full().unwrap());

        assert_eq!(segment.delete(2).unwrap(), 1);
        assert_eq!(segment.current_memory_used(), 48);
        assert!(!segment.is_full().unwrap());
        assert_eq!(segment.delete(2).unwrap(), 0);

        assert_eq!(segment.delete_batch(&[0, 3, 77]).unwrap(), 2);
        assert_eq!(segment.ids(), vec![1]);
        assert_eq!(segment.current_memory_used(), 16);
    }

    #[test]
    fn test_entities_charge_their_own_size() {
        let fixture = Fixture::new(2);
        let mut segment = fixture.segment(100);
        let mut source = EntityBatch::with_attribute(
            (0..10).map(|id| (id, vec![0.5, 0.5], "ab".to_string())).collect(),
            "k",
        );

        // 8 + 8 + 3 = 19 bytes per entity
        assert_eq!(segment.insert_entities(&mut source).unwrap(), 5);
        assert_eq!(segment.current_memory_used(), 95);
        assert_eq!(segment.rows()[0].vector.get_metadata("k").map(String::as_str), Some("ab"));
    }

    #[test]
    fn test_wrong_width_rejected_wholesale() {
        let fixture = Fixture::new(4);
        let mut segment = fixture.segment(1000);
        let err = segment.insert(&mut batch(0..3, 3)).unwrap_err();
        assert!(matches!(err, PilumError::Schema(_)));
        assert!(segment.is_empty());
        assert_eq!(segment.current_memory_used(), 0);
        assert_eq!(segment.state(), SegmentState::Active);
    }

    #[test]
    fn test_invalid_dimension_param() {
        let store = Arc::new(LocalSnapshotStore::new());
        let collection = store
            .create_collection("c", vec![FieldSchema::vector("vector", 0)])
            .unwrap();
        let partition = store.create_partition(collection, "p").unwrap();
        let mut segment = MemSegment::create(
            collection,
            partition,
            MemSegmentConfig::with_budget(1000),
            store,
            Arc::new(MemoryStorage::new_default()),
        )
        .unwrap();

        assert!(matches!(segment.dimension(), Err(PilumError::Schema(_))));
        assert!(segment.insert(&mut batch(0..1, 1)).is_err());
        assert!(segment.is_empty());
    }

    #[test]
    fn test_flush_is_terminal() {
        let fixture = Fixture::new(2);
        let mut segment = fixture.segment(1000);
        segment.insert(&mut batch(0..3, 2)).unwrap();

        let report = segment.flush(11).unwrap();
        assert_eq!(report.row_count, 3);
        assert_eq!(report.wal_lsn, 11);
        assert_eq!(report.buffered_bytes, 24);
        assert_eq!(segment.state(), SegmentState::Flushed);
        assert_eq!(segment.flushed_file(), Some(&report));

        let err = segment.flush(12).unwrap_err();
        assert!(matches!(err, PilumError::InvalidOperation(_)));
        assert!(segment.insert(&mut batch(3..4, 2)).is_err());
        assert!(segment.delete(0).is_err());

        let snapshot = fixture.store.get_snapshot(fixture.collection).unwrap();
        assert_eq!(snapshot.files_of_segment(segment.segment_id()).len(), 1);
    }

    #[test]
    fn test_create_requires_partition() {
        let fixture = Fixture::new(2);
        let result = MemSegment::create(
            fixture.collection,
            fixture.partition + 1000,
            MemSegmentConfig::default(),
            fixture.store.clone(),
            fixture.storage.clone(),
        );
        assert!(result.unwrap_err().is_not_found());
    }

    /// Source that misbehaves in a chosen way.
    enum Script {
        Width(usize),
        EraseFirst,
        FailAfterAppend,
        OverSupply,
        MisReport,
    }

    struct ScriptedSource(Script);

    impl VectorSource for ScriptedSource {
        fn single_vector_size(&self, dimension: usize) -> usize {
            dimension * FLOAT_TYPE_SIZE
        }

        fn add_vectors(
            &mut self,
            writer: &mut SegmentWriter,
            dimension: usize,
            num_to_add: usize,
        ) -> Result<usize> {
            let row = |id: u64| Vector::new(vec![id as f32; dimension]);
            match self.0 {
                Script::Width(width) => {
                    writer.append(100, Vector::new(vec![1.0; width]))?;
                    Ok(1)
                }
                Script::EraseFirst => {
                    writer.erase(0);
                    Ok(0)
                }
                Script::FailAfterAppend => {
                    writer.append(100, row(100))?;
                    Err(PilumError::other("source broke"))
                }
                Script::OverSupply => {
                    for id in 0..=num_to_add as u64 {
                        writer.append(100 + id, row(100 + id))?;
                    }
                    Ok(num_to_add + 1)
                }
                Script::MisReport => {
                    writer.append(100, row(100))?;
                    Ok(2)
                }
            }
        }

        fn remaining(&self) -> usize {
            1
        }
    }

    fn charged(segment: &MemSegment) -> usize {
        segment.rows().iter().map(BufferedRow::charge).sum()
    }

    #[test]
    fn test_source_with_wrong_width_rolled_back() {
        let fixture = Fixture::new(4);
        let mut segment = fixture.segment(1000);

        let err = segment.insert(&mut ScriptedSource(Script::Width(3))).unwrap_err();
        assert!(matches!(err, PilumError::Schema(_)));
        assert!(segment.is_empty());
        assert_eq!(segment.current_memory_used(), 0);

        segment.insert(&mut batch(0..2, 4)).unwrap();
        let report = segment.flush(1).unwrap();
        let data = SegmentReader::open(fixture.storage.as_ref(), &report.file_name).unwrap();
        assert_eq!(data.header.dimension, 4);
    }

    #[test]
    fn test_failing_or_lying_sources_change_nothing() {
        let fixture = Fixture::new(2);
        for script in [Script::FailAfterAppend, Script::OverSupply, Script::MisReport] {
            let mut segment = fixture.segment(40);
            segment.insert(&mut batch(0..2, 2)).unwrap();

            assert!(segment.insert(&mut ScriptedSource(script)).is_err());
            assert_eq!(segment.row_count(), 2);
            assert_eq!(segment.ids(), vec![0, 1]);
            assert_eq!(segment.current_memory_used(), 16);
            assert_eq!(segment.state(), SegmentState::Active);
        }
    }

    #[test]
    fn test_source_removing_rows_keeps_accounting() {
        let fixture = Fixture::new(2);
        let mut segment = fixture.segment(1000);
        segment.insert(&mut batch(0..3, 2)).unwrap();

        let err = segment.insert(&mut ScriptedSource(Script::EraseFirst)).unwrap_err();
        assert!(matches!(err, PilumError::InvalidOperation(_)));
        assert_eq!(segment.ids(), vec![1, 2]);
        assert_eq!(segment.current_memory_used(), 16);
        assert_eq!(segment.current_memory_used(), charged(&segment));
    }

    #[test]
    fn test_oversized_dimension_is_schema_error() {
        for dimension in [1i64 << 62, MAX_DIMENSION as i64 + 1] {
            let fixture = Fixture::new(dimension);
            let mut segment = fixture.segment(1000);

            assert!(matches!(segment.is_full(), Err(PilumError::Schema(_))));
            let err = segment.insert(&mut batch(0..1, 4)).unwrap_err();
            assert!(matches!(err, PilumError::Schema(_)));
            assert_eq!(segment.state(), SegmentState::Active);
        }
        assert!(Fixture::new(MAX_DIMENSION as i64).segment(10).dimension().is_ok());
    }

    #[test]
    fn test_unwritten_reservation_is_discarded_on_failed_flush() {
        let fixture = Fixture::new(2);
        let mut segment = fixture.segment(1000);
        segment.insert(&mut batch(0..2, 2)).unwrap();

        let context = SegmentFileContext {
            field_name: segment.config.vector_field.clone(),
            field_element_name: segment.config.raw_element.clone(),
            collection_id: fixture.collection,
            partition_id: fixture.partition,
            segment_id: segment.segment_id(),
        };
        segment.commit.reserve_segment_file(&context).unwrap();

        let err = segment.flush(5).unwrap_err();
        assert!(matches!(err, PilumError::InvalidOperation(_)));
        assert!(segment.commit.pending_files().is_empty());
        assert_eq!(fixture.storage.file_count(), 0);
        assert_eq!(segment.state(), SegmentState::Active);

        let report = segment.flush(6).unwrap();
        assert_eq!(report.row_count, 2);
    }
}
