//! Rotation of memory segments for one partition.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::MemSegmentConfig;
use crate::error::{PilumError, Result};
use crate::meta::{CollectionId, PartitionId, SeqNumber, SnapshotStore};
use crate::segment::{EntitySource, FlushReport, MemSegment, SegmentState, VectorSource};
use crate::storage::Storage;

/// Buffered, not yet flushed segments of one partition.
///
/// Inserts go to a single mutable segment. When it fills up it is queued as
/// immutable and a fresh segment is created on the next insert.
#[derive(Debug)]
pub struct MemTable {
    collection_id: CollectionId,
    partition_id: PartitionId,
    config: MemSegmentConfig,
    store: Arc<dyn SnapshotStore>,
    storage: Arc<dyn Storage>,
    mutable: Option<MemSegment>,
    immutable: VecDeque<MemSegment>,
}

impl MemTable {
    pub fn new(
        collection_id: CollectionId,
        partition_id: PartitionId,
        config: MemSegmentConfig,
        store: Arc<dyn SnapshotStore>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            collection_id,
            partition_id,
            config,
            store,
            storage,
            mutable: None,
            immutable: VecDeque::new(),
        })
    }

    /// Buffer every row of `source`, rotating segments as they fill up.
    pub fn insert<S>(&mut self, source: &mut S) -> Result<usize>
    where
        S: VectorSource + ?Sized,
    {
        let mut total = 0;
        while !source.is_exhausted() {
            let segment = self.mutable_segment()?;
            let added = segment.insert(source)?;
            total += added;
            self.rotate_if_needed(added)?;
        }
        Ok(total)
    }

    /// Buffer every entity of `source`, rotating segments as they fill up.
    pub fn insert_entities<S>(&mut self, source: &mut S) -> Result<usize>
    where
        S: EntitySource + ?Sized,
    {
        let mut total = 0;
        while !source.is_exhausted() {
            let segment = self.mutable_segment()?;
            let added = segment.insert_entities(source)?;
            total += added;
            self.rotate_if_needed(added)?;
        }
        Ok(total)
    }

    /// Delete `id` from every active buffered segment.
    pub fn delete(&mut self, id: u64) -> Result<usize> {
        let mut deleted = 0;
        for segment in self.active_segments_mut() {
            deleted += segment.delete(id)?;
        }
        Ok(deleted)
    }

    /// Delete `ids` from every active buffered segment.
    ///
    /// Failed segments are skipped; their rows can no longer be published.
    pub fn delete_batch(&mut self, ids: &[u64]) -> Result<usize> {
        let mut deleted = 0;
        for segment in self.active_segments_mut() {
            deleted += segment.delete_batch(ids)?;
        }
        Ok(deleted)
    }

    /// Flush every buffered segment, oldest first.
    ///
    /// Stops at the first error. The failing segment and every later one stay
    /// buffered; segments flushed before it are gone from the table.
    pub fn flush(&mut self, wal_lsn: SeqNumber) -> Result<Vec<FlushReport>> {
        if let Some(segment) = self.mutable.take() {
            if segment.is_empty() {
                self.mutable = Some(segment);
            } else {
                self.immutable.push_back(segment);
            }
        }

        let mut reports = Vec::with_capacity(self.immutable.len());
        while let Some(mut segment) = self.immutable.pop_front() {
            match segment.flush(wal_lsn) {
                Ok(report) => reports.push(report),
                Err(err) => {
                    log::error!(
                        "Flush of partition {} stopped at segment {} after {} segments: {err}",
                        self.partition_id,
                        segment.segment_id(),
                        reports.len()
                    );
                    self.immutable.push_front(segment);
                    return Err(err);
                }
            }
        }

        log::info!(
            "Flushed {} segments of partition {}, lsn = {wal_lsn}",
            reports.len(),
            self.partition_id
        );
        Ok(reports)
    }

    /// Hand over full segments, e.g. to a [`crate::flusher::Flusher`].
    pub fn take_immutable(&mut self) -> Vec<MemSegment> {
        self.immutable.drain(..).collect()
    }

    /// Bytes used by every buffered segment.
    pub fn memory_used(&self) -> usize {
        self.segments().map(MemSegment::current_memory_used).sum()
    }

    pub fn row_count(&self) -> usize {
        self.segments().map(MemSegment::row_count).sum()
    }

    /// Number of buffered segments, including the mutable one.
    pub fn segment_count(&self) -> usize {
        self.immutable.len() + usize::from(self.mutable.is_some())
    }

    pub fn immutable_count(&self) -> usize {
        self.immutable.len()
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn segments(&self) -> impl Iterator<Item = &MemSegment> {
        self.immutable.iter().chain(self.mutable.iter())
    }

    fn active_segments_mut(&mut self) -> impl Iterator<Item = &mut MemSegment> {
        self.immutable
            .iter_mut()
            .chain(self.mutable.iter_mut())
            .filter(|segment| segment.state() == SegmentState::Active)
    }

    fn mutable_segment(&mut self) -> Result<&mut MemSegment> {
        if self.mutable.is_none() {
            let segment = MemSegment::create(
                self.collection_id,
                self.partition_id,
                self.config.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.storage),
            )?;
            self.mutable = Some(segment);
        }
        self.mutable
            .as_mut()
            .ok_or_else(|| PilumError::other("mutable segment missing"))
    }

    fn rotate_if_needed(&mut self, added: usize) -> Result<()> {
        let Some(segment) = self.mutable.as_ref() else {
            return Ok(());
        };
        if added == 0 && segment.is_empty() {
            return Err(PilumError::invalid_config(format!(
                "a single row does not fit into the segment budget of {} bytes",
                self.config.max_segment_bytes
            )));
        }
        if added == 0 || segment.is_full()? {
            if let Some(full) = self.mutable.take() {
                log::debug!(
                    "Segment {} is full with {} rows, rotating",
                    full.segment_id(),
                    full.row_count()
                );
                self.immutable.push_back(full);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldSchema, LocalSnapshotStore};
    use crate::segment::VectorBatch;
    use crate::storage::memory::MemoryStorage;

    fn table(budget: usize) -> (MemTable, Arc<LocalSnapshotStore>) {
        let store = Arc::new(LocalSnapshotStore::new());
        let collection = store
            .create_collection("c", vec![FieldSchema::vector("vector", 2)])
            .unwrap();
        let partition = store.create_partition(collection, "p").unwrap();
        let table = MemTable::new(
            collection,
            partition,
            MemSegmentConfig::with_budget(budget),
            store.clone(),
            Arc::new(MemoryStorage::new_default()),
        )
        .unwrap();
        (table, store)
    }

    fn batch(ids: std::ops::Range<u64>) -> VectorBatch {
        VectorBatch::from_rows(ids.map(|id| (id, vec![id as f32, 1.0])).collect())
    }

    #[test]
    fn test_insert_rotates_segments() {
        // 8 bytes per row, 3 rows per segment
        let (mut table, _) = table(24);
        assert_eq!(table.insert(&mut batch(0..10)).unwrap(), 10);
        assert_eq!(table.immutable_count(), 3);
        assert_eq!(table.segment_count(), 4);
        assert_eq!(table.row_count(), 10);
        assert_eq!(table.memory_used(), 80);
    }

    #[test]
    fn test_delete_spans_segments() {
        let (mut table, _) = table(24);
        table.insert(&mut batch(0..10)).unwrap();
        assert_eq!(table.delete_batch(&[0, 4, 9]).unwrap(), 3);
        assert_eq!(table.delete(5).unwrap(), 1);
        assert_eq!(table.row_count(), 6);
    }

    #[test]
    fn test_flush_publishes_all_segments() {
        let (mut table, store) = table(24);
        table.insert(&mut batch(0..7)).unwrap();

        let reports = table.flush(3).unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports.iter().map(|r| r.row_count).sum::<u64>(), 7);
        assert_eq!(table.segment_count(), 0);

        let snapshot = store.get_snapshot(table.collection_id()).unwrap();
        assert_eq!(snapshot.partition_row_count(table.partition_id()), 7);
    }

    #[test]
    fn test_delete_skips_failed_segments() {
        let (mut table, store) = table(24);
        table.insert(&mut batch(0..7)).unwrap();

        store
            .drop_partition(table.collection_id(), table.partition_id())
            .unwrap();
        assert!(table.flush(3).is_err());
        assert_eq!(table.segment_count(), 3);

        // the oldest segment failed, the later ones still take deletes
        assert_eq!(table.delete_batch(&[0, 4, 6]).unwrap(), 2);
        assert_eq!(table.delete(5).unwrap(), 1);
        assert_eq!(table.row_count(), 4);
    }

    #[test]
    fn test_row_larger_than_budget() {
        let (mut table, _) = table(4);
        assert!(table.insert(&mut batch(0..1)).is_err());
    }
}
