//! Two-phase reserve/publish handle scoped to one memory segment.
//!
//! Reservations are local to the handle until [`CommitHandle::publish`] hands
//! them to the store in a single [`CommitBatch`]. Nothing reserved here is
//! visible to snapshot readers before that.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{PilumError, Result};
use crate::meta::snapshot::{SegmentFileRecord, SegmentRecord};
use crate::meta::store::{CommitBatch, SnapshotStore};
use crate::meta::{CollectionId, PartitionId, SegmentFileId, SegmentId, SeqNumber, Version};

/// Identity of a segment file to reserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFileContext {
    pub field_name: String,
    pub field_element_name: String,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
}

/// Records made visible by one publish.
#[derive(Debug, Clone)]
pub struct PublishedBatch {
    pub version: Version,
    pub files: Vec<SegmentFileRecord>,
}

#[derive(Debug)]
pub struct CommitHandle {
    store: Arc<dyn SnapshotStore>,
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment: Option<SegmentRecord>,
    segment_published: bool,
    pending_files: Vec<SegmentFileRecord>,
}

impl CommitHandle {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Self {
        Self {
            store,
            collection_id,
            partition_id,
            segment: None,
            segment_published: false,
            pending_files: Vec::new(),
        }
    }

    /// Reserve a new segment identity in the target partition.
    ///
    /// The partition is checked against a freshly fetched snapshot. A handle
    /// reserves at most one segment.
    pub fn reserve_segment(&mut self) -> Result<SegmentId> {
        if let Some(segment) = &self.segment {
            return Err(PilumError::invalid_operation(format!(
                "segment {} already reserved",
                segment.id
            )));
        }

        let snapshot = self.store.get_snapshot(self.collection_id)?;
        if snapshot.partition(self.partition_id).is_none() {
            return Err(PilumError::not_found(format!(
                "partition {} of collection {}",
                self.partition_id, self.collection_id
            )));
        }

        let id = self.store.allocate_id()?;
        self.segment = Some(SegmentRecord {
            id,
            collection_id: self.collection_id,
            partition_id: self.partition_id,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    /// The reserved segment, if any.
    pub fn segment(&self) -> Option<&SegmentRecord> {
        self.segment.as_ref()
    }

    /// Reserve a segment file record. It carries no size or rows yet.
    pub fn reserve_segment_file(&mut self, context: &SegmentFileContext) -> Result<SegmentFileId> {
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| PilumError::invalid_operation("no segment reserved"))?;
        if context.segment_id != segment.id
            || context.collection_id != self.collection_id
            || context.partition_id != self.partition_id
        {
            return Err(PilumError::invalid_operation(format!(
                "segment file context {}/{}/{} does not match reserved segment {}/{}/{}",
                context.collection_id,
                context.partition_id,
                context.segment_id,
                self.collection_id,
                self.partition_id,
                segment.id
            )));
        }

        let id = self.store.allocate_id()?;
        self.pending_files.push(SegmentFileRecord {
            id,
            collection_id: context.collection_id,
            partition_id: context.partition_id,
            segment_id: context.segment_id,
            field_name: context.field_name.clone(),
            element_name: context.field_element_name.clone(),
            file_name: String::new(),
            size: 0,
            row_count: 0,
            wal_lsn: 0,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    /// Record the physical outcome of writing a reserved file.
    pub fn set_file_stats(
        &mut self,
        file_id: SegmentFileId,
        file_name: &str,
        size: u64,
        row_count: u64,
    ) -> Result<()> {
        let file = self
            .pending_files
            .iter_mut()
            .find(|file| file.id == file_id)
            .ok_or_else(|| {
                PilumError::invalid_operation(format!("segment file {file_id} is not reserved"))
            })?;
        file.file_name = file_name.to_string();
        file.size = size;
        file.row_count = row_count;
        Ok(())
    }

    /// Reservations not yet published.
    pub fn pending_files(&self) -> &[SegmentFileRecord] {
        &self.pending_files
    }

    /// Drop every pending file reservation.
    pub fn discard_pending_files(&mut self) {
        self.pending_files.clear();
    }

    /// Publish the segment (on its first publish) and all pending files in one
    /// commit, stamping each file with `wal_lsn`.
    ///
    /// Files without a physical name are refused: a record is only published
    /// once its bytes exist. On failure the reservations stay pending.
    pub fn publish(&mut self, wal_lsn: SeqNumber) -> Result<PublishedBatch> {
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| PilumError::invalid_operation("no segment reserved"))?;

        if let Some(file) = self.pending_files.iter().find(|f| f.file_name.is_empty()) {
            return Err(PilumError::invalid_operation(format!(
                "segment file {} has not been written",
                file.id
            )));
        }

        let files: Vec<SegmentFileRecord> = self
            .pending_files
            .iter()
            .cloned()
            .map(|mut file| {
                file.wal_lsn = wal_lsn;
                file
            })
            .collect();

        let batch = CommitBatch {
            collection_id: self.collection_id,
            partition_id: self.partition_id,
            segment: (!self.segment_published).then(|| segment.clone()),
            files: files.clone(),
        };
        let version = self.store.commit(batch)?;

        self.segment_published = true;
        self.pending_files.clear();
        Ok(PublishedBatch { version, files })
    }
}
