//! Versioned metadata (snapshot) access.
//!
//! The snapshot store is an external, shared service: memory segments receive
//! it as an `Arc<dyn SnapshotStore>` and never own it. Each memory segment owns
//! one [`commit::CommitHandle`], which reserves the segment identity when the
//! segment is created and publishes the segment together with its files when
//! the segment is flushed.

pub mod commit;
pub mod snapshot;
pub mod store;

pub use commit::{CommitHandle, PublishedBatch, SegmentFileContext};
pub use snapshot::{
    FieldSchema, PartitionRecord, SegmentFileRecord, SegmentRecord, Snapshot,
};
pub use store::{CommitBatch, LocalSnapshotStore, SnapshotStore};

/// Identifier of a collection.
pub type CollectionId = u64;

/// Identifier of a partition within a collection.
pub type PartitionId = u64;

/// Identifier of a segment.
pub type SegmentId = u64;

/// Identifier of a segment file.
pub type SegmentFileId = u64;

/// Snapshot version, bumped by every successful commit.
pub type Version = u64;

/// Write-ahead log sequence number attached to a flush as its checkpoint token.
pub type SeqNumber = u64;
