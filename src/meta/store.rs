//! Snapshot store interface and an in-process implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PilumError, Result};
use crate::meta::snapshot::{FieldSchema, PartitionRecord, SegmentFileRecord, SegmentRecord, Snapshot};
use crate::meta::{CollectionId, PartitionId, Version};
use crate::storage::{self, Storage};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Reservations published together by one commit.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    /// New segment to make visible, if it has not been published before.
    pub segment: Option<SegmentRecord>,
    pub files: Vec<SegmentFileRecord>,
}

/// Access to the versioned metadata store.
///
/// Implementations arbitrate concurrent commits themselves; callers never
/// retry internally.
pub trait SnapshotStore: Send + Sync + std::fmt::Debug {
    /// Fetch the latest snapshot of a collection.
    fn get_snapshot(&self, collection_id: CollectionId) -> Result<Arc<Snapshot>>;

    /// Allocate a globally unique id for a segment or segment file.
    fn allocate_id(&self) -> Result<u64>;

    /// Atomically publish a batch. Either every record becomes visible or none.
    fn commit(&self, batch: CommitBatch) -> Result<Version>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreManifest {
    version: u32,
    next_id: u64,
    collections: Vec<Snapshot>,
}

/// In-process snapshot store.
///
/// Snapshots are copy-on-write: every mutation builds a new [`Snapshot`] with a
/// bumped version and swaps it in, so handed-out snapshots never change. When
/// opened over a [`Storage`], the whole store is persisted to
/// [`MANIFEST_FILE`] before a mutation becomes visible.
#[derive(Debug, Default)]
pub struct LocalSnapshotStore {
    collections: RwLock<AHashMap<CollectionId, Arc<Snapshot>>>,
    next_id: AtomicU64,
    storage: Option<Arc<dyn Storage>>,
}

impl LocalSnapshotStore {
    /// Create an empty, non-persistent store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted in `storage`, loading the manifest if present.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let mut collections = AHashMap::new();
        let mut next_id = 0;

        if storage.file_exists(MANIFEST_FILE) {
            let bytes = storage::read_all(storage.as_ref(), MANIFEST_FILE)?;
            let manifest: StoreManifest = serde_json::from_slice(&bytes)?;
            if manifest.version != MANIFEST_VERSION {
                return Err(PilumError::corruption(format!(
                    "unsupported manifest version {}",
                    manifest.version
                )));
            }
            next_id = manifest.next_id;
            for snapshot in manifest.collections {
                collections.insert(snapshot.collection_id, Arc::new(snapshot));
            }
            log::debug!(
                "loaded manifest with {} collections, next id {next_id}",
                collections.len()
            );
        }

        Ok(Self {
            collections: RwLock::new(collections),
            next_id: AtomicU64::new(next_id),
            storage: Some(storage),
        })
    }

    /// Register a collection with its field schema.
    pub fn create_collection<S: Into<String>>(
        &self,
        name: S,
        fields: Vec<FieldSchema>,
    ) -> Result<CollectionId> {
        let id = self.allocate_id()?;
        let mut snapshot = Snapshot::new(id, name);
        for field in fields {
            snapshot.fields.insert(field.name.clone(), field);
        }
        snapshot.version = 1;

        let mut guard = self.collections.write();
        guard.insert(id, Arc::new(snapshot));
        if let Err(err) = self.persist(&guard) {
            guard.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Drop a collection. Segments not yet published for it can no longer commit.
    pub fn drop_collection(&self, collection_id: CollectionId) -> Result<()> {
        let mut guard = self.collections.write();
        let removed = guard
            .remove(&collection_id)
            .ok_or_else(|| PilumError::not_found(format!("collection {collection_id}")))?;
        if let Err(err) = self.persist(&guard) {
            guard.insert(collection_id, removed);
            return Err(err);
        }
        Ok(())
    }

    /// Add a partition to a collection.
    pub fn create_partition<S: Into<String>>(
        &self,
        collection_id: CollectionId,
        name: S,
    ) -> Result<PartitionId> {
        let id = self.allocate_id()?;
        let name = name.into();
        self.update(collection_id, move |snapshot| {
            snapshot.partitions.insert(id, PartitionRecord { id, name });
            Ok(())
        })?;
        Ok(id)
    }

    /// Remove a partition together with its published segments and files.
    pub fn drop_partition(&self, collection_id: CollectionId, partition_id: PartitionId) -> Result<()> {
        self.update(collection_id, |snapshot| {
            snapshot
                .partitions
                .remove(&partition_id)
                .ok_or_else(|| PilumError::not_found(format!("partition {partition_id}")))?;
            snapshot
                .segments
                .retain(|_, segment| segment.partition_id != partition_id);
            snapshot
                .segment_files
                .retain(|_, file| file.partition_id != partition_id);
            Ok(())
        })
        .map(|_| ())
    }

    /// Ids of all known collections.
    pub fn collection_ids(&self) -> Vec<CollectionId> {
        let mut ids: Vec<CollectionId> = self.collections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn update<F>(&self, collection_id: CollectionId, mutate: F) -> Result<Version>
    where
        F: FnOnce(&mut Snapshot) -> Result<()>,
    {
        let mut guard = self.collections.write();
        let current = guard
            .get(&collection_id)
            .cloned()
            .ok_or_else(|| PilumError::not_found(format!("collection {collection_id}")))?;

        let mut next = (*current).clone();
        mutate(&mut next)?;
        next.version = current.version + 1;
        let version = next.version;

        guard.insert(collection_id, Arc::new(next));
        if let Err(err) = self.persist(&guard) {
            guard.insert(collection_id, current);
            return Err(err);
        }
        Ok(version)
    }

    fn persist(&self, collections: &AHashMap<CollectionId, Arc<Snapshot>>) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let mut snapshots: Vec<Snapshot> = collections.values().map(|s| (**s).clone()).collect();
        snapshots.sort_by_key(|s| s.collection_id);
        let manifest = StoreManifest {
            version: MANIFEST_VERSION,
            next_id: self.next_id.load(Ordering::SeqCst),
            collections: snapshots,
        };

        let bytes = serde_json::to_vec_pretty(&manifest)?;
        storage::write_atomic(storage.as_ref(), MANIFEST_FILE, &bytes, true)
            .map_err(|e| PilumError::metadata(format!("failed to persist manifest: {e}")))?;
        Ok(())
    }
}

impl SnapshotStore for LocalSnapshotStore {
    fn get_snapshot(&self, collection_id: CollectionId) -> Result<Arc<Snapshot>> {
        self.collections
            .read()
            .get(&collection_id)
            .cloned()
            .ok_or_else(|| PilumError::not_found(format!("collection {collection_id}")))
    }

    fn allocate_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn commit(&self, batch: CommitBatch) -> Result<Version> {
        let partition_id = batch.partition_id;
        self.update(batch.collection_id, move |snapshot| {
            if snapshot.partition(partition_id).is_none() {
                return Err(PilumError::not_found(format!("partition {partition_id}")));
            }

            if let Some(segment) = batch.segment {
                if snapshot.segments.contains_key(&segment.id) {
                    return Err(PilumError::metadata(format!(
                        "segment {} already published",
                        segment.id
                    )));
                }
                snapshot.segments.insert(segment.id, segment);
            }

            for file in batch.files {
                if !snapshot.segments.contains_key(&file.segment_id) {
                    return Err(PilumError::metadata(format!(
                        "segment file {} references unpublished segment {}",
                        file.id, file.segment_id
                    )));
                }
                if snapshot.segment_files.contains_key(&file.id) {
                    return Err(PilumError::metadata(format!(
                        "segment file {} already published",
                        file.id
                    )));
                }
                snapshot.segment_files.insert(file.id, file);
            }
            Ok(())
        })
    }
}
