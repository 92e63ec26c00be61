//! Snapshot types: the point-in-time view of one collection's metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::meta::{CollectionId, PartitionId, SegmentFileId, SegmentId, SeqNumber, Version};

/// Schema entry of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl FieldSchema {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Vector field with a `dimension` param.
    pub fn vector<S: Into<String>>(name: S, dimension: i64) -> Self {
        Self::new(name).with_param("dimension", Value::from(dimension))
    }

    pub fn with_param<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Look up a param by key.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub id: PartitionId,
    pub name: String,
}

/// A published segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub created_at: DateTime<Utc>,
}

/// One durable artifact of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFileRecord {
    pub id: SegmentFileId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub field_name: String,
    pub element_name: String,
    /// Name of the physical file in storage; empty until the bytes are written.
    pub file_name: String,
    pub size: u64,
    pub row_count: u64,
    /// WAL position covered by this file.
    pub wal_lsn: SeqNumber,
    pub created_at: DateTime<Utc>,
}

/// Immutable, versioned view of a collection.
///
/// Readers only ever see published segments and files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub collection_id: CollectionId,
    pub name: String,
    pub version: Version,
    pub fields: HashMap<String, FieldSchema>,
    pub partitions: HashMap<PartitionId, PartitionRecord>,
    #[serde(default)]
    pub segments: HashMap<SegmentId, SegmentRecord>,
    #[serde(default)]
    pub segment_files: HashMap<SegmentFileId, SegmentFileRecord>,
}

impl Snapshot {
    pub fn new<S: Into<String>>(collection_id: CollectionId, name: S) -> Self {
        Self {
            collection_id,
            name: name.into(),
            version: 0,
            fields: HashMap::new(),
            partitions: HashMap::new(),
            segments: HashMap::new(),
            segment_files: HashMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn partition(&self, id: PartitionId) -> Option<&PartitionRecord> {
        self.partitions.get(&id)
    }

    pub fn segment(&self, id: SegmentId) -> Option<&SegmentRecord> {
        self.segments.get(&id)
    }

    /// Published files of a segment, ordered by file id.
    pub fn files_of_segment(&self, segment_id: SegmentId) -> Vec<&SegmentFileRecord> {
        let mut files: Vec<&SegmentFileRecord> = self
            .segment_files
            .values()
            .filter(|file| file.segment_id == segment_id)
            .collect();
        files.sort_by_key(|file| file.id);
        files
    }

    /// Total rows published for a partition.
    pub fn partition_row_count(&self, partition_id: PartitionId) -> u64 {
        self.segment_files
            .values()
            .filter(|file| file.partition_id == partition_id)
            .map(|file| file.row_count)
            .sum()
    }
}
