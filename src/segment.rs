//! In-memory segments and their on-disk form.
//!
//! A [`MemSegment`] owns a [`SegmentWriter`] holding the buffered rows, a
//! [`MemoryAccountant`] bounding them and a commit handle publishing the
//! flushed file.

pub mod accountant;
pub mod format;
pub mod mem_segment;
pub mod reconcile;
pub mod source;
pub mod writer;

use serde::{Deserialize, Serialize};

pub use accountant::MemoryAccountant;
pub use format::{SegmentData, SegmentHeader, SegmentReader, segment_file_name};
pub use mem_segment::{FlushReport, MemSegment};
pub use source::{EntityBatch, EntitySource, VectorBatch, VectorSource};
pub use writer::{BufferedRow, SegmentWriter, WrittenFile};

/// Lifecycle state of a memory segment.
///
/// Fullness is not a state: it is observed with [`MemSegment::is_full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Accepting inserts, deletes and a flush.
    Active,
    /// Written and published. Terminal.
    Flushed,
    /// The target collection or partition is gone. Terminal.
    Failed,
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentState::Active => write!(f, "active"),
            SegmentState::Flushed => write!(f, "flushed"),
            SegmentState::Failed => write!(f, "failed"),
        }
    }
}
