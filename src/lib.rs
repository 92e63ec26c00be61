//! # Pilum
//!
//! Write-buffering core of a vector database storage engine.
//!
//! ## Features
//!
//! - Memory-bounded admission of vectors and entities per partition
//! - Delete reconciliation against not-yet-flushed rows
//! - Two-phase reserve/publish of segment files against a versioned snapshot store
//! - Pluggable storage backends (memory, file system)
//! - Segment rotation and background flushing

pub mod cli;
pub mod config;
pub mod error;
pub mod flusher;
pub mod mem_table;
pub mod meta;
pub mod segment;
pub mod storage;
pub mod vector;

pub mod prelude {
    pub use crate::config::MemSegmentConfig;
    pub use crate::error::{PilumError, Result};
    pub use crate::mem_table::MemTable;
    pub use crate::meta::{FieldSchema, LocalSnapshotStore, SnapshotStore};
    pub use crate::segment::{EntityBatch, MemSegment, SegmentState, VectorBatch};
    pub use crate::storage::Storage;
    pub use crate::vector::Vector;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
