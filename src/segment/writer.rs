//! In-memory write buffer for one not-yet-durable segment.

use chrono::Utc;

use crate::error::{PilumError, Result};
use crate::meta::SegmentId;
use crate::segment::format::{SegmentHeader, encode_segment};
use crate::storage::{self, Storage};
use crate::vector::Vector;

/// A buffered row and the bytes charged for it at admission.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRow {
    pub id: u64,
    pub vector: Vector,
    pub(crate) charge: usize,
}

impl BufferedRow {
    pub fn charge(&self) -> usize {
        self.charge
    }
}

/// Outcome of a successful physical write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub file_name: String,
    pub size: u64,
    pub row_count: u64,
}

/// Rows in insertion order. Erasing a row shifts every later row one
/// position to the left.
#[derive(Debug)]
pub struct SegmentWriter {
    segment_id: SegmentId,
    rows: Vec<BufferedRow>,
    dimension: Option<usize>,
    last_written: Option<WrittenFile>,
}

impl SegmentWriter {
    pub fn new(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            rows: Vec::new(),
            dimension: None,
            last_written: None,
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Width shared by every buffered row, once the first row is appended.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Append one row. Rows must all share one dimension and hold finite values.
    pub fn append(&mut self, id: u64, vector: Vector) -> Result<()> {
        if let Some(dimension) = self.dimension {
            vector.validate_dimension(dimension)?;
        } else if vector.dimension() == 0 {
            return Err(PilumError::schema(format!("row {id} has an empty vector")));
        }
        if !vector.is_valid() {
            return Err(PilumError::schema(format!(
                "row {id} contains invalid values (NaN or infinity)"
            )));
        }

        self.dimension.get_or_insert(vector.dimension());
        self.rows.push(BufferedRow {
            id,
            vector,
            charge: 0,
        });
        Ok(())
    }

    /// Set the admission charge of every row from `from` onwards.
    pub(crate) fn assign_charge(&mut self, from: usize, charge: usize) {
        for row in self.rows.iter_mut().skip(from) {
            row.charge = charge;
        }
    }

    /// Drop every row at or after `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
        if self.rows.is_empty() {
            self.dimension = None;
        }
    }

    /// Drop every row that was never charged.
    pub(crate) fn retain_charged(&mut self) {
        self.rows.retain(|row| row.charge > 0);
        if self.rows.is_empty() {
            self.dimension = None;
        }
    }

    /// Whether every row from `from` onwards has `dimension` floats.
    pub(crate) fn rows_have_dimension(&self, from: usize, dimension: usize) -> bool {
        self.dimension.is_none_or(|width| width == dimension)
            && self
                .rows
                .iter()
                .skip(from)
                .all(|row| row.vector.dimension() == dimension)
    }

    /// External ids in buffer order.
    pub fn ids(&self) -> Vec<u64> {
        self.rows.iter().map(|row| row.id).collect()
    }

    pub fn rows(&self) -> &[BufferedRow] {
        &self.rows
    }

    /// Remove the row at `offset`.
    pub(crate) fn erase(&mut self, offset: usize) -> Option<BufferedRow> {
        if offset >= self.rows.len() {
            return None;
        }
        Some(self.rows.remove(offset))
    }

    pub fn vector_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sum of the admission charges of the buffered rows.
    pub fn buffered_bytes(&self) -> usize {
        self.rows.iter().map(|row| row.charge).sum()
    }

    /// Size in bytes of the last successful serialization.
    pub fn size(&self) -> Option<u64> {
        self.last_written.as_ref().map(|file| file.size)
    }

    /// Write the buffered rows to `file_name`, replacing it atomically.
    ///
    /// The buffer is left untouched, so a failed write can be retried.
    pub fn serialize(
        &mut self,
        storage: &dyn Storage,
        file_name: &str,
        sync: bool,
    ) -> Result<WrittenFile> {
        let header = SegmentHeader {
            segment_id: self.segment_id,
            dimension: self.dimension.unwrap_or(0) as u32,
            row_count: self.rows.len() as u64,
            created_at: Utc::now().timestamp_millis(),
        };
        let bytes = encode_segment(&header, self.rows.iter().map(|row| (row.id, &row.vector)))?;
        let size = storage::write_atomic(storage, file_name, &bytes, sync)?;

        let written = WrittenFile {
            file_name: file_name.to_string(),
            size,
            row_count: header.row_count,
        };
        self.last_written = Some(written.clone());
        Ok(written)
    }
}
