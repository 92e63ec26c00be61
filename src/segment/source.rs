//! Producers that materialize rows into a write buffer on demand.
//!
//! A memory segment asks a source how many bytes one row costs, works out how
//! many rows fit in its remaining budget and lets the source append up to that
//! many. Sources keep a cursor, so a partially consumed batch continues on the
//! next call (typically against a fresh segment).

use std::collections::HashMap;

use crate::config::FLOAT_TYPE_SIZE;
use crate::error::{PilumError, Result};
use crate::segment::writer::SegmentWriter;
use crate::vector::Vector;

/// Source of plain vector rows.
pub trait VectorSource {
    /// Bytes charged for one row of `dimension`.
    fn single_vector_size(&self, dimension: usize) -> usize;

    /// Append up to `num_to_add` rows and return how many were appended.
    ///
    /// Must never append more than `num_to_add`. A row whose width differs from
    /// `dimension` fails the whole call without appending anything. The
    /// segment checks the appended rows and rolls them back when the count or
    /// width is wrong.
    fn add_vectors(
        &mut self,
        writer: &mut SegmentWriter,
        dimension: usize,
        num_to_add: usize,
    ) -> Result<usize>;

    /// Rows not yet handed out.
    fn remaining(&self) -> usize;

    fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Source of entity rows: a vector plus attributes.
pub trait EntitySource {
    /// Bytes charged for one entity of `dimension`.
    fn single_entity_size(&self, dimension: usize) -> usize;

    /// Same contract as [`VectorSource::add_vectors`].
    fn add_entities(
        &mut self,
        writer: &mut SegmentWriter,
        dimension: usize,
        num_to_add: usize,
    ) -> Result<usize>;

    fn remaining(&self) -> usize;

    fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Fixed-width vectors stored row-major in one flat buffer.
#[derive(Debug, Clone)]
pub struct VectorBatch {
    ids: Vec<u64>,
    data: Vec<f32>,
    cursor: usize,
}

impl VectorBatch {
    /// `data` holds `ids.len()` rows laid out back to back.
    pub fn new(ids: Vec<u64>, data: Vec<f32>) -> Self {
        Self {
            ids,
            data,
            cursor: 0,
        }
    }

    /// Build a batch from `(id, vector)` pairs.
    pub fn from_rows(rows: Vec<(u64, Vec<f32>)>) -> Self {
        let mut ids = Vec::with_capacity(rows.len());
        let mut data = Vec::new();
        for (id, vector) in rows {
            ids.push(id);
            data.extend(vector);
        }
        Self::new(ids, data)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn check_width(&self, dimension: usize) -> Result<()> {
        if dimension == 0 || self.data.len() != self.ids.len() * dimension {
            return Err(PilumError::schema(format!(
                "vector batch holds {} floats for {} ids, which does not match dimension {dimension}",
                self.data.len(),
                self.ids.len()
            )));
        }
        Ok(())
    }
}

impl VectorSource for VectorBatch {
    fn single_vector_size(&self, dimension: usize) -> usize {
        dimension.saturating_mul(FLOAT_TYPE_SIZE)
    }

    fn add_vectors(
        &mut self,
        writer: &mut SegmentWriter,
        dimension: usize,
        num_to_add: usize,
    ) -> Result<usize> {
        self.check_width(dimension)?;
        if let Some(buffered) = writer.dimension()
            && buffered != dimension
        {
            return Err(PilumError::schema(format!(
                "buffer holds rows of dimension {buffered}, batch dimension is {dimension}"
            )));
        }
        if let Some(start) = (self.cursor..self.ids.len()).find(|&row| {
            self.data[row * dimension..(row + 1) * dimension]
                .iter()
                .any(|x| !x.is_finite())
        }) {
            return Err(PilumError::schema(format!(
                "row {} contains invalid values (NaN or infinity)",
                self.ids[start]
            )));
        }

        let count = num_to_add.min(self.remaining());
        for row in self.cursor..self.cursor + count {
            let values = self.data[row * dimension..(row + 1) * dimension].to_vec();
            writer.append(self.ids[row], Vector::new(values))?;
        }
        self.cursor += count;
        Ok(count)
    }

    fn remaining(&self) -> usize {
        self.ids.len() - self.cursor
    }
}

/// Entity rows: vectors with string attributes.
///
/// Every entity is charged the same amount: its id, its vector and the
/// attribute bytes of the largest entity in the batch, so the charge is an
/// upper bound for every row.
#[derive(Debug, Clone)]
pub struct EntityBatch {
    rows: Vec<(u64, Vector)>,
    max_attribute_bytes: usize,
    cursor: usize,
}

impl EntityBatch {
    pub fn new(rows: Vec<(u64, Vector)>) -> Self {
        let max_attribute_bytes = rows
            .iter()
            .map(|(_, vector)| vector.metadata_bytes())
            .max()
            .unwrap_or(0);
        Self {
            rows,
            max_attribute_bytes,
            cursor: 0,
        }
    }

    /// Convenience constructor for entities sharing a single attribute key.
    pub fn with_attribute(rows: Vec<(u64, Vec<f32>, String)>, key: &str) -> Self {
        Self::new(
            rows.into_iter()
                .map(|(id, data, value)| {
                    let mut metadata = HashMap::new();
                    metadata.insert(key.to_string(), value);
                    (id, Vector::with_metadata(data, metadata))
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl EntitySource for EntityBatch {
    fn single_entity_size(&self, dimension: usize) -> usize {
        dimension
            .saturating_mul(FLOAT_TYPE_SIZE)
            .saturating_add(std::mem::size_of::<u64>())
            .saturating_add(self.max_attribute_bytes)
    }

    fn add_entities(
        &mut self,
        writer: &mut SegmentWriter,
        dimension: usize,
        num_to_add: usize,
    ) -> Result<usize> {
        for (id, vector) in &self.rows[self.cursor..] {
            vector.validate_dimension(dimension).map_err(|e| {
                PilumError::schema(format!("entity {id}: {e}"))
            })?;
            if !vector.is_valid() {
                return Err(PilumError::schema(format!(
                    "entity {id} contains invalid values (NaN or infinity)"
                )));
            }
        }

        let count = num_to_add.min(self.remaining());
        for (id, vector) in &self.rows[self.cursor..self.cursor + count] {
            writer.append(*id, vector.clone())?;
        }
        self.cursor += count;
        Ok(count)
    }

    fn remaining(&self) -> usize {
        self.rows.len() - self.cursor
    }
}
