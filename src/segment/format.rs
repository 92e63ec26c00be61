//! On-disk encoding of a flushed segment.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! [magic "PSEG"][format version: u32][header length: u32][header: bincode]
//! rows x row_count:
//!     [external id: u64][f32 x dimension][attribute count: u32]
//!     attributes x count: [key length: u32][key][value length: u32][value]
//! [crc32 of everything above: u32]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{PilumError, Result};
use crate::meta::SegmentId;
use crate::storage::{self, Storage};
use crate::vector::Vector;

pub const SEGMENT_MAGIC: &[u8; 4] = b"PSEG";
pub const SEGMENT_FORMAT_VERSION: u32 = 1;
pub const SEGMENT_FILE_EXTENSION: &str = "pseg";

/// Name of the physical file holding a segment's raw vectors.
pub fn segment_file_name(segment_id: SegmentId) -> String {
    format!("segment_{segment_id}.{SEGMENT_FILE_EXTENSION}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub segment_id: SegmentId,
    pub dimension: u32,
    pub row_count: u64,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
}

/// Decoded content of a segment file.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentData {
    pub header: SegmentHeader,
    pub rows: Vec<(u64, Vector)>,
}

impl SegmentData {
    pub fn ids(&self) -> Vec<u64> {
        self.rows.iter().map(|(id, _)| *id).collect()
    }
}

fn write_string<W: Write>(output: &mut W, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    output.write_u32::<LittleEndian>(bytes.len() as u32)?;
    output.write_all(bytes)?;
    Ok(())
}

fn read_string<R: Read>(input: &mut R) -> Result<String> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| PilumError::corruption(format!("Invalid UTF-8 sequence in attributes: {e}")))
}

fn write_metadata<W: Write>(output: &mut W, metadata: &HashMap<String, String>) -> Result<()> {
    output.write_u32::<LittleEndian>(metadata.len() as u32)?;
    // Sorted so identical rows always encode to identical bytes.
    let sorted: BTreeMap<&String, &String> = metadata.iter().collect();
    for (key, value) in sorted {
        write_string(output, key)?;
        write_string(output, value)?;
    }
    Ok(())
}

fn read_metadata<R: Read>(input: &mut R) -> Result<HashMap<String, String>> {
    let count = input.read_u32::<LittleEndian>()? as usize;
    let mut metadata = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_string(input)?;
        let value = read_string(input)?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Encode rows into a complete segment file image.
pub fn encode_segment<'a, I>(header: &SegmentHeader, rows: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (u64, &'a Vector)>,
{
    let header_bytes = bincode::serialize(header)
        .map_err(|e| PilumError::other(format!("Failed to serialize segment header: {e}")))?;

    let mut buffer = Vec::new();
    buffer.write_all(SEGMENT_MAGIC)?;
    buffer.write_u32::<LittleEndian>(SEGMENT_FORMAT_VERSION)?;
    buffer.write_u32::<LittleEndian>(header_bytes.len() as u32)?;
    buffer.write_all(&header_bytes)?;

    let mut written_rows = 0u64;
    for (id, vector) in rows {
        if vector.dimension() != header.dimension as usize {
            return Err(PilumError::schema(format!(
                "row {id} has dimension {}, segment dimension is {}",
                vector.dimension(),
                header.dimension
            )));
        }
        buffer.write_u64::<LittleEndian>(id)?;
        for value in &vector.data {
            buffer.write_f32::<LittleEndian>(*value)?;
        }
        write_metadata(&mut buffer, &vector.metadata)?;
        written_rows += 1;
    }

    if written_rows != header.row_count {
        return Err(PilumError::invalid_operation(format!(
            "header announces {} rows, {written_rows} encoded",
            header.row_count
        )));
    }

    let checksum = crc32fast::hash(&buffer);
    buffer.write_u32::<LittleEndian>(checksum)?;
    Ok(buffer)
}

/// Decode and validate a segment file image.
pub fn decode_segment(bytes: &[u8]) -> Result<SegmentData> {
    if bytes.len() < SEGMENT_MAGIC.len() + 12 {
        return Err(PilumError::corruption(format!(
            "segment file too short: {} bytes",
            bytes.len()
        )));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(PilumError::corruption(format!(
            "segment checksum mismatch: expected {expected:#010x}, found {actual:#010x}"
        )));
    }

    let mut input = Cursor::new(body);
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != SEGMENT_MAGIC {
        return Err(PilumError::corruption("bad segment magic"));
    }

    let version = input.read_u32::<LittleEndian>()?;
    if version != SEGMENT_FORMAT_VERSION {
        return Err(PilumError::corruption(format!(
            "unsupported segment format version {version}"
        )));
    }

    let header_len = input.read_u32::<LittleEndian>()? as usize;
    let mut header_bytes = vec![0u8; header_len];
    input.read_exact(&mut header_bytes)?;
    let header: SegmentHeader = bincode::deserialize(&header_bytes)
        .map_err(|e| PilumError::corruption(format!("Failed to decode segment header: {e}")))?;

    let dimension = header.dimension as usize;
    let mut rows = Vec::with_capacity(header.row_count as usize);
    for _ in 0..header.row_count {
        let id = input.read_u64::<LittleEndian>()?;
        let mut data = vec![0.0f32; dimension];
        input.read_f32_into::<LittleEndian>(&mut data)?;
        let metadata = read_metadata(&mut input)?;
        rows.push((id, Vector::with_metadata(data, metadata)));
    }

    if input.position() as usize != body.len() {
        return Err(PilumError::corruption(format!(
            "{} trailing bytes after last row",
            body.len() - input.position() as usize
        )));
    }

    Ok(SegmentData { header, rows })
}

/// Reads flushed segment files back from storage.
pub struct SegmentReader;

impl SegmentReader {
    pub fn open(storage: &dyn Storage, name: &str) -> Result<SegmentData> {
        let bytes = storage::read_all(storage, name)?;
        decode_segment(&bytes)
    }
}
