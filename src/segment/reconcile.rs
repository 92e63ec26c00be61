//! Removal of buffered rows by external id.
//!
//! Both entry points only see rows that are still in the write buffer. Ids that
//! are not buffered are ignored.

use crate::segment::writer::SegmentWriter;

/// Rows removed by a delete and the bytes they had been charged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deleted {
    pub rows: usize,
    pub bytes: usize,
}

/// Remove the first buffered row whose id equals `id`.
pub fn delete_one(writer: &mut SegmentWriter, id: u64) -> Deleted {
    let Some(offset) = writer.rows().iter().position(|row| row.id == id) else {
        return Deleted::default();
    };
    match writer.erase(offset) {
        Some(row) => Deleted {
            rows: 1,
            bytes: row.charge(),
        },
        None => Deleted::default(),
    }
}

/// Remove every buffered row whose id is in `ids`.
///
/// The ids are sorted once and each buffered row is tested by binary search.
/// Erasing shifts later rows left, so the row seen at scan index `i` lives at
/// `i - deleted` by the time it is erased.
pub fn delete_batch(writer: &mut SegmentWriter, ids: &[u64]) -> Deleted {
    if ids.is_empty() || writer.is_empty() {
        return Deleted::default();
    }

    let mut sorted = ids.to_vec();
    sorted.sort_unstable();

    let buffered = writer.ids();
    let mut deleted = Deleted::default();
    for (i, id) in buffered.iter().enumerate() {
        if sorted.binary_search(id).is_err() {
            continue;
        }
        if let Some(row) = writer.erase(i - deleted.rows) {
            deleted.rows += 1;
            deleted.bytes += row.charge();
        }
    }
    deleted
}
