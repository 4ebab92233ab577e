//! Block-boundary scanning and segment partitioning for large files.
//!
//! Large partition images are split across workers by decompressed size, not
//! by block count — block payloads vary wildly, and equal counts would leave
//! some workers idle. The scan reads EncodeHeaders only; nothing is
//! decrypted.

use crate::decode::{EncodeHeader, ENCODE_HEADER_SIZE};
use crate::index::FileEntry;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Files below this decompressed size take the sequential path.
pub const SEGMENT_THRESHOLD: u64 = 500 * MIB;

/// Segment-count policy by declared partition length.
pub fn segment_count(partition_length: u64) -> usize {
    match partition_length {
        n if n < SEGMENT_THRESHOLD => 1,
        n if n < GIB => 4,
        n if n < 2 * GIB => 8,
        n if n < 4 * GIB => 12,
        _ => 16,
    }
}

/// One block boundary recorded by the scan.
#[derive(Debug, Clone, Copy)]
pub struct BlockBoundary {
    /// Absolute offset of the EncodeHeader inside the bulk region.
    pub offset: u64,
    /// Block index within the file, starting at 0.
    pub index: usize,
    /// Sum of `processed_size` over all earlier blocks of this file.
    pub processed_before: u64,
    pub processed_size: u64,
    pub original_size: u64,
}

/// A contiguous run of blocks assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start_offset: u64,
    /// The next segment's `start_offset`, or the file's slice end for the
    /// last segment.
    pub end_offset: u64,
    pub start_block_index: usize,
    pub num_blocks: usize,
}

/// Scan the file's slice of the bulk region, recording every block boundary.
///
/// Stops at the end of the slice or at the first header that fails to parse;
/// the failure itself surfaces later, when a worker decrypts that offset.
pub fn scan_boundaries(region6: &[u8], entry: &FileEntry) -> Vec<BlockBoundary> {
    let end = entry.offset.saturating_add(entry.length).min(region6.len() as u64);
    let mut boundaries = Vec::new();
    let mut cur = entry.offset;
    let mut processed_before = 0u64;

    while cur + ENCODE_HEADER_SIZE as u64 <= end {
        let header = match EncodeHeader::parse(&region6[cur as usize..end as usize]) {
            Ok(h) => h,
            Err(_) => break,
        };
        boundaries.push(BlockBoundary {
            offset: cur,
            index: boundaries.len(),
            processed_before,
            processed_size: header.processed_size,
            original_size: header.original_size,
        });
        processed_before = processed_before.saturating_add(header.processed_size);
        cur = cur
            .saturating_add(ENCODE_HEADER_SIZE as u64)
            .saturating_add(header.original_size);
    }
    boundaries
}

/// Partition scanned boundaries into at most `want` segments of roughly
/// equal decompressed size.
///
/// `end_offset` is the end of the file's slice (`entry.offset +
/// entry.length`). When `want` exceeds the block count, only one segment per
/// block is emitted.
pub fn partition(boundaries: &[BlockBoundary], end_offset: u64, want: usize) -> Vec<Segment> {
    if boundaries.is_empty() {
        return Vec::new();
    }
    let want = want.clamp(1, boundaries.len());
    let total = boundaries
        .iter()
        .fold(0u64, |a, b| a.saturating_add(b.processed_size));
    let target = total / want as u64;

    let mut segments = Vec::with_capacity(want);
    let mut start = 0usize;
    let mut acc = 0u64;

    for (i, b) in boundaries.iter().enumerate() {
        acc = acc.saturating_add(b.processed_size);
        let last = i + 1 == boundaries.len();
        if (acc >= target && segments.len() < want - 1) || last {
            segments.push(Segment {
                start_offset: boundaries[start].offset,
                end_offset: if last { end_offset } else { boundaries[i + 1].offset },
                start_block_index: start,
                num_blocks: i + 1 - start,
            });
            start = i + 1;
            acc = 0;
        }
    }
    segments
}
