//! Block engine — stage 2 of the extraction pipeline.
//!
//! For every FileIndex entry the engine walks the file's slice of the bulk
//! region block by block: parse EncodeHeader → AES-CBC decrypt with the
//! block's KeyMap key → validate the inner DecompressHeader → LZMA2
//! decompress → append. The concatenation is SHA-256 verified before
//! anything is written; a failed file never leaves partial output.
//!
//! Files at or above [`SEGMENT_THRESHOLD`] decompressed bytes are split
//! across workers by [`segment`]; block order is preserved by concatenating
//! segment outputs in segment order.
//!
//! Everything the workers share is read-only: the bulk region, the KeyMap
//! table and the entry list. The only shared mutable state is the per-file
//! progress counter behind its mutex.

pub mod segment;

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::{self, AesError};
use crate::decode::{DecodeError, DecompressHeader, EncodeHeader, DECOMPRESS_HEADER_SIZE, ENCODE_HEADER_SIZE};
use crate::index::FileEntry;
use crate::keys::{self, KeyError};
use crate::lzma::{Lzma2Decoder, LzmaError};
use crate::progress::{FileProgress, ProgressSink};

pub use segment::{segment_count, Segment, SEGMENT_THRESHOLD};

/// Default worker count: `min(NumCPU, 4)`.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()).min(4)
}

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Aes(#[from] AesError),
    #[error("{0}")]
    Lzma(#[from] LzmaError),
    #[error("{0}")]
    Key(#[from] KeyError),
    #[error("block extends past the bulk region: need {need} bytes, have {have}")]
    Bounds { need: u64, have: u64 },
    #[error("decompressed {got} bytes, header declares {declared}")]
    SizeMismatch { declared: u64, got: u64 },
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("block at offset {offset}: {source}")]
    Block { offset: u64, source: BlockError },
    #[error("sha-256 mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },
    #[error("output name escapes the output directory: {0:?}")]
    UnsafePath(String),
    #[error("aborted")]
    Aborted,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one stage-2 run. Failed files are reported by name; the
/// scheduler never aborts remaining tasks on a per-file error.
#[derive(Debug, Default)]
pub struct Stage2Summary {
    pub written: Vec<String>,
    pub failures: Vec<(String, TaskError)>,
}

impl Stage2Summary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Parse and decrypt the block whose EncodeHeader sits at `offset`.
///
/// Returns the offset of the next block and the decrypted plaintext
/// (DecompressHeader + LZMA2 stream).
pub fn decrypt_block(
    region6: &[u8],
    offset: u64,
    key: &[u8; 32],
) -> Result<(u64, Vec<u8>), BlockError> {
    let have = region6.len() as u64;
    let ct_start = offset
        .checked_add(ENCODE_HEADER_SIZE as u64)
        .filter(|&e| e <= have)
        .ok_or(BlockError::Bounds {
            need: offset.saturating_add(ENCODE_HEADER_SIZE as u64),
            have,
        })?;
    let header = EncodeHeader::parse(&region6[offset as usize..])?;

    let ct_end = ct_start
        .checked_add(header.original_size)
        .filter(|&e| e <= have)
        .ok_or(BlockError::Bounds {
            need: ct_start.saturating_add(header.original_size),
            have,
        })?;

    let ct = &region6[ct_start as usize..ct_end as usize];
    let pt = crypto::decrypt_cbc(ct, key, header.aes_iv())?;
    Ok((ct_end, pt))
}

/// Stage-2 execution context. Borrows the read-only bulk region and KeyMap
/// table; workers share these immutably.
pub struct Stage2<'a, L: Lzma2Decoder> {
    region6: &'a [u8],
    keymap: &'a [u8],
    lzma: L,
    sink: Arc<dyn ProgressSink>,
    abort: Arc<AtomicBool>,
}

impl<'a, L: Lzma2Decoder> Stage2<'a, L> {
    pub fn new(
        region6: &'a [u8],
        keymap: &'a [u8],
        lzma: L,
        sink: Arc<dyn ProgressSink>,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self { region6, keymap, lzma, sink, abort }
    }

    /// Execute all file tasks on a bounded pool of `workers` threads and
    /// report per-file outcomes. Entry order does not constrain completion
    /// order; output files are independent.
    pub fn run(&self, entries: &[FileEntry], output_dir: &Path, workers: usize) -> Stage2Summary {
        let results = self.run_tasks(entries, output_dir, workers.max(1));

        let mut summary = Stage2Summary::default();
        for (name, result) in results {
            match result {
                Ok(()) => summary.written.push(name),
                Err(e) => summary.failures.push((name, e)),
            }
        }
        summary
    }

    #[cfg(feature = "parallel")]
    fn run_tasks(
        &self,
        entries: &[FileEntry],
        output_dir: &Path,
        workers: usize,
    ) -> Vec<(String, Result<(), TaskError>)> {
        use rayon::prelude::*;

        // Segment workers run in the same pool as file tasks; observed
        // parallelism within one large file can exceed the file-level bound.
        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.install(|| {
                entries
                    .par_iter()
                    .map(|e| (e.name.clone(), self.process_entry(e, output_dir)))
                    .collect()
            }),
            Err(_) => entries
                .iter()
                .map(|e| (e.name.clone(), self.process_entry(e, output_dir)))
                .collect(),
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn run_tasks(
        &self,
        entries: &[FileEntry],
        output_dir: &Path,
        _workers: usize,
    ) -> Vec<(String, Result<(), TaskError>)> {
        entries
            .iter()
            .map(|e| (e.name.clone(), self.process_entry(e, output_dir)))
            .collect()
    }

    fn process_entry(&self, entry: &FileEntry, output_dir: &Path) -> Result<(), TaskError> {
        if self.abort.load(Ordering::Relaxed) {
            return Err(TaskError::Aborted);
        }
        let path = safe_output_path(output_dir, &entry.name)?;
        let progress = FileProgress::new(&entry.name, entry.partition_length, self.sink.clone());

        let segments = segment_count(entry.partition_length);
        let image = if segments <= 1 {
            self.process_sequential(entry, &progress)?
        } else {
            self.process_segmented(entry, segments, &progress)?
        };

        let got = hex::encode(Sha256::digest(&image));
        if !got.eq_ignore_ascii_case(&entry.file_sha256) {
            return Err(TaskError::HashMismatch {
                expected: entry.file_sha256.to_ascii_lowercase(),
                got,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &image)?;
        Ok(())
    }

    /// Decrypt + decompress one block, returning the next block offset and
    /// the decompressed chunk.
    fn decode_chunk(&self, offset: u64, key_index: u64) -> Result<(u64, Vec<u8>), TaskError> {
        let wrap = |source: BlockError| TaskError::Block { offset, source };

        let key = keys::extract_key(self.keymap, key_index).map_err(|e| wrap(e.into()))?;
        let (next, pt) = decrypt_block(self.region6, offset, &key).map_err(wrap)?;

        let inner = DecompressHeader::parse(&pt).map_err(|e| wrap(e.into()))?;
        let chunk = self
            .lzma
            .decompress(&pt[DECOMPRESS_HEADER_SIZE..])
            .map_err(|e| wrap(e.into()))?;
        if chunk.len() as u64 != inner.processed_size {
            return Err(wrap(BlockError::SizeMismatch {
                declared: inner.processed_size,
                got: chunk.len() as u64,
            }));
        }
        Ok((next, chunk))
    }

    /// Sequential path: every block of the file, in order, on one worker.
    pub fn process_sequential(
        &self,
        entry: &FileEntry,
        progress: &FileProgress,
    ) -> Result<Vec<u8>, TaskError> {
        let end = entry.offset.saturating_add(entry.length);
        let mut acc = Vec::with_capacity(entry.partition_length as usize);
        let mut cur = entry.offset;
        let mut k = 0u64;

        while cur < end {
            if self.abort.load(Ordering::Relaxed) {
                return Err(TaskError::Aborted);
            }
            let (next, chunk) = self.decode_chunk(cur, entry.key_index + k)?;
            progress.add(chunk.len() as u64);
            acc.extend_from_slice(&chunk);
            cur = next;
            k += 1;
        }
        Ok(acc)
    }

    /// Decode one segment's run of blocks into its own buffer.
    pub fn run_segment(
        &self,
        entry: &FileEntry,
        seg: &Segment,
        progress: &FileProgress,
    ) -> Result<Vec<u8>, TaskError> {
        let mut acc = Vec::new();
        let mut cur = seg.start_offset;

        for j in 0..seg.num_blocks {
            if self.abort.load(Ordering::Relaxed) {
                return Err(TaskError::Aborted);
            }
            let key_index = entry.key_index + (seg.start_block_index + j) as u64;
            let (next, chunk) = self.decode_chunk(cur, key_index)?;
            progress.add(chunk.len() as u64);
            acc.extend_from_slice(&chunk);
            cur = next;
        }
        Ok(acc)
    }

    /// The segmented path: boundary scan, partition into `want` segments,
    /// decode them concurrently, concatenate in segment order.
    pub fn process_segmented(
        &self,
        entry: &FileEntry,
        want: usize,
        progress: &FileProgress,
    ) -> Result<Vec<u8>, TaskError> {
        let boundaries = segment::scan_boundaries(self.region6, entry);
        if boundaries.is_empty() {
            // Nothing parseable up front; the sequential loop surfaces the
            // real block error with its offset.
            return self.process_sequential(entry, progress);
        }
        let segments =
            segment::partition(&boundaries, entry.offset.saturating_add(entry.length), want);

        let outputs = self.run_segments(entry, &segments, progress);

        let mut acc = Vec::with_capacity(entry.partition_length as usize);
        for out in outputs {
            acc.extend_from_slice(&out?);
        }
        Ok(acc)
    }

    #[cfg(feature = "parallel")]
    fn run_segments(
        &self,
        entry: &FileEntry,
        segments: &[Segment],
        progress: &FileProgress,
    ) -> Vec<Result<Vec<u8>, TaskError>> {
        use rayon::prelude::*;
        segments
            .par_iter()
            .map(|seg| self.run_segment(entry, seg, progress))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn run_segments(
        &self,
        entry: &FileEntry,
        segments: &[Segment],
        progress: &FileProgress,
    ) -> Vec<Result<Vec<u8>, TaskError>> {
        segments
            .iter()
            .map(|seg| self.run_segment(entry, seg, progress))
            .collect()
    }
}

/// Resolve an entry name under the output directory.
///
/// Relative separators are allowed (parents are created later); absolute
/// paths and `..` components are rejected.
fn safe_output_path(output_dir: &Path, name: &str) -> Result<PathBuf, TaskError> {
    let rel = Path::new(name);
    let mut out = output_dir.to_path_buf();
    let mut pushed = false;
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => {
                out.push(c);
                pushed = true;
            }
            Component::CurDir => {}
            _ => return Err(TaskError::UnsafePath(name.to_owned())),
        }
    }
    if !pushed {
        return Err(TaskError::UnsafePath(name.to_owned()));
    }
    Ok(out)
}
