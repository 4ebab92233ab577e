//! # ntpi — NTPI firmware container extractor
//!
//! Format facts the implementation relies on:
//! - All numeric fields are little-endian; magics are ASCII `"NTPI"` and
//!   `"NTENCODE"`
//! - The container is a singly linked region chain starting inside the
//!   48-byte FileHeader; termination is in-band (bulk region, or a next
//!   header of size 0)
//! - Metadata regions (types 1..=5) are AES-CBC encrypted with per-version
//!   registry keys and PKCS#7 padded; unknown versions fall back to the
//!   default key set with a warning, never to cryptanalysis
//! - Bulk blocks (region type 6) each carry a 112-byte EncodeHeader; the
//!   ciphertext decrypts to a 112-byte DecompressHeader plus a raw LZMA2
//!   stream; block *k* of a file uses KeyMap index `key_index + k`
//! - A file's decompressed concatenation must match its declared SHA-256;
//!   on mismatch nothing is written for that file
//! - Extraction is two-stage: envelope → scratch directory → block engine;
//!   stage-2 file tasks are independent and run on a bounded worker pool

pub mod archive;
pub mod crypto;
pub mod decode;
pub mod engine;
pub mod envelope;
pub mod index;
pub mod keys;
pub mod lzma;
pub mod progress;

// Flat re-exports for the most common types.
pub use archive::{ExtractOptions, ExtractSummary, NtpiArchive, NtpiError};
pub use decode::{
    DecodeError, DecompressHeader, EncodeHeader, FileHeader, RegionBlockHeader, RegionHeader,
};
pub use engine::{decrypt_block, Stage2, Stage2Summary, TaskError, SEGMENT_THRESHOLD};
pub use envelope::{EnvelopeError, EnvelopeReport, RegionType, RegionWalk, WalkStep};
pub use index::{parse_file_index, FileEntry, IndexError};
pub use keys::{extract_key, lookup, AesKeySet, KeyError};
pub use lzma::{DefaultDecoder, Lzma2Decoder, LzmaError, NativeDecoder};
pub use progress::{NullSink, ProgressSink};
