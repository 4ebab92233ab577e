//! Fixed-layout header parsers — every structure in the container.
//!
//! # On-disk layouts (all fields little-endian)
//!
//! ```text
//! FileHeader (48 bytes, offset 0)
//! Offset  Size  Field
//!    0      4   magic          = "NTPI" (4 ASCII bytes)
//!    4      4   padding
//!    8      8   version_major  (LE u64)
//!   16      8   version_minor  (LE u64)
//!   24      8   version_patch  (LE u64)
//!   32     16   first_region   inline RegionHeader
//!
//! RegionHeader (16 bytes)
//!    0      8   region_type    1..=5 metadata, 6 bulk  (LE u64)
//!    8      8   region_size    ciphertext bytes that follow  (LE u64)
//!
//! RegionBlockHeader (40 bytes, start of a decrypted metadata region)
//!    0     16   this_header    RegionHeader of this region
//!   16     16   next_header    RegionHeader of the next region in the chain
//!   32      8   real_size      payload bytes after this header, pre-padding
//!
//! EncodeHeader (112 bytes, before every ciphertext block in region 6)
//!    0      8   magic          = "NTENCODE" (8 ASCII bytes)
//!    8      4   primary_type   (LE u32)
//!   12      4   compress_type  (LE u32)
//!   16      4   encrypt_type   (LE u32)
//!   20      4   padding        (LE u32)
//!   24      8   processed_size decompressed byte count  (LE u64)
//!   32      8   original_size  ciphertext bytes that follow  (LE u64)
//!   40     32   key            embedded key, unused (keys come from the KeyMap)
//!   72     32   iv             first 16 bytes are the AES-CBC IV
//!  104      4   size_a         (LE u32)
//!  108      4   size_b         (LE u32)
//!
//! DecompressHeader (112 bytes, start of a decrypted block)
//!    0      8   magic          = "NTENCODE"
//!    8     16   tags           as in EncodeHeader
//!   24      8   processed_size
//!   32      8   original_size
//!   40     72   padding
//! ```
//!
//! EncodeHeader and DecompressHeader share the magic; which one applies is
//! decided by position (outer layer vs post-decrypt inner layer).

use thiserror::Error;

pub const FILE_MAGIC: &[u8; 4] = b"NTPI";
pub const BLOCK_MAGIC: &[u8; 8] = b"NTENCODE";

pub const FILE_HEADER_SIZE: usize = 48;
pub const REGION_HEADER_SIZE: usize = 16;
pub const REGION_BLOCK_HEADER_SIZE: usize = 40;
pub const ENCODE_HEADER_SIZE: usize = 112;
pub const DECOMPRESS_HEADER_SIZE: usize = 112;

/// Region type carried by the bulk payload region.
pub const REGION_TYPE_BULK: u64 = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },
    #[error("bad magic: expected {expected:?}, got {got:?}")]
    BadMagic { expected: String, got: String },
}

fn check_len(buf: &[u8], need: usize) -> Result<(), DecodeError> {
    if buf.len() < need {
        return Err(DecodeError::ShortBuffer { need, have: buf.len() });
    }
    Ok(())
}

fn check_magic(got: &[u8], expected: &[u8]) -> Result<(), DecodeError> {
    if got != expected {
        return Err(DecodeError::BadMagic {
            expected: String::from_utf8_lossy(expected).into_owned(),
            got: String::from_utf8_lossy(got).into_owned(),
        });
    }
    Ok(())
}

#[inline]
fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

// ── FileHeader ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version_major: u64,
    pub version_minor: u64,
    pub version_patch: u64,
    pub first_region: RegionHeader,
}

impl FileHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        check_len(buf, FILE_HEADER_SIZE)?;
        check_magic(&buf[0..4], FILE_MAGIC)?;
        Ok(Self {
            version_major: u64_at(buf, 8),
            version_minor: u64_at(buf, 16),
            version_patch: u64_at(buf, 24),
            first_region: RegionHeader::parse(&buf[32..48])?,
        })
    }

    #[inline]
    pub fn version(&self) -> (u64, u64, u64) {
        (self.version_major, self.version_minor, self.version_patch)
    }
}

// ── RegionHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub region_type: u64,
    pub region_size: u64,
}

impl RegionHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        check_len(buf, REGION_HEADER_SIZE)?;
        Ok(Self {
            region_type: u64_at(buf, 0),
            region_size: u64_at(buf, 8),
        })
    }
}

// ── RegionBlockHeader ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegionBlockHeader {
    pub this_header: RegionHeader,
    pub next_header: RegionHeader,
    pub real_size: u64,
}

impl RegionBlockHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        check_len(buf, REGION_BLOCK_HEADER_SIZE)?;
        Ok(Self {
            this_header: RegionHeader::parse(&buf[0..16])?,
            next_header: RegionHeader::parse(&buf[16..32])?,
            real_size: u64_at(buf, 32),
        })
    }
}

// ── EncodeHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EncodeHeader {
    pub primary_type: u32,
    pub compress_type: u32,
    pub encrypt_type: u32,
    pub processed_size: u64,
    pub original_size: u64,
    /// Embedded key material; unused in practice (keys come from the KeyMap).
    pub key: [u8; 32],
    pub iv: [u8; 32],
    pub size_a: u32,
    pub size_b: u32,
}

impl EncodeHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        check_len(buf, ENCODE_HEADER_SIZE)?;
        check_magic(&buf[0..8], BLOCK_MAGIC)?;
        Ok(Self {
            primary_type: u32_at(buf, 8),
            compress_type: u32_at(buf, 12),
            encrypt_type: u32_at(buf, 16),
            processed_size: u64_at(buf, 24),
            original_size: u64_at(buf, 32),
            key: buf[40..72].try_into().unwrap(),
            iv: buf[72..104].try_into().unwrap(),
            size_a: u32_at(buf, 104),
            size_b: u32_at(buf, 108),
        })
    }

    /// The AES-CBC IV: the first 16 bytes of the 32-byte IV field.
    #[inline]
    pub fn aes_iv(&self) -> &[u8] {
        &self.iv[..16]
    }
}

// ── DecompressHeader ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DecompressHeader {
    pub primary_type: u32,
    pub compress_type: u32,
    pub encrypt_type: u32,
    pub processed_size: u64,
    pub original_size: u64,
}

impl DecompressHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        check_len(buf, DECOMPRESS_HEADER_SIZE)?;
        check_magic(&buf[0..8], BLOCK_MAGIC)?;
        Ok(Self {
            primary_type: u32_at(buf, 8),
            compress_type: u32_at(buf, 12),
            encrypt_type: u32_at(buf, 16),
            processed_size: u64_at(buf, 24),
            original_size: u64_at(buf, 32),
        })
    }
}
