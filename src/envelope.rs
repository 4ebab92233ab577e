//! Envelope parsing — stage 1 of the extraction pipeline.
//!
//! The container is a singly linked chain of regions. The FileHeader at
//! offset 0 carries the first RegionHeader inline; every decrypted metadata
//! region starts with a RegionBlockHeader naming the next link. The chain
//! terminates in-band: either a bulk region (type 6, stored encrypted-opaque
//! for stage 2) or a next header with `region_size == 0`.
//!
//! [`RegionWalk`] is the chain as an iterator — one step per region, no
//! back-references, no cycles. [`unpack`] drives it and materialises every
//! region into the scratch directory.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::crypto::{self, AesError};
use crate::decode::{
    DecodeError, FileHeader, RegionBlockHeader, RegionHeader, FILE_HEADER_SIZE,
    REGION_BLOCK_HEADER_SIZE, REGION_TYPE_BULK,
};
use crate::keys::{self, AesKeySet};

/// File name of the bulk region blob inside the scratch directory.
pub const REGION6_FILE: &str = "region6block.bin";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("file header: {0}")]
    Header(#[from] DecodeError),
    #[error("region type {region_type} at offset {offset}: {kind}")]
    Region { region_type: u64, offset: u64, kind: RegionErrorKind },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum RegionErrorKind {
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Aes(#[from] AesError),
    #[error("region extends past the archive: need {need} bytes, have {have}")]
    Bounds { need: u64, have: u64 },
    #[error("unknown metadata region type")]
    UnknownType,
    #[error("declared payload size {real_size} exceeds decrypted region ({len} bytes)")]
    PayloadOverrun { real_size: u64, len: usize },
}

/// Metadata region types and their on-disk artefact names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum RegionType {
    Metadata = 1,
    Patch = 2,
    RawProgram = 3,
    KeyMap = 4,
    FileIndex = 5,
}

impl RegionType {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            1 => Some(RegionType::Metadata),
            2 => Some(RegionType::Patch),
            3 => Some(RegionType::RawProgram),
            4 => Some(RegionType::KeyMap),
            5 => Some(RegionType::FileIndex),
            _ => None,
        }
    }

    /// Scratch-directory file name for this region's payload.
    pub fn file_name(self) -> &'static str {
        match self {
            RegionType::Metadata => "Metadata.xml",
            RegionType::Patch => "Patch.xml",
            RegionType::RawProgram => "RawProgram.xml",
            RegionType::KeyMap => "KeyMap.bin",
            RegionType::FileIndex => "FileIndex.xml",
        }
    }
}

/// One step of the region chain.
#[derive(Debug)]
pub enum WalkStep {
    /// A decrypted metadata region (types 1..=5). `size` is the ciphertext
    /// length the region occupies on disk.
    Metadata { region_type: RegionType, offset: u64, size: u64, payload: Vec<u8> },
    /// The bulk region; terminates the walk. `size` may be zero.
    Bulk { offset: u64, size: u64 },
}

/// Iterator over the region chain of one archive.
pub struct RegionWalk<'a> {
    archive: &'a [u8],
    keys: &'a AesKeySet,
    pending: Option<(RegionHeader, u64)>,
}

impl<'a> RegionWalk<'a> {
    /// Start a walk from a parsed FileHeader. The first region's ciphertext
    /// begins right after the header, at offset 48.
    pub fn new(archive: &'a [u8], header: &FileHeader, keys: &'a AesKeySet) -> Self {
        Self {
            archive,
            keys,
            pending: Some((header.first_region, FILE_HEADER_SIZE as u64)),
        }
    }

    fn step(&mut self, region: RegionHeader, offset: u64) -> Result<WalkStep, EnvelopeError> {
        let fail = |kind: RegionErrorKind| EnvelopeError::Region {
            region_type: region.region_type,
            offset,
            kind,
        };

        let end = offset
            .checked_add(region.region_size)
            .filter(|&e| e <= self.archive.len() as u64)
            .ok_or_else(|| {
                fail(RegionErrorKind::Bounds {
                    need: offset.saturating_add(region.region_size),
                    have: self.archive.len() as u64,
                })
            })?;

        if region.region_type == REGION_TYPE_BULK {
            return Ok(WalkStep::Bulk { offset, size: region.region_size });
        }

        let region_type = RegionType::from_u64(region.region_type)
            .ok_or_else(|| fail(RegionErrorKind::UnknownType))?;
        // Metadata region types always resolve in any key set.
        let rk = self
            .keys
            .region(region.region_type)
            .ok_or_else(|| fail(RegionErrorKind::UnknownType))?;

        let ct = &self.archive[offset as usize..end as usize];
        let decrypted =
            crypto::decrypt_cbc(ct, &rk.key, &rk.iv).map_err(|e| fail(e.into()))?;

        let rbh = RegionBlockHeader::parse(&decrypted).map_err(|e| fail(e.into()))?;
        let payload_end = REGION_BLOCK_HEADER_SIZE as u64 + rbh.real_size;
        if payload_end > decrypted.len() as u64 {
            return Err(fail(RegionErrorKind::PayloadOverrun {
                real_size: rbh.real_size,
                len: decrypted.len(),
            }));
        }
        let payload =
            decrypted[REGION_BLOCK_HEADER_SIZE..payload_end as usize].to_vec();

        if rbh.next_header.region_size > 0 {
            self.pending = Some((rbh.next_header, offset + region.region_size));
        }

        Ok(WalkStep::Metadata { region_type, offset, size: region.region_size, payload })
    }
}

impl Iterator for RegionWalk<'_> {
    type Item = Result<WalkStep, EnvelopeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (region, offset) = self.pending.take()?;
        Some(self.step(region, offset))
    }
}

/// Summary of a completed stage-1 run.
#[derive(Debug)]
pub struct EnvelopeReport {
    pub version: (u64, u64, u64),
    /// The declared version was unknown and the default key set was used.
    pub used_default_keys: bool,
    /// `(region_type, offset, ciphertext_size)` per visited region, in chain
    /// order; the bulk region, when present, is last.
    pub regions: Vec<(u64, u64, u64)>,
    pub bulk_written: bool,
}

/// Run stage 1: walk the chain and materialise every region into `scratch`.
///
/// Metadata payloads land as `Metadata.xml`, `Patch.xml`, `RawProgram.xml`,
/// `KeyMap.bin`, `FileIndex.xml`; the bulk slice is written raw as
/// `region6block.bin`. Any error aborts the walk with the failing region's
/// type and offset.
pub fn unpack(archive: &[u8], scratch: &Path) -> Result<EnvelopeReport, EnvelopeError> {
    let header = FileHeader::parse(archive)?;
    let (keys, used_default_keys) = keys::lookup(header.version());

    fs::create_dir_all(scratch)?;

    let mut report = EnvelopeReport {
        version: header.version(),
        used_default_keys,
        regions: Vec::new(),
        bulk_written: false,
    };

    for step in RegionWalk::new(archive, &header, keys) {
        match step? {
            WalkStep::Metadata { region_type, offset, size, payload } => {
                report.regions.push((region_type as u64, offset, size));
                fs::write(scratch.join(region_type.file_name()), &payload)?;
            }
            WalkStep::Bulk { offset, size } => {
                report.regions.push((REGION_TYPE_BULK, offset, size));
                fs::write(
                    scratch.join(REGION6_FILE),
                    &archive[offset as usize..(offset + size) as usize],
                )?;
                report.bulk_written = true;
            }
        }
    }

    Ok(report)
}
