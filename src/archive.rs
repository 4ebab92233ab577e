//! High-level [`NtpiArchive`] API — the primary embedding surface.
//!
//! ```no_run
//! use ntpi::archive::{ExtractOptions, NtpiArchive};
//! use ntpi::progress::NullSink;
//! use std::sync::Arc;
//!
//! let ar = NtpiArchive::open("firmware.ntpi")?;
//! let summary = ar.extract(&ExtractOptions::for_output("firmware_extracted"), Arc::new(NullSink))?;
//! assert!(summary.is_success());
//! # Ok::<(), ntpi::NtpiError>(())
//! ```

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;

use crate::decode::{DecodeError, FileHeader};
use crate::engine::{self, Stage2, Stage2Summary};
use crate::envelope::{self, EnvelopeError, RegionType, RegionWalk, WalkStep, REGION6_FILE};
use crate::index::{parse_file_index, FileEntry, IndexError};
use crate::keys;
use crate::lzma::DefaultDecoder;
use crate::progress::ProgressSink;

/// Scratch directory name, created under the output directory.
pub const SCRATCH_DIR: &str = ".temp";

/// Manifests copied from the scratch directory into the output directory
/// once all file tasks have run.
const MANIFESTS: [&str; 2] = ["Patch.xml", "RawProgram.xml"];

#[derive(Error, Debug)]
pub enum NtpiError {
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Envelope(#[from] EnvelopeError),
    #[error("FileIndex: {0}")]
    Index(#[from] IndexError),
    #[error("FileIndex is not UTF-8")]
    IndexNotUtf8,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for [`NtpiArchive::extract`].
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub output_dir: PathBuf,
    /// File-task worker count; defaults to `min(NumCPU, 4)`.
    pub workers: usize,
    /// Keep the scratch directory after a successful run.
    pub keep_scratch: bool,
}

impl ExtractOptions {
    pub fn for_output<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_owned(),
            workers: engine::default_workers(),
            keep_scratch: false,
        }
    }
}

/// Result of a full two-stage extraction.
#[derive(Debug)]
pub struct ExtractSummary {
    pub version: (u64, u64, u64),
    /// The container declared an unknown version and the default key set
    /// was used; hosts should surface this as a warning.
    pub used_default_keys: bool,
    pub written: Vec<String>,
    pub failures: Vec<(String, engine::TaskError)>,
}

impl ExtractSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A memory-mapped NTPI container.
pub struct NtpiArchive {
    path: PathBuf,
    mmap: Mmap,
    header: FileHeader,
}

impl NtpiArchive {
    /// Map the archive and validate its FileHeader.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NtpiError> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path)?;
        // Safety: mapped read-only and never mutated through this mapping.
        let mmap = unsafe { Mmap::map(&file)? };
        let header = FileHeader::parse(&mmap)?;
        Ok(Self { path, mmap, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> (u64, u64, u64) {
        self.header.version()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Walk the region chain without touching the file system, returning
    /// `(region_type, offset, size)` per region in chain order.
    pub fn regions(&self) -> Result<Vec<(u64, u64, u64)>, NtpiError> {
        let (keys, _) = keys::lookup(self.header.version());
        let mut out = Vec::new();
        for step in RegionWalk::new(self.bytes(), &self.header, keys) {
            match step? {
                WalkStep::Metadata { region_type, offset, size, .. } => {
                    out.push((region_type as u64, offset, size));
                }
                WalkStep::Bulk { offset, size } => out.push((6, offset, size)),
            }
        }
        Ok(out)
    }

    /// Decrypt the FileIndex region in memory and parse its entries,
    /// without extracting anything.
    pub fn file_entries(&self) -> Result<Vec<FileEntry>, NtpiError> {
        let (keys, _) = keys::lookup(self.header.version());
        for step in RegionWalk::new(self.bytes(), &self.header, keys) {
            if let WalkStep::Metadata { region_type: RegionType::FileIndex, payload, .. } = step? {
                let xml = std::str::from_utf8(&payload).map_err(|_| NtpiError::IndexNotUtf8)?;
                return Ok(parse_file_index(xml)?);
            }
        }
        Ok(Vec::new())
    }

    /// Run both stages: materialise the envelope into the scratch directory,
    /// then decode every partition image into the output directory.
    ///
    /// The scratch directory is removed only after a fully successful run
    /// (and only without `keep_scratch`); any failure leaves it behind for
    /// diagnosis.
    pub fn extract(
        &self,
        opts: &ExtractOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<ExtractSummary, NtpiError> {
        let scratch = opts.output_dir.join(SCRATCH_DIR);
        fs::create_dir_all(&opts.output_dir)?;

        let report = envelope::unpack(self.bytes(), &scratch)?;
        let summary = run_stage2(&scratch, &opts.output_dir, opts.workers, sink)?;

        if summary.is_success() && !opts.keep_scratch {
            fs::remove_dir_all(&scratch)?;
        }

        Ok(ExtractSummary {
            version: report.version,
            used_default_keys: report.used_default_keys,
            written: summary.written,
            failures: summary.failures,
        })
    }
}

/// Stage 2 over an existing scratch directory.
///
/// Reads `FileIndex.xml` and `KeyMap.bin`, maps `region6block.bin`, decodes
/// every entry, then moves the Patch and RawProgram manifests into the
/// output directory.
pub fn run_stage2(
    scratch: &Path,
    output_dir: &Path,
    workers: usize,
    sink: Arc<dyn ProgressSink>,
) -> Result<Stage2Summary, NtpiError> {
    let index_xml = fs::read_to_string(scratch.join(RegionType::FileIndex.file_name()))?;
    let entries = parse_file_index(&index_xml)?;

    let summary = if entries.is_empty() {
        Stage2Summary::default()
    } else {
        let keymap = fs::read(scratch.join(RegionType::KeyMap.file_name()))?;
        let region6_file = File::open(scratch.join(REGION6_FILE))?;
        // Zero-length files cannot be mapped; an empty slice serves the same.
        let mapped;
        let region6: &[u8] = if region6_file.metadata()?.len() == 0 {
            &[]
        } else {
            // Safety: mapped read-only and never mutated through this mapping.
            mapped = unsafe { Mmap::map(&region6_file)? };
            &mapped
        };

        let stage2 = Stage2::new(
            region6,
            &keymap,
            DefaultDecoder::default(),
            sink,
            Arc::new(AtomicBool::new(false)),
        );
        stage2.run(&entries, output_dir, workers)
    };

    for manifest in MANIFESTS {
        let from = scratch.join(manifest);
        if from.exists() {
            move_file(&from, &output_dir.join(manifest))?;
        }
    }

    Ok(summary)
}

// Rename, falling back to copy+remove for cross-device scratch layouts.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
