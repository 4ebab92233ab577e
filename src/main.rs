use clap::{Parser, Subcommand};
use ntpi::archive::{ExtractOptions, NtpiArchive};
use ntpi::engine::default_workers;
use ntpi::progress::{NullSink, ProgressSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ntpi", version, about = "NTPI firmware container extractor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract partition images and manifests from a .ntpi container
    Extract {
        input: PathBuf,
        /// Output directory (default: <basename>_extracted next to the input)
        #[arg(short = 'C', long)]
        output_dir: Option<PathBuf>,
        /// File-task worker count (default: min(NumCPU, 4))
        #[arg(short, long)]
        workers: Option<usize>,
        /// Keep the .temp scratch directory after a successful run
        #[arg(long)]
        keep_temp: bool,
        /// Suppress per-file progress lines
        #[arg(short, long)]
        quiet: bool,
    },
    /// List the file index without extracting
    List {
        input: PathBuf,
    },
    /// Show container header and region summary
    Info {
        input: PathBuf,
    },
}

struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn update(&self, name: &str, bytes_expected: u64, bytes_done: u64) {
        let pct = if bytes_expected == 0 {
            100.0
        } else {
            bytes_done as f64 / bytes_expected as f64 * 100.0
        };
        println!("  {name:<24} {bytes_done:>12} / {bytes_expected:>12} B  ({pct:5.1}%)");
    }
}

fn main() {
    if let Err(code) = run() {
        std::process::exit(code);
    }
}

fn run() -> Result<(), i32> {
    match Cli::parse().command {
        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, workers, keep_temp, quiet } => {
            let ar = NtpiArchive::open(&input).map_err(fatal)?;

            let opts = ExtractOptions {
                output_dir: output_dir.unwrap_or_else(|| default_output_dir(&input)),
                workers: workers.unwrap_or_else(default_workers),
                keep_scratch: keep_temp,
            };
            let sink: Arc<dyn ProgressSink> =
                if quiet { Arc::new(NullSink) } else { Arc::new(ConsoleSink) };

            let summary = ar.extract(&opts, sink).map_err(fatal)?;

            if summary.used_default_keys {
                let (maj, min, pat) = summary.version;
                eprintln!(
                    "warning: container version {maj}.{min}.{pat} is not in the supported set; \
                     used the default key set"
                );
            }
            for name in &summary.written {
                println!("  extracted  {name}");
            }
            for (name, err) in &summary.failures {
                eprintln!("error: {name}: {err}");
            }
            println!(
                "Done: {} file(s) → {}",
                summary.written.len(),
                opts.output_dir.display()
            );

            if !summary.is_success() {
                return Err(1);
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let ar = NtpiArchive::open(&input).map_err(fatal)?;
            let entries = ar.file_entries().map_err(fatal)?;
            println!("Archive: {}", input.display());
            println!("{:<24} {:>14} {:>14} {:>9}  Sha256", "Name", "Size", "Stored", "KeyIndex");
            for e in &entries {
                println!(
                    "{:<24} {:>14} {:>14} {:>9}  {}",
                    e.name,
                    e.partition_length,
                    e.length,
                    e.key_index,
                    &e.file_sha256[..e.file_sha256.len().min(12)],
                );
            }
            println!("{} file(s)", entries.len());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let ar = NtpiArchive::open(&input).map_err(fatal)?;
            let (maj, min, pat) = ar.version();
            let (_, used_default) = ntpi::keys::lookup(ar.version());
            let file_size = ar.bytes().len();

            println!("── NTPI container ──────────────────────────────────────");
            println!("  Path        {}", input.display());
            println!("  File size   {} B ({:.2} MiB)", file_size, file_size as f64 / 1048576.0);
            println!("  Version     {maj}.{min}.{pat}");
            println!("  Key set     {}", if used_default { "default (unsupported version)" } else { "exact match" });
            println!("  Regions:");
            for (region_type, offset, size) in ar.regions().map_err(fatal)? {
                let name = match region_type {
                    1 => "Metadata",
                    2 => "Patch",
                    3 => "RawProgram",
                    4 => "KeyMap",
                    5 => "FileIndex",
                    6 => "Bulk",
                    _ => "?",
                };
                println!("    type {region_type} ({name:<10}) @ {offset:>10}  {size:>12} B");
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn default_output_dir(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    input.with_file_name(format!("{stem}_extracted"))
}

fn fatal<E: std::fmt::Display>(err: E) -> i32 {
    eprintln!("error: {err}");
    1
}
