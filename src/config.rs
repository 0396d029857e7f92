//! Configuration types for duscan
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation

use clap::Parser;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::patterns::{parse_exclude_lines, PatternSet};
use crate::scan::ScanOptions;

/// Maximum reasonable worker count
const MAX_THREADS: usize = 512;

/// Compression level bounds for zstd output
const MIN_COMPRESS_LEVEL: u32 = 1;
const MAX_COMPRESS_LEVEL: u32 = 20;

/// Binary export block size bounds, KiB
const MIN_BLOCK_KIB: u32 = 4;
const MAX_BLOCK_KIB: u32 = 16000;

/// Parallel disk-usage analyzer with JSON and binary export formats
#[derive(Parser, Debug, Clone)]
#[command(
    name = "duscan",
    version,
    about = "Parallel disk-usage analyzer with JSON and binary export formats",
    long_about = "Walks a directory tree in parallel, aggregating apparent and allocated\n\
                  sizes with hardlink accounting, and reads/writes scan results in a\n\
                  JSON format and a compact random-access binary format.",
    after_help = "EXAMPLES:\n    \
        duscan /var                    # scan and print a summary\n    \
        duscan -O var.bin /var         # scan into a binary export\n    \
        duscan -o - /var | gzip        # JSON export to stdout\n    \
        duscan -f var.bin -o var.json  # convert binary to JSON\n    \
        duscan -e -x --exclude '*.log' -t 8 /var"
)]
pub struct CliArgs {
    /// Directory to scan (defaults to the current directory)
    #[arg(value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Import scan data from a previous export ('-' reads stdin)
    #[arg(short = 'f', value_name = "FILE", conflicts_with = "dir")]
    pub import: Option<PathBuf>,

    /// Export the result as JSON ('-' writes to stdout)
    #[arg(short = 'o', value_name = "FILE")]
    pub export_json: Option<PathBuf>,

    /// Export the result as a binary container ('-' writes to stdout)
    #[arg(short = 'O', value_name = "FILE")]
    pub export_binary: Option<PathBuf>,

    /// Collect extended information (mtime, uid, gid, mode)
    #[arg(short = 'e', long = "extended")]
    pub extended: bool,

    /// Stay on the same filesystem as the scan root
    #[arg(short = 'x', long = "one-file-system")]
    pub same_fs: bool,

    /// Follow symlinks to files
    #[arg(short = 'L', long = "follow-symlinks")]
    pub follow_symlinks: bool,

    /// Exclude entries matching PATTERN (can be repeated)
    #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub exclude: Vec<String>,

    /// Read exclude patterns from FILE, one per line (can be repeated)
    #[arg(short = 'X', long = "exclude-from", value_name = "FILE", action = clap::ArgAction::Append)]
    pub exclude_from: Vec<PathBuf>,

    /// Exclude directories tagged with CACHEDIR.TAG
    #[arg(long = "exclude-caches")]
    pub exclude_caches: bool,

    /// Exclude Linux pseudo-filesystem mounts (procfs, sysfs, ...)
    #[arg(long = "exclude-kernfs")]
    pub exclude_kernfs: bool,

    /// Number of scan threads
    #[arg(short = 't', long = "threads", default_value_t = default_threads(), value_name = "NUM")]
    pub threads: usize,

    /// Compress the JSON export with zstd
    #[arg(short = 'c', long = "compress")]
    pub compress: bool,

    /// Zstd compression level for compressed exports
    #[arg(long = "compress-level", default_value = "3", value_name = "NUM")]
    pub compress_level: u32,

    /// Uncompressed block size for the binary export, in KiB
    #[arg(long = "export-block-size", default_value = "64", value_name = "KIB")]
    pub export_block_size: u32,

    /// Quiet mode, suppress the progress display
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

fn default_threads() -> usize {
    num_cpus::get()
}

/// What the invocation reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Scan a directory.
    Scan(PathBuf),
    /// Import an export file; `None` is standard input.
    Import(Option<PathBuf>),
}

/// An export destination; `None` is standard output.
pub type OutPath = Option<PathBuf>;

/// Validated runtime configuration.
#[derive(Debug)]
pub struct Config {
    /// Where entries come from.
    pub source: Source,
    /// Scanner options (threads, flags, patterns).
    pub scan: ScanOptions,
    /// JSON export destination, when requested.
    pub json_out: Option<OutPath>,
    /// Binary export destination, when requested.
    pub binary_out: Option<OutPath>,
    /// Zstd level for the JSON export, when `-c` is given.
    pub json_compress: Option<i32>,
    /// Zstd level for binary blocks.
    pub compress_level: i32,
    /// Binary block size in bytes.
    pub block_size: usize,
    /// Show the progress spinner.
    pub show_progress: bool,
    /// Verbose logging.
    pub verbose: bool,
}

impl Config {
    /// Validate CLI arguments into a runtime configuration.
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        if args.threads == 0 || args.threads > MAX_THREADS {
            return Err(ConfigError::InvalidThreadCount {
                count: args.threads,
                max: MAX_THREADS,
            });
        }
        if !(MIN_COMPRESS_LEVEL..=MAX_COMPRESS_LEVEL).contains(&args.compress_level) {
            return Err(ConfigError::InvalidCompressLevel {
                level: args.compress_level,
            });
        }
        if !(MIN_BLOCK_KIB..=MAX_BLOCK_KIB).contains(&args.export_block_size) {
            return Err(ConfigError::InvalidBlockSize {
                kib: args.export_block_size,
                min: MIN_BLOCK_KIB,
                max: MAX_BLOCK_KIB,
            });
        }

        // CLI patterns exclude unconditionally; exclude files may carry
        // file-only rules.
        let mut rules: Vec<(String, bool)> =
            args.exclude.iter().map(|p| (p.clone(), false)).collect();
        for path in &args.exclude_from {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ExcludeFile {
                path: path.clone(),
                source: e,
            })?;
            rules.extend(parse_exclude_lines(&text));
        }
        let patterns = PatternSet::build(rules.iter().map(|(p, f)| (p.as_str(), *f)))?;

        let source = match &args.import {
            Some(p) => Source::Import(dash_to_none(p)),
            None => Source::Scan(args.dir.clone().unwrap_or_else(|| PathBuf::from("."))),
        };

        let json_out = args.export_json.as_ref().map(|p| dash_to_none(p));
        let binary_out = args.export_binary.as_ref().map(|p| dash_to_none(p));
        if let (Some(None), Some(None)) = (&json_out, &binary_out) {
            return Err(ConfigError::Usage(
                "only one export can write to standard output".into(),
            ));
        }

        // A progress spinner would corrupt an export on stdout.
        let stdout_export = matches!(json_out, Some(None)) || matches!(binary_out, Some(None));
        Ok(Self {
            scan: ScanOptions {
                threads: args.threads,
                same_fs: args.same_fs,
                follow_symlinks: args.follow_symlinks,
                exclude_caches: args.exclude_caches,
                exclude_kernfs: args.exclude_kernfs,
                extended: args.extended,
                patterns,
            },
            source,
            json_out,
            binary_out,
            json_compress: args.compress.then_some(args.compress_level as i32),
            compress_level: args.compress_level as i32,
            block_size: args.export_block_size as usize * 1024,
            show_progress: !args.quiet && !stdout_export,
            verbose: args.verbose,
        })
    }
}

fn dash_to_none(p: &std::path::Path) -> Option<PathBuf> {
    if p.as_os_str() == "-" {
        None
    } else {
        Some(p.to_path_buf())
    }
}
