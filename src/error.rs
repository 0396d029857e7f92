//! Error types for duscan
//!
//! This module defines the error hierarchy for the scanner, the two
//! persistence formats, and configuration handling.
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Transient per-entry failures (stat/open/readdir) are NOT errors: they
//!   are recorded in the tree as read-error bits or special entries and
//!   never bubble out of the scanner
//! - Everything defined here is fatal and unwinds to process exit

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the duscan application
#[derive(Error, Debug)]
pub enum Error {
    /// Scan setup errors (the root path, worker spawn)
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Binary container errors
    #[error("Binary format error: {0}")]
    Format(#[from] FormatError),

    /// JSON import errors
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors on export streams
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal during an export
    #[error("Operation interrupted")]
    Interrupted,
}

/// Errors that abort a scan before or as it starts
///
/// Per-entry failures during the walk never produce these; they become
/// read-error entries in the output instead.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The scan root could not be stat'ed
    #[error("Cannot access '{path}': {source}")]
    RootStat {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The scan root is not a directory
    #[error("Not a directory: '{path}'")]
    NotADirectory { path: PathBuf },

    /// The scan root directory could not be opened
    #[error("Cannot open directory '{path}': {source}")]
    RootOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The sink builder thread died
    #[error("Sink thread terminated unexpectedly")]
    SinkClosed,
}

/// Binary container corruption and write failures
///
/// Read-side errors carry the last successfully parsed itemref so the
/// offending region of the file can be located.
#[derive(Error, Debug)]
pub enum FormatError {
    /// The file does not start with the container signature
    #[error("Not a duscan binary export (bad signature)")]
    BadSignature,

    /// A block header declared an unknown kind
    #[error("Invalid block kind {kind} (last itemref {last_ref:#x})")]
    BadBlockKind { kind: u8, last_ref: u64 },

    /// An itemref or block bound points outside the file
    #[error("Reference out of bounds: {detail} (last itemref {last_ref:#x})")]
    OutOfBounds { detail: String, last_ref: u64 },

    /// Block decompression failed or produced an oversized result
    #[error("Block {block} failed to decompress: {detail} (last itemref {last_ref:#x})")]
    BadBlock {
        block: u32,
        detail: String,
        last_ref: u64,
    },

    /// A known map key held a value of the wrong type
    #[error("Ill-typed value for key {key} (last itemref {last_ref:#x})")]
    BadValue { key: u64, last_ref: u64 },

    /// Malformed CBOR item
    #[error("Malformed entry encoding: {detail} (last itemref {last_ref:#x})")]
    BadEncoding { detail: String, last_ref: u64 },

    /// The file offset limit of the container was exceeded while writing
    #[error("Export exceeds the container offset limit (2^40 bytes)")]
    OffsetOverflow,

    /// Write or read I/O failure on the container file
    #[error("Container I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON import errors
#[derive(Error, Debug)]
pub enum ImportError {
    /// Syntax or structural error in the JSON document
    #[error("Invalid JSON at line {line}, column {col}: {msg}")]
    Json { line: u64, col: u64, msg: String },

    /// The document is valid JSON but not a duscan export
    #[error("Not a duscan JSON export: {0}")]
    NotAnExport(String),

    /// Binary import was requested from a non-seekable stream
    #[error("Binary import requires a seekable file, not a stream")]
    NotSeekable,

    /// I/O failure while reading the import source
    #[error("Import I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid thread count {count}: must be between 1 and {max}")]
    InvalidThreadCount { count: usize, max: usize },

    /// Invalid compression level
    #[error("Invalid compression level {level}: must be between 1 and 20")]
    InvalidCompressLevel { level: u32 },

    /// Invalid export block size
    #[error("Invalid export block size {kib} KiB: must be between {min} and {max}")]
    InvalidBlockSize { kib: u32, min: u32, max: u32 },

    /// An exclude pattern failed to compile
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },

    /// An exclude file could not be read
    #[error("Cannot read exclude file '{path}': {source}")]
    ExcludeFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Conflicting or missing arguments
    #[error("{0}")]
    Usage(String),
}

/// Result type alias for the top-level error
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for binary container operations
pub type FormatResult<T> = std::result::Result<T, FormatError>;
