//! Error taxonomy for backup recreation
//!
//! Each enum covers one failure domain. Only `SetupError` ever aborts a run;
//! the others are caught per entry (or per flush), logged and counted.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed or unexpected keyed-archive shape
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("binary plist could not be parsed: {0}")]
    Plist(#[from] plist::Error),

    #[error("not a keyed archive: {0}")]
    NotKeyedArchive(String),

    #[error("object index {index} is outside the object table ({len} objects)")]
    ObjectIndexOutOfRange { index: u64, len: usize },

    #[error("resolution exceeded the maximum depth of {0}")]
    DepthLimitExceeded(usize),

    #[error("resolution produced more than {0} values")]
    ResolutionBudgetExceeded(usize),

    #[error("unexpected archive shape: {0}")]
    UnexpectedShape(String),
}

/// Failure to recreate a single entry in the output tree
#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("identifier {0:?} is too short to locate a content-store shard")]
    InvalidIdentifier(String),

    #[error("source blob {} does not exist", .0.display())]
    MissingSource(PathBuf),

    #[error("could not create directory {}: {source}", path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not copy {} to {}: {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to persist the metadata index
#[derive(Debug, Error)]
pub enum IndexWriteError {
    #[error("could not open metadata index at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("could not create metadata schema: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("batch of {rows} rows could not be written: {source}")]
    Flush {
        rows: usize,
        #[source]
        source: rusqlite::Error,
    },
}

/// Failure reading the manifest index source
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not open manifest database {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("manifest query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Fatal errors raised before any entry is processed
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not create destination {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("required descriptor {} is missing", .0.display())]
    MissingDescriptor(PathBuf),

    #[error("could not read descriptor {}: {source}", path.display())]
    Descriptor {
        path: PathBuf,
        #[source]
        source: plist::Error,
    },

    #[error("backup is encrypted; decrypt it before recreating")]
    Encrypted,

    #[error("only a legacy Manifest.mbdb was found; convert it to Manifest.db first")]
    LegacyManifest,

    #[error("no manifest index found in {}", .0.display())]
    MissingManifest(PathBuf),

    #[error("could not start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Index(#[from] IndexWriteError),
}
