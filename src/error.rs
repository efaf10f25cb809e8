//! Error types.
//!
//! Request-level failures are returned as `Err`; per-item restoration failures
//! are values collected into [`crate::restore::RestorationResult`] so that a
//! run never discards partial success.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by an [`crate::store::ArchiveStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed ledger line {line} in {path}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("no active archive entry for {0}")]
    NotFound(PathBuf),

    #[error("{0} already has an active archive entry")]
    DuplicateActive(PathBuf),

    #[error("archive store unavailable: {0}")]
    Unavailable(String),
}

/// Failures loading the command catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read command catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse command catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid command catalog: {0}")]
    Invalid(String),
}

/// Failures that stop a single validation section.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Failures loading `.script-archive.json`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid exclude glob '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Structurally invalid restoration or archiving requests.
///
/// These fail the whole call. Anything that concerns a single entry is an
/// [`ItemFailure`] or a [`crate::restore::SkipReason`] instead.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("ambiguous restore criteria: select by exactly one of {}", .0.join(", "))]
    AmbiguousCriteria(Vec<&'static str>),

    #[error("no restore criteria given: select by archive id, category, date range or path")]
    MissingCriteria,

    #[error("invalid date range '{0}': expected YYYY-MM-DD..YYYY-MM-DD")]
    InvalidDateRange(String),

    #[error("no active archive entries match {0}")]
    NoMatches(String),

    #[error("restoration requires confirmation: pass the plan's confirmation token or force")]
    ConfirmationRequired,

    #[error("{0} is not a file")]
    NotAFile(PathBuf),

    #[error("filesystem error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a single planned restoration did not commit.
#[derive(Debug, Error)]
pub enum ItemFailure {
    #[error("failed to restore file: {0}")]
    Filesystem(#[source] std::io::Error),

    /// The ledger write failed after the file was put back in place.
    ///
    /// When `rolled_back` is false the restored copy could not be removed and
    /// the tree disagrees with the ledger until someone reconciles it.
    #[error("ledger update failed ({}): {source}", rollback_note(.rolled_back))]
    StoreUpdate {
        #[source]
        source: StoreError,
        rolled_back: bool,
    },

    #[error("run deadline exceeded before this item was attempted")]
    DeadlineExceeded,
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "file move rolled back"
    } else {
        "ROLLBACK FAILED, reconcile manually"
    }
}
