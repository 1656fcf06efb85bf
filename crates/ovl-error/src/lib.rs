#![forbid(unsafe_code)]
//! Error types for the overlay checker.
//!
//! # Error Taxonomy
//!
//! The checker separates three layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ovl-types` | Byte-level format violations inside one record |
//! | Findings | `Finding` | `ovl-fsck` | Corruption discovered in the overlay; collected, never thrown |
//! | Fatal | `FsckError` | `ovl-error` (this crate) | Environment failures that end the run |
//!
//! A `ParseError` never escapes the overlay reader: it is normalized into a
//! corrupt record and later surfaces as a finding. `FsckError` is reserved
//! for conditions where no partial progress is meaningful: the overlay root is
//! missing, the checkout lock is held, the repair directory cannot be created,
//! or an I/O error unrelated to expected corruption occurs.
//!
//! ## CLI exit codes
//!
//! | Variant | Exit code |
//! |---------|-----------|
//! | `Locked` | 1 (skipped) |
//! | everything else | 4 (operational error) |

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a run that was skipped because the checkout was in use.
pub const EXIT_SKIPPED: i32 = 1;
/// Exit code for a run aborted by an operational error.
pub const EXIT_OPERATIONAL: i32 = 4;

/// Fatal, process-level error for the overlay checker.
#[derive(Debug, Error)]
pub enum FsckError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The overlay root directory does not exist.
    #[error("overlay directory not found: {}", .0.display())]
    OverlayNotFound(PathBuf),

    /// The overlay root path exists but is not a directory.
    #[error("overlay path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// Another process holds the checkout lock.
    #[error("checkout is in use: could not acquire lock {}", .0.display())]
    Locked(PathBuf),

    /// The timestamped repair directory could not be created.
    #[error("failed to create fsck repair directory under {}: {detail}", .base.display())]
    LogDirectory { base: PathBuf, detail: String },

    /// `fix_errors` was called without a completed scan.
    #[error("repair requested before the overlay was scanned")]
    NotScanned,

    /// A value could not be encoded into the on-disk format.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// A repair step failed in a way that leaves nothing to fall back to.
    #[error("repair failed: {0}")]
    RepairFailed(String),
}

impl FsckError {
    /// Process exit code for the CLI.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Locked(_) => EXIT_SKIPPED,
            Self::Io(_)
            | Self::OverlayNotFound(_)
            | Self::NotADirectory(_)
            | Self::LogDirectory { .. }
            | Self::NotScanned
            | Self::Format(_)
            | Self::RepairFailed(_) => EXIT_OPERATIONAL,
        }
    }
}

/// Result alias using `FsckError`.
pub type Result<T> = std::result::Result<T, FsckError>;
