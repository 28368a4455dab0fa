//! Error types for the backup engine.
//!
//! `EngineError` covers run-level problems: bad options, unusable paths,
//! and filesystem operations that the engine cannot work around. Per-file
//! failures are not errors at this level; they travel as strings on the
//! event stream (`on_file_finished`) and only flip the run's ok flag.

use std::error::Error;
use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;

/// Errors that can prevent a run from starting or a vault operation from
/// completing.
#[derive(Debug)]
pub enum EngineError {
    /// Source directory does not exist
    SourceNotFound { path: PathBuf },

    /// Source or destination path is unusable (not a directory, nested
    /// inside the other root, ...)
    InvalidPath { path: PathBuf, reason: String },

    /// An ignore pattern did not parse as a glob
    InvalidGlob { pattern: String, reason: String },

    /// Failed to read from a source or vault file
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to a destination or vault file
    WriteError { path: PathBuf, source: io::Error },

    /// Atomic replacement of the destination failed
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Neither rename nor copy+delete could move a file into the vault
    MoveFailed { from: PathBuf, to: PathBuf },

    /// Failed to create a directory
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// A metadata sidecar could not be written or parsed
    SidecarFailed { path: PathBuf, reason: String },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceNotFound { path } => {
                write!(f, "Source directory not found: {}", path.display())
            }
            Self::InvalidPath { path, reason } => {
                write!(f, "Invalid path: {} ({})", path.display(), reason)
            }
            Self::InvalidGlob { pattern, reason } => {
                write!(f, "Invalid ignore pattern '{}': {}", pattern, reason)
            }
            Self::ReadError { path, .. } => {
                write!(f, "Failed to read file: {}", path.display())
            }
            Self::WriteError { path, .. } => {
                write!(f, "Failed to write file: {}", path.display())
            }
            Self::RenameFailed { from, to, .. } => {
                write!(f, "Failed to rename {} -> {}", from.display(), to.display())
            }
            Self::MoveFailed { from, to } => {
                write!(f, "Failed to move {} -> {}", from.display(), to.display())
            }
            Self::DirectoryCreationFailed { path, .. } => {
                write!(f, "Failed to create directory: {}", path.display())
            }
            Self::SidecarFailed { path, reason } => {
                write!(f, "Sidecar error at {}: {}", path.display(), reason)
            }
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::RenameFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
