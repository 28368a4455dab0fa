//! Core data model for backup runs.
//!
//! - Options: immutable per-run configuration for one source→destination pair
//! - RunOutcome / FileFailure: what a finished run reports back
//!
//! Validation of the options happens when the worker is constructed, not
//! here; this module is plain data.

use std::path::PathBuf;

use uuid::Uuid;

/// Configuration for one backup run.
///
/// Relative paths in `files_whitelist` and glob matches use forward
/// slashes after normalization, regardless of platform.
#[derive(Debug, Clone)]
pub struct Options {
    /// Root of the source tree
    pub src_dir: PathBuf,

    /// Destination root; payloads land under `<dst>/<namespace>/`
    pub dst_dir: PathBuf,

    /// Re-hash source and destination after every copy
    pub verify_after_write: bool,

    /// Verify retries on a ready device, with exponential backoff
    pub max_retries: u32,

    /// Ignore globs, matched against the normalized relative path
    pub ignore_globs: Vec<String>,

    /// Source-relative paths to back up; empty means full scan
    pub files_whitelist: Vec<String>,

    /// Byte-rate ceiling in B/s; 0 means unlimited
    pub speed_limit_bps: u64,

    /// Archive the old destination payload before overwriting it
    pub keep_versions_on_change: bool,

    /// Tombstone destination payloads whose source file is gone
    pub keep_deleted_in_vault: bool,

    /// Reap vault entries older than this many days; 0 disables the sweep
    pub retention_days: u32,

    /// Namespace override; `None` derives `<basename>_<hash8>`
    pub ns_name: Option<String>,
}

impl Options {
    /// Options with the default policy: verify on, 3 retries, versions
    /// and tombstones kept, 7-day retention, no rate limit.
    pub fn new(src_dir: impl Into<PathBuf>, dst_dir: impl Into<PathBuf>) -> Self {
        Options {
            src_dir: src_dir.into(),
            dst_dir: dst_dir.into(),
            verify_after_write: true,
            max_retries: 3,
            ignore_globs: Vec::new(),
            files_whitelist: Vec::new(),
            speed_limit_bps: 0,
            keep_versions_on_change: true,
            keep_deleted_in_vault: true,
            retention_days: 7,
            ns_name: None,
        }
    }
}

/// Split a user-supplied pattern list on semicolons and newlines,
/// dropping empty fragments.
pub fn split_patterns(raw: &str) -> Vec<String> {
    raw.split(|c| c == ';' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// One failed file within an otherwise continuing run.
#[derive(Debug, Clone)]
pub struct FileFailure {
    /// Normalized source-relative path
    pub rel: String,
    /// Failure reason as reported on `on_file_finished`
    pub err: String,
}

/// Result of a completed (or cancelled) run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Identifies this run in logs
    pub run_id: Uuid,

    /// True when no file failed and the run was not cancelled
    pub ok: bool,

    /// Matches the `on_finished` summary string
    pub summary: String,

    /// Total bytes planned after filtering
    pub bytes_total: u64,

    /// Bytes accounted for, including files skipped as identical
    pub bytes_done: u64,

    /// Files actually copied
    pub files_copied: usize,

    /// Files skipped because source and destination were identical
    pub files_skipped: usize,

    /// Per-file failures in scan order
    pub failed: Vec<FileFailure>,

    /// True when the run stopped on a cancel request
    pub cancelled: bool,
}
