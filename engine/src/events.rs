//! Event reporting trait.
//!
//! `BackupEvents` decouples the engine from whatever is driving it (CLI,
//! GUI, automation). A worker borrows one receiver for the whole run and
//! calls it synchronously from the worker thread; implementations that
//! need to cross threads should forward into a channel.
//!
//! All methods have empty default bodies so a receiver only implements
//! what it cares about.

use std::path::Path;

/// Receiver for the totally-ordered event stream of one backup run.
pub trait BackupEvents: Send {
    // Task-scoped.

    /// Cumulative progress; `bytes_done` is monotonic within a run.
    fn on_progress_updated(&self, _bytes_done: u64, _bytes_total: u64) {}

    /// Sliding-window average throughput in bytes per second.
    fn on_speed_updated(&self, _bytes_per_sec: f64) {}

    /// Estimated seconds left, or -1 when the speed is too low to tell.
    fn on_eta_updated(&self, _seconds_left: i64) {}

    /// Human-readable phase label ("scanning", "copying", ...).
    fn on_state_changed(&self, _state: &str) {}

    /// End of run. `ok` is false if any file failed or the run was
    /// cancelled; `summary` is "cancelled" for a cancelled run.
    fn on_finished(&self, _ok: bool, _summary: &str) {}

    // File-scoped.

    fn on_file_started(&self, _rel: &str, _size: u64) {}

    fn on_file_finished(&self, _rel: &str, _ok: bool, _err: &str) {}

    // Vault-scoped.

    /// An existing destination payload was archived before overwrite.
    fn on_version_created(&self, _rel: &str, _payload: &Path, _sidecar: &Path) {}

    /// A payload no longer present in the source was tombstoned.
    fn on_deleted_stashed(&self, _rel: &str, _payload: &Path, _sidecar: &Path) {}

    // Device-scoped. Offline/online strictly alternate per run.

    fn on_device_offline(&self, _phase: &str) {}

    fn on_device_online(&self) {}
}

/// Receiver that discards everything.
pub struct NullEvents;

impl BackupEvents for NullEvents {}
