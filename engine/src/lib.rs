//! # plugbackup engine - Removable-media backup library
//!
//! A headless backup engine for mirroring source directory trees onto an
//! external (removable) destination volume. Designed around the reality
//! that the destination can disappear mid-operation: unplugged, remounted
//! read-only, or replaced by a different disk under the same mount point.
//!
//! ## Overview
//!
//! Each source directory gets its own namespace under the destination
//! root, so several sources can share one disk without colliding. The
//! engine:
//! - copies files atomically (`.part` sibling + rename) with streaming
//!   1 MiB chunks and optional write-time verification
//! - archives the prior destination contents into a vault before every
//!   overwrite, and tombstones files deleted from the source
//! - reaps vault entries past a retention window
//! - pins the destination's device identity and pauses whenever the
//!   device goes away, resuming when the same device returns
//! - reports progress, speed and ETA through an event trait, and obeys
//!   pause/stop flags from another thread
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{BackupWorker, NullEvents, Options};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut worker = BackupWorker::new(Options::new("/data/Photos", "/mnt/usb"))?;
//! let control = worker.control(); // request_pause / request_stop from any thread
//! let outcome = worker.run(&NullEvents);
//! println!("ok={} {}", outcome.ok, outcome.summary);
//! # let _ = control;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Options and run outcome types
//! - **error**: Error types and handling
//! - **events**: Event trait connecting the engine to a controller
//! - **device**: Device-identity gate for removable destinations
//! - **vault**: Namespace/vault path layout, sidecars, scan and restore
//! - **hash**: Streaming SHA-256 and namespace fingerprints
//! - **copy**: Atomic one-file copy pipeline with rate limiting
//! - **speed**: Sliding-window throughput estimation
//! - **fs_ops**: Scanning, normalization and low-level file moves
//! - **worker**: Run orchestration (scan, version, copy, verify, reap)

pub mod copy;
pub mod device;
pub mod error;
pub mod events;
pub mod fs_ops;
pub mod hash;
pub mod model;
pub mod speed;
pub mod vault;
pub mod worker;

// Re-export main types and functions
pub use copy::{CopyOutcome, RateWindow};
pub use device::{DeviceFingerprint, DeviceGate, DeviceProbe, MountProbe};
pub use error::EngineError;
pub use events::{BackupEvents, NullEvents};
pub use model::{split_patterns, FileFailure, Options, RunOutcome};
pub use speed::SpeedEstimator;
pub use vault::{restore_entry, scan_entries, SidecarMeta, VaultEntry, VaultKind, VaultLayout};
pub use worker::{BackupWorker, WorkerControl};
