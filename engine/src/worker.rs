//! Backup worker orchestration.
//!
//! One `BackupWorker` executes one full pass for one source→destination
//! pair: scan, total, per-file version→copy→verify, tombstoning of
//! deleted files, retention sweep. It is built to run on a dedicated
//! thread; the controller talks to it through a `WorkerControl` handle
//! (pause/stop flags) and listens on a `BackupEvents` receiver.
//!
//! Device flaps are never failures: every destination-touching step
//! rechecks the gate and falls back into a wait-and-retry loop. Real
//! per-file failures accumulate without stopping the run.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::copy::{self, CopyOutcome, RateWindow, PAUSE_SLICE};
use crate::device::{DeviceGate, DeviceProbe, MountProbe};
use crate::error::EngineError;
use crate::events::BackupEvents;
use crate::fs_ops::{self, IgnoreSet};
use crate::hash;
use crate::model::{FileFailure, Options, RunOutcome};
use crate::speed::SpeedEstimator;
use crate::vault::{self, VaultKind, VaultLayout};

/// Minimum interval between progress/speed/eta emissions.
const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

const VERIFY_BACKOFF_START: Duration = Duration::from_secs(1);
const VERIFY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Cloneable cross-thread control over a running worker.
#[derive(Clone)]
pub struct WorkerControl {
    pause: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl WorkerControl {
    pub fn request_pause(&self, paused: bool) {
        self.pause.store(paused, Ordering::Release);
    }

    /// Request cancellation. Idempotent; the worker notices at its next
    /// suspension point.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

enum Verify {
    Ok,
    Mismatch,
    DeviceLost,
    Cancelled,
}

/// One backup pass for one source→destination pair.
pub struct BackupWorker {
    opt: Options,
    run_id: Uuid,
    layout: VaultLayout,
    ignore: IgnoreSet,
    gate: DeviceGate,
    pause: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl BackupWorker {
    /// Validate options and build a worker over the real filesystem.
    pub fn new(opt: Options) -> Result<BackupWorker, EngineError> {
        Self::with_probe(opt, Box::new(MountProbe))
    }

    /// Same, with a caller-supplied device probe. Controllers use this to
    /// simulate removable media in tests and dry runs.
    pub fn with_probe(
        opt: Options,
        probe: Box<dyn DeviceProbe>,
    ) -> Result<BackupWorker, EngineError> {
        let src_abs = absolutize(&opt.src_dir);
        let dst_abs = absolutize(&opt.dst_dir);

        match fs::metadata(&src_abs) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(EngineError::InvalidPath {
                    path: src_abs,
                    reason: "source must be a directory".to_string(),
                })
            }
            Err(_) => return Err(EngineError::SourceNotFound { path: src_abs }),
        }
        if dst_abs.starts_with(&src_abs) || src_abs.starts_with(&dst_abs) {
            return Err(EngineError::InvalidPath {
                path: dst_abs,
                reason: "source and destination roots must not contain each other".to_string(),
            });
        }

        let ignore = IgnoreSet::new(&opt.ignore_globs)?;
        let ns = derive_namespace(&opt, &src_abs);
        let layout = VaultLayout::new(src_abs, dst_abs.clone(), ns);
        let gate = DeviceGate::new(dst_abs, probe);

        Ok(BackupWorker {
            opt,
            run_id: Uuid::new_v4(),
            layout,
            ignore,
            gate,
            pause: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for `request_pause` / `request_stop` from other threads.
    pub fn control(&self) -> WorkerControl {
        WorkerControl {
            pause: self.pause.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Namespace prefix this worker writes under.
    pub fn namespace(&self) -> &str {
        self.layout.namespace()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn pause_point(&self) {
        while self.pause.load(Ordering::Acquire) && !self.stop.load(Ordering::Acquire) {
            thread::sleep(PAUSE_SLICE);
        }
    }

    fn wait_device(&mut self, phase: &str, events: &dyn BackupEvents) {
        self.gate
            .wait_until_ready_or_stopped(phase, &self.stop, events);
    }

    /// Execute the full pass. Always emits `on_finished` exactly once.
    pub fn run(&mut self, events: &dyn BackupEvents) -> RunOutcome {
        let span = tracing::info_span!(
            "backup_run",
            run_id = %self.run_id,
            ns = %self.layout.namespace()
        );
        let _guard = span.enter();

        self.gate.capture_fingerprint();
        self.wait_device("startup", events);
        if self.stopped() {
            return self.finish_cancelled(events, 0, 0, 0, 0, Vec::new());
        }

        events.on_state_changed("scanning");
        let rels = self.scan();
        let src_set: HashSet<String> = rels.iter().cloned().collect();

        let bytes_total: u64 = rels
            .iter()
            .filter_map(|rel| fs_ops::regular_file_size(&self.layout.src_abs(rel)))
            .sum();
        info!(files = rels.len(), bytes_total, "scan complete");
        events.on_progress_updated(0, bytes_total);

        let mut bytes_done = 0u64;
        let mut files_copied = 0usize;
        let mut files_skipped = 0usize;
        let mut failed: Vec<FileFailure> = Vec::new();
        let mut speed = SpeedEstimator::default();
        let mut ticker = Instant::now();
        let mut rate = RateWindow::new(self.opt.speed_limit_bps);

        events.on_state_changed("copying");

        'files: for rel in &rels {
            if self.stopped() {
                break;
            }
            self.pause_point();
            if self.stopped() {
                break;
            }

            let src_path = self.layout.src_abs(rel);
            let size = match fs_ops::regular_file_size(&src_path) {
                Some(s) => s,
                // Vanished or not a regular file since the scan.
                None => continue,
            };
            events.on_file_started(rel, size);

            self.wait_device("prepare-copy", events);
            if self.stopped() {
                break;
            }

            let dst_path = self.layout.dst_abs(rel);

            if self.opt.keep_versions_on_change && dst_path.exists() {
                if self.fast_equal(&src_path, &dst_path) {
                    bytes_done += size;
                    files_skipped += 1;
                    events.on_file_finished(rel, true, "");
                    tick_progress(&mut speed, &mut ticker, bytes_done, bytes_total, events);
                    continue;
                }

                let mut archived = self.stash_existing_version(rel, &dst_path, events);
                if !self.gate.is_ready() {
                    // Device flapped during versioning: wait, retry once.
                    self.wait_device("versioning", events);
                    if self.stopped() {
                        break;
                    }
                    archived = self.stash_existing_version(rel, &dst_path, events);
                }
                if !archived {
                    // Do not overwrite: the prior contents could not be
                    // preserved on this target.
                    events.on_file_finished(rel, false, "version archive failed");
                    failed.push(FileFailure {
                        rel: rel.clone(),
                        err: "version archive failed".to_string(),
                    });
                    continue;
                }
            }

            loop {
                if self.stopped() {
                    break 'files;
                }
                self.pause_point();
                if self.stopped() {
                    break 'files;
                }

                if !self.gate.is_ready() {
                    self.wait_device("copy", events);
                    if self.stopped() {
                        break 'files;
                    }
                    continue;
                }

                match copy::copy_file(
                    &src_path,
                    &dst_path,
                    &self.gate,
                    &self.pause,
                    &self.stop,
                    &mut rate,
                ) {
                    Ok(CopyOutcome::Completed) => {}
                    Ok(CopyOutcome::Cancelled) => break 'files,
                    Ok(CopyOutcome::DeviceLost) => {
                        self.wait_device("copy retry", events);
                        if self.stopped() {
                            break 'files;
                        }
                        continue;
                    }
                    Err(e) => {
                        if !self.gate.is_ready() {
                            // The error was the device going away; the
                            // .part is gone, so a retry is clean.
                            self.wait_device("copy retry", events);
                            if self.stopped() {
                                break 'files;
                            }
                            continue;
                        }
                        warn!(rel = %rel, error = %e, "copy failed");
                        events.on_file_finished(rel, false, "copy failed");
                        failed.push(FileFailure {
                            rel: rel.clone(),
                            err: "copy failed".to_string(),
                        });
                        break;
                    }
                }

                if self.opt.verify_after_write {
                    events.on_state_changed(&format!("verifying {}", rel));
                    match self.verify_file(&src_path, &dst_path) {
                        Verify::Ok => {}
                        Verify::Cancelled => break 'files,
                        Verify::DeviceLost => {
                            self.wait_device("verify retry", events);
                            if self.stopped() {
                                break 'files;
                            }
                            // Safest is to copy again from scratch.
                            continue;
                        }
                        Verify::Mismatch => {
                            if !self.gate.is_ready() {
                                self.wait_device("verify retry", events);
                                if self.stopped() {
                                    break 'files;
                                }
                                continue;
                            }
                            warn!(rel = %rel, "verification failed");
                            events.on_file_finished(rel, false, "verify failed");
                            failed.push(FileFailure {
                                rel: rel.clone(),
                                err: "verify failed".to_string(),
                            });
                            break;
                        }
                    }
                }

                bytes_done += size;
                files_copied += 1;
                events.on_file_finished(rel, true, "");
                break;
            }

            tick_progress(&mut speed, &mut ticker, bytes_done, bytes_total, events);
        }

        if self.stopped() {
            return self.finish_cancelled(
                events,
                bytes_total,
                bytes_done,
                files_copied,
                files_skipped,
                failed,
            );
        }

        if self.opt.keep_deleted_in_vault {
            self.wait_device("deletions", events);
            if !self.stopped() {
                self.handle_deletions(&src_set, events);
            }
        }

        if !self.stopped() && self.opt.retention_days > 0 {
            self.wait_device("retention", events);
            if !self.stopped() {
                self.sweep_retention();
            }
        }

        if self.stopped() {
            return self.finish_cancelled(
                events,
                bytes_total,
                bytes_done,
                files_copied,
                files_skipped,
                failed,
            );
        }

        events.on_progress_updated(bytes_total, bytes_total);
        let ok = failed.is_empty();
        let summary = if ok { "done" } else { "some files failed" };
        events.on_finished(ok, summary);
        info!(ok, files_copied, files_skipped, failed = failed.len(), "run finished");

        RunOutcome {
            run_id: self.run_id,
            ok,
            summary: summary.to_string(),
            bytes_total,
            bytes_done,
            files_copied,
            files_skipped,
            failed,
            cancelled: false,
        }
    }

    fn finish_cancelled(
        &self,
        events: &dyn BackupEvents,
        bytes_total: u64,
        bytes_done: u64,
        files_copied: usize,
        files_skipped: usize,
        failed: Vec<FileFailure>,
    ) -> RunOutcome {
        info!("run cancelled");
        events.on_finished(false, "cancelled");
        RunOutcome {
            run_id: self.run_id,
            ok: false,
            summary: "cancelled".to_string(),
            bytes_total,
            bytes_done,
            files_copied,
            files_skipped,
            failed,
            cancelled: true,
        }
    }

    /// Build the relative path set: whitelist verbatim when present,
    /// else a full scan; normalized, ignore-filtered, empties dropped.
    fn scan(&self) -> Vec<String> {
        let raw = if self.opt.files_whitelist.is_empty() {
            fs_ops::list_relative_files(self.layout.src_root())
        } else {
            self.opt.files_whitelist.clone()
        };
        raw.iter()
            .map(|r| fs_ops::clean_rel(r))
            .filter(|r| !self.ignore.matches(r))
            .collect()
    }

    /// Stat screen plus hash confirmation that source and destination
    /// are byte-identical.
    fn fast_equal(&self, src: &Path, dst: &Path) -> bool {
        if !fs_ops::likely_same_by_stat(src, dst) {
            return false;
        }
        let a = hash::sha256_file(src);
        let b = hash::sha256_file(dst);
        hash::digests_match(&a, &b)
    }

    /// Move the existing destination payload into the version vault.
    ///
    /// Returns false only for a real archive failure on a ready device
    /// (space, permissions); an offline device returns true so the outer
    /// loop can wait and retry the whole step.
    fn stash_existing_version(
        &self,
        rel: &str,
        dst_path: &Path,
        events: &dyn BackupEvents,
    ) -> bool {
        if !self.gate.is_ready() {
            return true;
        }
        let ts = vault::ts_now();
        let out = self.layout.version_path(rel, &ts);
        if fs_ops::ensure_parent_dir(&out).is_err() {
            return false;
        }
        if !self.gate.is_ready() {
            return true;
        }
        match fs_ops::move_file_robust(dst_path, &out) {
            Ok(()) => {
                let sidecar = match self
                    .layout
                    .write_sidecar(VaultKind::Version, rel, &ts, &out)
                {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(rel = %rel, error = %e, "version sidecar write failed");
                        VaultLayout::sidecar_path(&out)
                    }
                };
                debug!(rel = %rel, payload = %out.display(), "archived prior version");
                events.on_version_created(rel, &out, &sidecar);
                true
            }
            Err(e) => {
                warn!(rel = %rel, error = %e, "version archive failed");
                false
            }
        }
    }

    /// Hash source and destination; on mismatch, re-hash the destination
    /// with exponential backoff on a ready device.
    fn verify_file(&self, src: &Path, dst: &Path) -> Verify {
        if !self.gate.is_ready() {
            return Verify::DeviceLost;
        }
        let want = hash::sha256_file(src);
        let mut got = hash::sha256_file(dst);
        if hash::digests_match(&want, &got) {
            return Verify::Ok;
        }

        let mut delay = VERIFY_BACKOFF_START;
        for _ in 0..self.opt.max_retries {
            if !self.sleep_unless_stopped(delay) {
                return Verify::Cancelled;
            }
            if !self.gate.is_ready() {
                return Verify::DeviceLost;
            }
            got = hash::sha256_file(dst);
            if hash::digests_match(&want, &got) {
                return Verify::Ok;
            }
            delay = (delay * 2).min(VERIFY_BACKOFF_CAP);
        }
        Verify::Mismatch
    }

    /// Sleep in short slices; false if a stop request interrupted.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stopped() {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            thread::sleep(PAUSE_SLICE.min(left));
        }
    }

    /// Tombstone destination payloads whose relative path is absent from
    /// the current source set.
    fn handle_deletions(&mut self, src_set: &HashSet<String>, events: &dyn BackupEvents) {
        let ns_root = self.layout.ns_root();
        if !ns_root.is_dir() {
            return;
        }
        for rel in fs_ops::list_relative_files(&ns_root) {
            if self.stopped() {
                return;
            }
            // The vault lives outside the namespace subtree; this guards
            // against a namespace that shadows it.
            if rel.starts_with(vault::META_DIR_NAME) {
                continue;
            }
            if src_set.contains(&rel) {
                continue;
            }

            if !self.gate.is_ready() {
                self.wait_device("deletions", events);
                if self.stopped() {
                    return;
                }
            }

            let ts = vault::ts_now();
            let out = self.layout.deleted_path(&rel, &ts);
            if fs_ops::ensure_parent_dir(&out).is_err() {
                continue;
            }
            let abs = ns_root.join(&rel);
            match fs_ops::move_file_robust(&abs, &out) {
                Ok(()) => {
                    let sidecar = match self
                        .layout
                        .write_sidecar(VaultKind::Deleted, &rel, &ts, &out)
                    {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(rel = %rel, error = %e, "tombstone sidecar write failed");
                            VaultLayout::sidecar_path(&out)
                        }
                    };
                    debug!(rel = %rel, payload = %out.display(), "stashed deleted file");
                    events.on_deleted_stashed(&rel, &out, &sidecar);
                }
                Err(e) => {
                    warn!(rel = %rel, error = %e, "failed to stash deleted file");
                }
            }
        }
    }

    /// Remove vault payloads (and their sidecars) older than the
    /// retention window. Names that do not parse as vault timestamps are
    /// left untouched; they may belong to a different tool.
    fn sweep_retention(&mut self) {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.opt.retention_days));
        for (kind, root) in [
            (VaultKind::Version, self.layout.versions_root()),
            (VaultKind::Deleted, self.layout.deleted_root()),
        ] {
            if !root.is_dir() {
                continue;
            }
            for rel in fs_ops::list_relative_files(&root) {
                if self.stopped() {
                    return;
                }
                if rel.ends_with(".json") {
                    continue;
                }
                let name = rel.rsplit('/').next().unwrap_or(&rel);
                let ts = match vault::entry_timestamp(name, kind) {
                    Some(ts) => ts,
                    None => continue,
                };
                if ts < cutoff {
                    let payload = root.join(&rel);
                    debug!(payload = %payload.display(), "reaping expired vault entry");
                    let _ = fs::remove_file(&payload);
                    let _ = fs::remove_file(VaultLayout::sidecar_path(&payload));
                }
            }
        }
    }
}

fn tick_progress(
    speed: &mut SpeedEstimator,
    ticker: &mut Instant,
    bytes_done: u64,
    bytes_total: u64,
    events: &dyn BackupEvents,
) {
    speed.on_progress(bytes_done);
    if ticker.elapsed() >= PROGRESS_THROTTLE {
        let bps = speed.avg_bytes_per_sec();
        events.on_speed_updated(bps);
        let remain = bytes_total.saturating_sub(bytes_done);
        let eta = if bps > 1.0 {
            (remain as f64 / bps) as i64
        } else {
            -1
        };
        events.on_eta_updated(eta);
        events.on_progress_updated(bytes_done, bytes_total);
        *ticker = Instant::now();
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn derive_namespace(opt: &Options, src_abs: &Path) -> String {
    if let Some(ns) = &opt.ns_name {
        if !ns.is_empty() {
            return ns.clone();
        }
    }
    let name = src_abs
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    format!(
        "{}_{}",
        complete_base_name(&name),
        hash::short_hash(&src_abs.to_string_lossy())
    )
}

/// Directory name up to its last dot: `My.Photos` becomes `My`. A name
/// whose only dot is the leading one is kept whole.
fn complete_base_name(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}
