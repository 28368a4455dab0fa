//! One-file atomic copy pipeline.
//!
//! The destination is written as a sibling `<dst>.part` and renamed into
//! place after a full flush, so readers of the destination path only
//! ever see the prior contents or the complete new contents. Cancel,
//! pause, device-loss and the rate ceiling are all observed between
//! 1 MiB chunks; no suspension happens mid-chunk.
//!
//! Every failure path removes the `.part` file before returning.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::device::DeviceGate;
use crate::error::EngineError;
use crate::fs_ops;
use crate::hash::CHUNK_SIZE;

/// Polling slice while paused.
pub const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Fixed period of the rate limiter's token window.
const RATE_WINDOW: Duration = Duration::from_millis(100);

/// How a copy ended when no io error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Completed,
    /// Stop was requested between chunks
    Cancelled,
    /// The device gate closed between chunks; the caller waits and retries
    DeviceLost,
}

/// Token bucket with a fixed 100 ms period. When the next chunk would
/// exceed the window's byte budget, the sender sleeps out the remainder
/// of the window instead of spinning.
#[derive(Debug)]
pub struct RateWindow {
    limit_bps: u64,
    window_started: Instant,
    sent_in_window: u64,
}

impl RateWindow {
    /// `limit_bps` of 0 disables throttling.
    pub fn new(limit_bps: u64) -> Self {
        RateWindow {
            limit_bps,
            window_started: Instant::now(),
            sent_in_window: 0,
        }
    }

    /// Byte budget of one window: `(limit × 100) / 1000`.
    pub fn window_budget(&self) -> u64 {
        self.limit_bps * RATE_WINDOW.as_millis() as u64 / 1000
    }

    /// Block until `next_chunk` bytes fit into the current window.
    pub fn throttle(&mut self, next_chunk: u64) {
        if self.limit_bps == 0 {
            return;
        }
        if self.sent_in_window + next_chunk > self.window_budget() {
            let elapsed = self.window_started.elapsed();
            if elapsed < RATE_WINDOW {
                thread::sleep(RATE_WINDOW - elapsed);
            }
            self.window_started = Instant::now();
            self.sent_in_window = 0;
        }
    }

    /// Account bytes actually written in this window.
    pub fn note_sent(&mut self, n: u64) {
        if self.limit_bps > 0 {
            self.sent_in_window += n;
        }
    }
}

/// Sibling temporary used during the copy.
pub fn part_path(dst: &Path) -> PathBuf {
    let mut os = dst.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

/// Copy `src` onto `dst` atomically, honoring cancel/pause/device-loss
/// at chunk boundaries and the byte-rate ceiling in `rate`.
///
/// On success the destination carries the source's modification time
/// (best effort). `Ok(DeviceLost)` and `Ok(Cancelled)` are not errors:
/// the `.part` file has been removed and the destination is untouched.
pub fn copy_file(
    src: &Path,
    dst: &Path,
    gate: &DeviceGate,
    pause: &AtomicBool,
    stop: &AtomicBool,
    rate: &mut RateWindow,
) -> Result<CopyOutcome, EngineError> {
    if !gate.is_ready() {
        return Ok(CopyOutcome::DeviceLost);
    }

    fs_ops::ensure_parent_dir(dst)?;

    let mut reader = File::open(src).map_err(|e| fs_ops::read_err(src, e))?;

    let part = part_path(dst);
    let mut writer = File::create(&part).map_err(|e| fs_ops::write_err(&part, e))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(writer);
                let _ = fs::remove_file(&part);
                return Err(fs_ops::read_err(src, e));
            }
        };

        if stop.load(Ordering::Acquire) {
            drop(writer);
            let _ = fs::remove_file(&part);
            return Ok(CopyOutcome::Cancelled);
        }

        while pause.load(Ordering::Acquire) && !stop.load(Ordering::Acquire) {
            thread::sleep(PAUSE_SLICE);
        }

        if !gate.is_ready() {
            drop(writer);
            let _ = fs::remove_file(&part);
            return Ok(CopyOutcome::DeviceLost);
        }

        rate.throttle(n as u64);

        if let Err(e) = writer.write_all(&buf[..n]) {
            drop(writer);
            let _ = fs::remove_file(&part);
            return Err(fs_ops::write_err(&part, e));
        }
        rate.note_sent(n as u64);
    }

    if let Err(e) = writer.flush() {
        drop(writer);
        let _ = fs::remove_file(&part);
        return Err(fs_ops::write_err(&part, e));
    }
    drop(writer);
    drop(reader);

    // Atomic replacement.
    if dst.exists() {
        let _ = fs::remove_file(dst);
    }
    if let Err(e) = fs::rename(&part, dst) {
        let _ = fs::remove_file(&part);
        return Err(EngineError::RenameFailed {
            from: part,
            to: dst.to_path_buf(),
            source: e,
        });
    }

    fs_ops::mirror_mtime(src, dst);
    debug!(src = %src.display(), dst = %dst.display(), "copied");
    Ok(CopyOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeProbe;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn ready_gate() -> DeviceGate {
        DeviceGate::new("/dst", Box::new(FakeProbe::always_ready()))
    }

    fn flags() -> (AtomicBool, AtomicBool) {
        (AtomicBool::new(false), AtomicBool::new(false))
    }

    #[test]
    fn test_copy_creates_parents_and_matches_content() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("deep").join("nested").join("dst.bin");
        let data: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        fs::write(&src, &data).expect("write src");

        let (pause, stop) = flags();
        let mut rate = RateWindow::new(0);
        let outcome = copy_file(&src, &dst, &ready_gate(), &pause, &stop, &mut rate)
            .expect("copy");

        assert_eq!(outcome, CopyOutcome::Completed);
        assert_eq!(fs::read(&dst).expect("read dst"), data);
        assert!(!part_path(&dst).exists());
    }

    #[test]
    fn test_copy_replaces_existing_destination() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"new contents").expect("write");
        fs::write(&dst, b"old contents").expect("write");

        let (pause, stop) = flags();
        let mut rate = RateWindow::new(0);
        let outcome = copy_file(&src, &dst, &ready_gate(), &pause, &stop, &mut rate)
            .expect("copy");

        assert_eq!(outcome, CopyOutcome::Completed);
        assert_eq!(fs::read(&dst).expect("read"), b"new contents");
        assert!(!part_path(&dst).exists());
    }

    #[test]
    fn test_cancel_removes_part_and_leaves_destination_alone() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, vec![7u8; CHUNK_SIZE / 2]).expect("write");
        fs::write(&dst, b"prior").expect("write");

        let (pause, stop) = flags();
        stop.store(true, AtomicOrdering::SeqCst);
        let mut rate = RateWindow::new(0);
        let outcome = copy_file(&src, &dst, &ready_gate(), &pause, &stop, &mut rate)
            .expect("copy");

        assert_eq!(outcome, CopyOutcome::Cancelled);
        assert!(!part_path(&dst).exists());
        assert_eq!(fs::read(&dst).expect("read"), b"prior");
    }

    #[test]
    fn test_gate_closed_up_front_is_device_lost() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, b"x").expect("write");

        let probe = FakeProbe::always_ready();
        probe.ready.store(false, AtomicOrdering::SeqCst);
        let gate = DeviceGate::new("/dst", Box::new(probe));

        let (pause, stop) = flags();
        let mut rate = RateWindow::new(0);
        let outcome = copy_file(&src, &dst, &gate, &pause, &stop, &mut rate).expect("copy");
        assert_eq!(outcome, CopyOutcome::DeviceLost);
        assert!(!dst.exists());
        assert!(!part_path(&dst).exists());
    }

    #[test]
    fn test_device_loss_mid_copy_cleans_part() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        // Three chunks, so the gate is consulted several times.
        fs::write(&src, vec![3u8; CHUNK_SIZE * 3]).expect("write");

        // Ready for the up-front check, gone from the second probe on.
        let probe = FakeProbe::with_offline_window(1, u64::MAX);
        let gate = DeviceGate::new("/dst", Box::new(probe));

        let (pause, stop) = flags();
        let mut rate = RateWindow::new(0);
        let outcome = copy_file(&src, &dst, &gate, &pause, &stop, &mut rate).expect("copy");

        assert_eq!(outcome, CopyOutcome::DeviceLost);
        assert!(!dst.exists());
        assert!(!part_path(&dst).exists());
    }

    #[test]
    fn test_rate_window_budget_and_reset() {
        let mut rate = RateWindow::new(1000);
        assert_eq!(rate.window_budget(), 100);

        rate.note_sent(90);
        let before = Instant::now();
        rate.throttle(50); // 90 + 50 > 100: sleeps out the window
        assert!(before.elapsed() >= Duration::from_millis(50));
        rate.note_sent(50);

        let mut unlimited = RateWindow::new(0);
        let before = Instant::now();
        unlimited.throttle(u64::MAX);
        assert!(before.elapsed() < Duration::from_millis(20));
    }
}
