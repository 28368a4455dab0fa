//! Destination device gate.
//!
//! Removable destinations can vanish at any instant: unplugged, remounted
//! read-only, or replaced by a different disk under the same mount point.
//! The gate answers "may I touch the destination right now?" and pins the
//! identity of the volume that was first observed, so the engine never
//! writes into a stranger's filesystem that happens to occupy the same
//! path.
//!
//! Every write-path operation rechecks `is_ready` immediately before
//! acting; longer stalls go through `wait_until_ready_or_stopped`, which
//! sleeps in short slices so a cancel request is honored within ~200 ms.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::events::BackupEvents;

/// Polling slice while the destination is offline.
pub const WAIT_SLICE: Duration = Duration::from_millis(200);

/// Opaque identity of the volume mounted behind a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint(pub(crate) u64);

/// How the engine observes the destination volume.
///
/// `probe` returns the fingerprint of a present, writable volume, or
/// `None` when the path is missing, not a directory, or read-only.
pub trait DeviceProbe: Send + Sync {
    fn probe(&self, dst: &Path) -> Option<DeviceFingerprint>;
}

/// Probe backed by filesystem metadata. Present means the destination
/// root is a writable directory; identity is the device id of the
/// filesystem it lives on (a stable proxy for the volume on unix).
pub struct MountProbe;

impl DeviceProbe for MountProbe {
    fn probe(&self, dst: &Path) -> Option<DeviceFingerprint> {
        let meta = fs::metadata(dst).ok()?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return None;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Some(DeviceFingerprint(meta.dev()))
        }
        #[cfg(not(unix))]
        {
            Some(DeviceFingerprint(0))
        }
    }
}

/// Gate over one destination root for the duration of a run.
pub struct DeviceGate {
    dst: PathBuf,
    probe: Box<dyn DeviceProbe>,
    expected: Option<DeviceFingerprint>,
    offline_signaled: bool,
}

impl DeviceGate {
    pub fn new(dst: impl Into<PathBuf>, probe: Box<dyn DeviceProbe>) -> Self {
        DeviceGate {
            dst: dst.into(),
            probe,
            expected: None,
            offline_signaled: false,
        }
    }

    /// Pin the current volume identity if the destination is ready and
    /// no identity is pinned yet. Called at run start and again on the
    /// first recovery, so an initially-offline destination is defined by
    /// its first successful appearance.
    pub fn capture_fingerprint(&mut self) {
        if self.expected.is_none() {
            if let Some(fp) = self.probe.probe(&self.dst) {
                debug!(dst = %self.dst.display(), "captured device fingerprint");
                self.expected = Some(fp);
            }
        }
    }

    /// The destination is present, writable, and still the pinned volume.
    pub fn is_ready(&self) -> bool {
        match self.probe.probe(&self.dst) {
            Some(fp) => match &self.expected {
                Some(expected) => *expected == fp,
                None => true,
            },
            None => false,
        }
    }

    /// Block until the gate reopens or `stop` is set.
    ///
    /// Emits `on_device_offline(phase)` once on entering an offline
    /// episode and `on_device_online` once on recovery; the two strictly
    /// alternate across a run.
    pub fn wait_until_ready_or_stopped(
        &mut self,
        phase: &str,
        stop: &AtomicBool,
        events: &dyn BackupEvents,
    ) {
        if stop.load(Ordering::Acquire) {
            return;
        }

        if !self.is_ready() && !self.offline_signaled {
            self.offline_signaled = true;
            warn!(phase, dst = %self.dst.display(), "destination offline, waiting");
            events.on_device_offline(phase);
            events.on_state_changed(&format!("device offline, waiting ({})", phase));
        }

        while !self.is_ready() && !stop.load(Ordering::Acquire) {
            thread::sleep(WAIT_SLICE);
        }

        if self.offline_signaled && self.is_ready() {
            self.offline_signaled = false;
            self.capture_fingerprint();
            debug!(phase, "destination back");
            events.on_device_online();
            events.on_state_changed(&format!("device back, resuming ({})", phase));
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Scriptable probe for simulating flaps and device swaps.
    ///
    /// Readiness can be toggled from another thread via `ready`, or
    /// scripted deterministically as a half-open range of probe calls
    /// that report offline.
    pub(crate) struct FakeProbe {
        pub ready: Arc<AtomicBool>,
        pub device: Arc<AtomicU64>,
        pub calls: Arc<AtomicU64>,
        pub offline_calls: Option<(u64, u64)>,
    }

    impl FakeProbe {
        pub fn always_ready() -> Self {
            FakeProbe {
                ready: Arc::new(AtomicBool::new(true)),
                device: Arc::new(AtomicU64::new(1)),
                calls: Arc::new(AtomicU64::new(0)),
                offline_calls: None,
            }
        }

        /// Offline for probe calls in `[from, to)`, ready otherwise.
        pub fn with_offline_window(from: u64, to: u64) -> Self {
            let mut p = Self::always_ready();
            p.offline_calls = Some((from, to));
            p
        }
    }

    impl DeviceProbe for FakeProbe {
        fn probe(&self, _dst: &Path) -> Option<DeviceFingerprint> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((from, to)) = self.offline_calls {
                if n >= from && n < to {
                    return None;
                }
            }
            if !self.ready.load(Ordering::SeqCst) {
                return None;
            }
            Some(DeviceFingerprint(self.device.load(Ordering::SeqCst)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProbe;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    struct GateRecorder {
        offline: AtomicUsize,
        online: AtomicUsize,
        order: Mutex<Vec<&'static str>>,
    }

    impl GateRecorder {
        fn new() -> Self {
            GateRecorder {
                offline: AtomicUsize::new(0),
                online: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            }
        }
    }

    impl BackupEvents for GateRecorder {
        fn on_device_offline(&self, _phase: &str) {
            self.offline.fetch_add(1, AtomicOrdering::SeqCst);
            self.order.lock().unwrap().push("offline");
        }
        fn on_device_online(&self) {
            self.online.fetch_add(1, AtomicOrdering::SeqCst);
            self.order.lock().unwrap().push("online");
        }
    }

    #[test]
    fn test_ready_tracks_probe() {
        let probe = FakeProbe::always_ready();
        let ready = probe.ready.clone();
        let gate = DeviceGate::new("/dst", Box::new(probe));
        assert!(gate.is_ready());
        ready.store(false, AtomicOrdering::SeqCst);
        assert!(!gate.is_ready());
    }

    #[test]
    fn test_fingerprint_mismatch_closes_gate() {
        let probe = FakeProbe::always_ready();
        let device = probe.device.clone();
        let mut gate = DeviceGate::new("/dst", Box::new(probe));
        gate.capture_fingerprint();
        assert!(gate.is_ready());

        // Another disk shows up at the same mount point.
        device.store(2, AtomicOrdering::SeqCst);
        assert!(!gate.is_ready());

        // The original disk returns.
        device.store(1, AtomicOrdering::SeqCst);
        assert!(gate.is_ready());
    }

    #[test]
    fn test_wait_emits_offline_online_once_per_episode() {
        // Offline for a handful of probe calls, then recovered.
        let probe = FakeProbe::with_offline_window(0, 3);
        let mut gate = DeviceGate::new("/dst", Box::new(probe));
        let stop = AtomicBool::new(false);
        let rec = GateRecorder::new();

        gate.wait_until_ready_or_stopped("copy", &stop, &rec);

        assert_eq!(rec.offline.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(rec.online.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(*rec.order.lock().unwrap(), vec!["offline", "online"]);

        // Already ready: a second wait emits nothing.
        gate.wait_until_ready_or_stopped("copy", &stop, &rec);
        assert_eq!(rec.offline.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(rec.online.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_wait_returns_on_stop_without_online_event() {
        let probe = FakeProbe::always_ready();
        probe.ready.store(false, AtomicOrdering::SeqCst);
        let mut gate = DeviceGate::new("/dst", Box::new(probe));
        let stop = AtomicBool::new(true);
        let rec = GateRecorder::new();

        gate.wait_until_ready_or_stopped("startup", &stop, &rec);
        assert_eq!(rec.offline.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(rec.online.load(AtomicOrdering::SeqCst), 0);
    }
}
