//! plugbackup - Command-line controller for the backup engine.
//!
//! Drives one backup run per invocation: argument parsing, a worker
//! thread, and progress reporting to stderr. Also exposes the vault:
//! `--scan-vault` lists archived versions and tombstones, `--restore`
//! copies one entry back over its original source path.

use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use clap::Parser;
use crossbeam_channel::{unbounded, Sender};
use engine::{
    split_patterns, BackupEvents, BackupWorker, Options, RunOutcome, SidecarMeta, VaultKind,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// plugbackup - mirror directories onto removable media
#[derive(Parser, Debug)]
#[command(name = "plugbackup")]
#[command(version = "0.3.0")]
#[command(about = "Back up directories onto a removable volume, keeping versions and tombstones")]
struct Args {
    /// Source directory
    #[arg(long, value_name = "PATH")]
    src: Option<PathBuf>,

    /// Destination root (mount point of the backup volume)
    #[arg(long, value_name = "PATH")]
    dst: Option<PathBuf>,

    /// Skip hash verification after each copy
    #[arg(long)]
    no_verify: bool,

    /// Verify retries on a ready device
    #[arg(long, value_name = "N", default_value_t = 3)]
    retries: u32,

    /// Ignore globs, separated by ';' or newlines
    #[arg(long, value_name = "GLOBS")]
    ignore: Option<String>,

    /// Back up only this source-relative path (repeatable)
    #[arg(long = "file", value_name = "REL")]
    files: Vec<String>,

    /// Speed limit in bytes per second (0 = unlimited)
    #[arg(long, value_name = "BPS", default_value_t = 0)]
    limit_bps: u64,

    /// Do not archive prior contents before overwriting
    #[arg(long)]
    no_versions: bool,

    /// Do not tombstone files deleted from the source
    #[arg(long)]
    no_keep_deleted: bool,

    /// Reap vault entries older than this many days (0 = never)
    #[arg(long, value_name = "DAYS", default_value_t = 7)]
    retention_days: u32,

    /// Namespace override (default: <basename>_<hash8>)
    #[arg(long, value_name = "NAME")]
    ns: Option<String>,

    /// Per-file output
    #[arg(long)]
    verbose: bool,

    /// List vault entries for this source/namespace instead of backing up
    #[arg(long)]
    scan_vault: bool,

    /// Restore one vault entry from its metadata sidecar, then exit
    #[arg(long, value_name = "META_JSON")]
    restore: Option<PathBuf>,
}

/// Everything the worker emits, forwarded across the thread boundary.
#[derive(Debug)]
enum Update {
    Progress { done: u64, total: u64 },
    Speed(f64),
    Eta(i64),
    State(String),
    FileStarted { rel: String },
    FileFinished { rel: String, ok: bool, err: String },
    VersionCreated { rel: String },
    DeletedStashed { rel: String },
    DeviceOffline { phase: String },
    DeviceOnline,
}

/// A BackupEvents implementation that sends updates to the printing
/// thread via a channel.
struct ChannelEvents {
    tx: Sender<Update>,
}

impl BackupEvents for ChannelEvents {
    fn on_progress_updated(&self, done: u64, total: u64) {
        let _ = self.tx.send(Update::Progress { done, total });
    }
    fn on_speed_updated(&self, bps: f64) {
        let _ = self.tx.send(Update::Speed(bps));
    }
    fn on_eta_updated(&self, seconds_left: i64) {
        let _ = self.tx.send(Update::Eta(seconds_left));
    }
    fn on_state_changed(&self, state: &str) {
        let _ = self.tx.send(Update::State(state.to_string()));
    }
    fn on_file_started(&self, rel: &str, _size: u64) {
        let _ = self.tx.send(Update::FileStarted {
            rel: rel.to_string(),
        });
    }
    fn on_file_finished(&self, rel: &str, ok: bool, err: &str) {
        let _ = self.tx.send(Update::FileFinished {
            rel: rel.to_string(),
            ok,
            err: err.to_string(),
        });
    }
    fn on_version_created(&self, rel: &str, _payload: &std::path::Path, _sidecar: &std::path::Path) {
        let _ = self.tx.send(Update::VersionCreated {
            rel: rel.to_string(),
        });
    }
    fn on_deleted_stashed(&self, rel: &str, _payload: &std::path::Path, _sidecar: &std::path::Path) {
        let _ = self.tx.send(Update::DeletedStashed {
            rel: rel.to_string(),
        });
    }
    fn on_device_offline(&self, phase: &str) {
        let _ = self.tx.send(Update::DeviceOffline {
            phase: phase.to_string(),
        });
    }
    fn on_device_online(&self) {
        let _ = self.tx.send(Update::DeviceOnline);
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for &next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.1} {}", value, unit)
}

fn format_eta(seconds: i64) -> String {
    if seconds < 0 {
        return "--".to_string();
    }
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}

fn progress_bar(percent: u32) -> String {
    const WIDTH: usize = 24;
    let percent = percent.min(100) as usize;
    let filled = WIDTH * percent / 100;
    format!(
        "{:>3}% |{}{}|",
        percent,
        "#".repeat(filled),
        "-".repeat(WIDTH - filled)
    )
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let exit_code = match run_cli(&args) {
        Ok(code) => code,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<i32, String> {
    if let Some(meta_path) = &args.restore {
        return run_restore(meta_path);
    }
    if args.scan_vault {
        return run_scan_vault(args);
    }
    run_backup(args)
}

fn required_roots(args: &Args) -> Result<(PathBuf, PathBuf), String> {
    let src = args
        .src
        .clone()
        .ok_or_else(|| "--src is required".to_string())?;
    let dst = args
        .dst
        .clone()
        .ok_or_else(|| "--dst is required".to_string())?;
    if !src.is_dir() {
        return Err(format!("Source is not a directory: {}", src.display()));
    }
    Ok((src, dst))
}

fn build_options(args: &Args) -> Result<Options, String> {
    let (src, dst) = required_roots(args)?;
    let mut opt = Options::new(src, dst);
    opt.verify_after_write = !args.no_verify;
    opt.max_retries = args.retries;
    if let Some(raw) = &args.ignore {
        opt.ignore_globs = split_patterns(raw);
    }
    opt.files_whitelist = args.files.clone();
    opt.speed_limit_bps = args.limit_bps;
    opt.keep_versions_on_change = !args.no_versions;
    opt.keep_deleted_in_vault = !args.no_keep_deleted;
    opt.retention_days = args.retention_days;
    opt.ns_name = args.ns.clone();
    Ok(opt)
}

fn run_backup(args: &Args) -> Result<i32, String> {
    let opt = build_options(args)?;
    let verbose = args.verbose;

    eprintln!("Backing up");
    eprintln!("  Source:      {}", opt.src_dir.display());
    eprintln!("  Destination: {}", opt.dst_dir.display());
    let mut worker = BackupWorker::new(opt).map_err(|e| e.to_string())?;
    eprintln!("  Namespace:   {}", worker.namespace());
    eprintln!();

    let (tx, rx) = unbounded::<Update>();
    let handle = thread::spawn(move || -> RunOutcome {
        worker.run(&ChannelEvents { tx })
    });

    let start = Instant::now();
    let mut speed = 0.0f64;
    let mut eta = -1i64;
    for update in rx {
        match update {
            Update::Progress { done, total } => {
                let total = total.max(1);
                let percent = (done as f64 / total as f64 * 100.0) as u32;
                eprint!(
                    "\rProgress: {} | {}/{} | {}/s | ETA {}   ",
                    progress_bar(percent),
                    format_bytes(done),
                    format_bytes(total),
                    format_bytes(speed as u64),
                    format_eta(eta),
                );
                let _ = std::io::Write::flush(&mut std::io::stderr());
            }
            Update::Speed(bps) => speed = bps,
            Update::Eta(secs) => eta = secs,
            Update::State(state) => {
                if verbose {
                    eprintln!("\n[{}]", state);
                }
            }
            Update::FileStarted { rel } => {
                if verbose {
                    eprintln!("\nStarting: {}", rel);
                }
            }
            Update::FileFinished { rel, ok, err } => {
                if !ok {
                    eprintln!("\nFailed: {} ({})", rel, err);
                } else if verbose {
                    eprintln!("\nDone: {}", rel);
                }
            }
            Update::VersionCreated { rel } => {
                if verbose {
                    eprintln!("\nArchived prior version: {}", rel);
                }
            }
            Update::DeletedStashed { rel } => {
                if verbose {
                    eprintln!("\nStashed deleted file: {}", rel);
                }
            }
            Update::DeviceOffline { phase } => {
                eprintln!("\nDevice offline ({}), waiting...", phase);
            }
            Update::DeviceOnline => {
                eprintln!("Device back, resuming");
            }
        }
    }

    let outcome = handle
        .join()
        .map_err(|_| "worker thread panicked".to_string())?;

    eprintln!();
    eprintln!("Finished: {}", outcome.summary);
    eprintln!(
        "Summary: {} copied, {} unchanged, {} failed",
        outcome.files_copied,
        outcome.files_skipped,
        outcome.failed.len()
    );
    eprintln!("Bytes: {}", format_bytes(outcome.bytes_done));
    eprintln!("Elapsed: {}", format_eta(start.elapsed().as_secs() as i64));

    if !outcome.failed.is_empty() {
        eprintln!();
        eprintln!("Failed files:");
        for failure in &outcome.failed {
            eprintln!("  {}: {}", failure.rel, failure.err);
        }
    }

    Ok(if outcome.ok { 0 } else { 1 })
}

fn run_scan_vault(args: &Args) -> Result<i32, String> {
    let dst = args
        .dst
        .clone()
        .ok_or_else(|| "--dst is required".to_string())?;
    let ns = match &args.ns {
        Some(ns) => ns.clone(),
        None => {
            // Derive the namespace the same way a backup run would.
            let opt = build_options(args)?;
            BackupWorker::new(opt)
                .map_err(|e| e.to_string())?
                .namespace()
                .to_string()
        }
    };

    let entries = engine::scan_entries(&dst, &ns);
    if entries.is_empty() {
        println!("No vault entries under {} for namespace {}", dst.display(), ns);
        return Ok(0);
    }
    for entry in entries {
        let kind = match entry.kind {
            VaultKind::Version => "version",
            VaultKind::Deleted => "deleted",
        };
        match SidecarMeta::load(&entry.sidecar) {
            Ok(meta) => println!("{}  {}  {}  {}", kind, meta.ts, meta.rel, entry.payload.display()),
            Err(_) => println!("{}  ?  ?  {}", kind, entry.payload.display()),
        }
    }
    Ok(0)
}

fn run_restore(meta_path: &PathBuf) -> Result<i32, String> {
    if !meta_path.is_file() {
        return Err(format!("No such sidecar: {}", meta_path.display()));
    }
    let meta = engine::restore_entry(meta_path).map_err(|e| e.to_string())?;
    println!("Restored {} -> {}", meta.rel, meta.orig_abs);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base_args(src: Option<PathBuf>, dst: Option<PathBuf>) -> Args {
        Args {
            src,
            dst,
            no_verify: false,
            retries: 3,
            ignore: None,
            files: Vec::new(),
            limit_bps: 0,
            no_versions: false,
            no_keep_deleted: false,
            retention_days: 7,
            ns: None,
            verbose: false,
            scan_vault: false,
            restore: None,
        }
    }

    #[test]
    fn test_cli_backup_roundtrip() {
        let root = TempDir::new().expect("Failed to create temp dir");
        let src = root.path().join("data");
        let dst = root.path().join("disk");
        fs::create_dir_all(&src).expect("mkdir");
        fs::create_dir_all(&dst).expect("mkdir");
        fs::write(src.join("test.txt"), "hello").expect("Failed to write file");

        let args = base_args(Some(src), Some(dst.clone()));
        let code = run_cli(&args).expect("backup should run");
        assert_eq!(code, 0);

        // The payload landed under the derived namespace.
        let entries: Vec<_> = fs::read_dir(&dst)
            .expect("read dst")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("data_"))
            .collect();
        assert_eq!(entries.len(), 1);
        let copied = entries[0].path().join("test.txt");
        assert_eq!(fs::read_to_string(copied).expect("read"), "hello");
    }

    #[test]
    fn test_cli_rejects_missing_source() {
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let args = base_args(
            Some(PathBuf::from("/nonexistent/path")),
            Some(dst_dir.path().to_path_buf()),
        );
        assert!(run_cli(&args).is_err());
    }

    #[test]
    fn test_cli_requires_roots_for_backup() {
        let args = base_args(None, None);
        assert!(run_cli(&args).is_err());
    }

    #[test]
    fn test_cli_scan_and_restore_flow() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(src_dir.path().join("a.txt"), "one").expect("write");

        let args = base_args(
            Some(src_dir.path().to_path_buf()),
            Some(dst_dir.path().to_path_buf()),
        );
        assert_eq!(run_cli(&args).expect("first run"), 0);

        // Change the file so the next run archives a version.
        fs::write(src_dir.path().join("a.txt"), "two").expect("write");
        assert_eq!(run_cli(&args).expect("second run"), 0);

        let mut scan_args = base_args(
            Some(src_dir.path().to_path_buf()),
            Some(dst_dir.path().to_path_buf()),
        );
        scan_args.scan_vault = true;
        assert_eq!(run_cli(&scan_args).expect("scan"), 0);

        // Find the sidecar and restore the old contents over the source.
        let opt = build_options(&args).expect("options");
        let ns = BackupWorker::new(opt).expect("worker").namespace().to_string();
        let entries = engine::scan_entries(dst_dir.path(), &ns);
        assert_eq!(entries.len(), 1);

        let mut restore_args = base_args(None, None);
        restore_args.restore = Some(entries[0].sidecar.clone());
        assert_eq!(run_cli(&restore_args).expect("restore"), 0);
        assert_eq!(
            fs::read_to_string(src_dir.path().join("a.txt")).expect("read"),
            "one"
        );
    }

    #[test]
    fn test_cli_ignore_patterns_are_split() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(src_dir.path().join("keep.txt"), "k").expect("write");
        fs::write(src_dir.path().join("skip.tmp"), "s").expect("write");

        let mut args = base_args(
            Some(src_dir.path().to_path_buf()),
            Some(dst_dir.path().to_path_buf()),
        );
        args.ignore = Some("*.tmp;*.bak".to_string());
        args.ns = Some("fixed".to_string());
        assert_eq!(run_cli(&args).expect("run"), 0);

        assert!(dst_dir.path().join("fixed/keep.txt").exists());
        assert!(!dst_dir.path().join("fixed/skip.tmp").exists());
    }
}
