//! Filesystem operations.
//!
//! Source-tree scanning, relative-path normalization, ignore filtering,
//! directory creation and the rename-then-copy fallback used to move
//! payloads into the vault. Everything here is synchronous and
//! independent of the device gate; callers decide when it is safe to
//! touch the destination.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::error::EngineError;

/// Fast-equality tolerance for filesystem timestamp rounding, seconds.
const MTIME_SLACK_SECS: u64 = 2;

/// Normalize a relative path: forward slashes, no empty, `.` or `..`
/// segments. `..` pops the previous segment where one exists.
pub fn clean_rel(raw: &str) -> String {
    let forward = raw.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in forward.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Recursively list regular files under `src` as normalized relative
/// paths, sorted case-insensitively. Symlinks are not followed and do
/// not appear in the result. Unreadable subtrees are logged and skipped;
/// they never fail the scan.
pub fn list_relative_files(src: &Path) -> Vec<String> {
    let mut out = Vec::new();
    walk(src, String::new(), &mut out);
    out.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()));
    out
}

fn walk(dir: &Path, rel_prefix: String, out: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping unstattable entry");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if rel_prefix.is_empty() {
            name
        } else {
            format!("{}/{}", rel_prefix, name)
        };
        if file_type.is_dir() {
            walk(&entry.path(), rel, out);
        } else if file_type.is_file() {
            out.push(rel);
        }
        // Symlinks and special files are skipped.
    }
}

/// Compiled ignore patterns, matched against the whole normalized
/// relative path.
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    globset: GlobSet,
}

impl IgnoreSet {
    /// Compile an ordered list of glob strings.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<IgnoreSet, EngineError> {
        let mut builder = GlobSetBuilder::new();
        for pat in patterns {
            let glob = Glob::new(pat.as_ref()).map_err(|e| EngineError::InvalidGlob {
                pattern: pat.as_ref().to_string(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let globset = builder.build().map_err(|e| EngineError::InvalidGlob {
            pattern: String::new(),
            reason: e.to_string(),
        })?;
        Ok(IgnoreSet { globset })
    }

    /// True if `rel` should be skipped. Empty paths are always skipped.
    pub fn matches(&self, rel: &str) -> bool {
        rel.is_empty() || self.globset.is_match(rel)
    }
}

/// Create a directory and all missing ancestors.
pub fn ensure_dir(path: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(path).map_err(|e| EngineError::DirectoryCreationFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Create the parent directory of `path` if it has one.
pub fn ensure_parent_dir(path: &Path) -> Result<(), EngineError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

/// Move a file, replacing any existing target: rename first, and where
/// rename cannot work (cross-device, exotic filesystems) fall back to
/// copy + delete.
pub fn move_file_robust(from: &Path, to: &Path) -> Result<(), EngineError> {
    if to.exists() {
        let _ = fs::remove_file(to);
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if fs::copy(from, to).is_ok() {
        let _ = fs::remove_file(from);
        return Ok(());
    }
    Err(EngineError::MoveFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
    })
}

/// Best-effort: stamp `dst` with the modification time of `src`.
pub fn mirror_mtime(src: &Path, dst: &Path) {
    if let Ok(meta) = fs::metadata(src) {
        if let Ok(mtime) = meta.modified() {
            let _ = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime));
        }
    }
}

/// Size of a regular file, or `None` for anything else.
pub fn regular_file_size(path: &Path) -> Option<u64> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

/// Stat-level screen for "these are probably the same file": both are
/// regular files of equal size with modification times within the
/// filesystem rounding tolerance. A hit still needs hash confirmation.
pub fn likely_same_by_stat(a: &Path, b: &Path) -> bool {
    let (ma, mb) = match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => (ma, mb),
        _ => return false,
    };
    if !ma.is_file() || !mb.is_file() || ma.len() != mb.len() {
        return false;
    }
    match (ma.modified(), mb.modified()) {
        (Ok(ta), Ok(tb)) => mtime_delta_secs(ta, tb) <= MTIME_SLACK_SECS,
        _ => false,
    }
}

fn mtime_delta_secs(a: SystemTime, b: SystemTime) -> u64 {
    match a.duration_since(b) {
        Ok(d) => d.as_secs(),
        Err(e) => e.duration().as_secs(),
    }
}

/// Map an io error to a read-side engine error.
pub fn read_err(path: &Path, source: io::Error) -> EngineError {
    EngineError::ReadError {
        path: path.to_path_buf(),
        source,
    }
}

/// Map an io error to a write-side engine error.
pub fn write_err(path: &Path, source: io::Error) -> EngineError {
    EngineError::WriteError {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_clean_rel() {
        assert_eq!(clean_rel("a/b/c.txt"), "a/b/c.txt");
        assert_eq!(clean_rel("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(clean_rel("./a//b/./c"), "a/b/c");
        assert_eq!(clean_rel("a/b/../c"), "a/c");
        assert_eq!(clean_rel("../a"), "a");
        assert_eq!(clean_rel(""), "");
    }

    #[test]
    fn test_list_relative_files_sorted_case_insensitive() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path();
        fs::create_dir(src.join("sub")).expect("mkdir");
        fs::write(src.join("B.txt"), b"b").expect("write");
        fs::write(src.join("a.txt"), b"a").expect("write");
        fs::write(src.join("sub").join("c.txt"), b"c").expect("write");

        let rels = list_relative_files(src);
        assert_eq!(rels, vec!["a.txt", "B.txt", "sub/c.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_list_skips_symlinks() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path();
        fs::write(src.join("real.txt"), b"x").expect("write");
        std::os::unix::fs::symlink(src.join("real.txt"), src.join("link.txt"))
            .expect("symlink");

        let rels = list_relative_files(src);
        assert_eq!(rels, vec!["real.txt"]);
    }

    #[test]
    fn test_ignore_set() {
        let set = IgnoreSet::new(&["*.tmp", ".git/**", "build"]).expect("globs");
        assert!(set.matches("x.tmp"));
        assert!(set.matches("deep/dir/y.tmp"));
        assert!(set.matches(".git/objects/ab"));
        assert!(set.matches("build"));
        assert!(!set.matches("src/main.rs"));
        assert!(set.matches(""));
    }

    #[test]
    fn test_ignore_set_rejects_bad_glob() {
        assert!(IgnoreSet::new(&["[unclosed"]).is_err());
    }

    #[test]
    fn test_move_file_robust_replaces_target() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let from = dir.path().join("from.txt");
        let to = dir.path().join("to.txt");
        fs::write(&from, b"new").expect("write");
        fs::write(&to, b"old").expect("write");

        move_file_robust(&from, &to).expect("move");
        assert!(!from.exists());
        assert_eq!(fs::read(&to).expect("read"), b"new");
    }

    #[test]
    fn test_ensure_parent_dir() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let target = dir.path().join("a").join("b").join("f.txt");
        ensure_parent_dir(&target).expect("parent");
        assert!(target.parent().unwrap().is_dir());
    }

    #[test]
    fn test_likely_same_by_stat() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").expect("write");
        fs::write(&b, b"same").expect("write");

        let t = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&a, t).expect("mtime");
        filetime::set_file_mtime(&b, t).expect("mtime");
        assert!(likely_same_by_stat(&a, &b));

        // Within tolerance.
        filetime::set_file_mtime(&b, filetime::FileTime::from_unix_time(1_600_000_002, 0))
            .expect("mtime");
        assert!(likely_same_by_stat(&a, &b));

        // Outside tolerance.
        filetime::set_file_mtime(&b, filetime::FileTime::from_unix_time(1_600_000_010, 0))
            .expect("mtime");
        assert!(!likely_same_by_stat(&a, &b));

        // Different size.
        fs::write(&b, b"different").expect("write");
        filetime::set_file_mtime(&b, t).expect("mtime");
        assert!(!likely_same_by_stat(&a, &b));
    }
}
