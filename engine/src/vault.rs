//! Vault layout and metadata sidecars.
//!
//! The vault is the `.plugbackup_meta` subtree under the destination
//! root. It holds archived versions of overwritten payloads and
//! tombstones of deleted ones, each paired with a small JSON sidecar
//! that carries enough context to restore the file without any
//! in-memory state.
//!
//! All path math here is pure; nothing touches the filesystem except
//! the explicit sidecar/scan/restore helpers.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::fs_ops;

/// Name of the vault directory under the destination root.
pub const META_DIR_NAME: &str = ".plugbackup_meta";

/// Vault timestamp format, UTC.
pub const TS_FORMAT: &str = "%Y%m%d-%H%M%S";

/// What a vault entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultKind {
    /// Prior contents of a payload that was about to be overwritten
    Version,
    /// A payload whose source file disappeared
    Deleted,
}

impl VaultKind {
    /// Suffix marker embedded in payload names: `.v<ts>` or `.d<ts>`.
    pub fn marker(self) -> &'static str {
        match self {
            VaultKind::Version => ".v",
            VaultKind::Deleted => ".d",
        }
    }
}

/// Sidecar contents, serialized compact next to each vault payload as
/// `<payload>.json`. `orig_abs` is what a restore writes back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarMeta {
    pub kind: VaultKind,
    pub ts: String,
    pub src_root: String,
    pub dst_root: String,
    pub namespace: String,
    pub rel: String,
    pub orig_abs: String,
    pub payload: String,
}

impl SidecarMeta {
    pub fn load(path: &Path) -> Result<SidecarMeta, EngineError> {
        let bytes = fs::read(path).map_err(|e| EngineError::SidecarFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::SidecarFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Current UTC timestamp in vault format.
pub fn ts_now() -> String {
    Utc::now().format(TS_FORMAT).to_string()
}

/// Strict parse of a vault timestamp; anything that does not match the
/// full format is `None`.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Timestamp of a vault payload file name, keyed on the last `.v`/`.d`
/// marker. The tail after the marker must parse as a full timestamp, so
/// a basename that merely contains `.v` or `.d` is not misclassified.
pub fn entry_timestamp(file_name: &str, kind: VaultKind) -> Option<DateTime<Utc>> {
    let pos = file_name.rfind(kind.marker())?;
    parse_ts(&file_name[pos + 2..])
}

/// Deterministic path calculation for one namespace under one
/// destination root.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    src_root: PathBuf,
    dst_root: PathBuf,
    ns: String,
}

impl VaultLayout {
    pub fn new(src_root: impl Into<PathBuf>, dst_root: impl Into<PathBuf>, ns: String) -> Self {
        VaultLayout {
            src_root: src_root.into(),
            dst_root: dst_root.into(),
            ns,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    pub fn src_root(&self) -> &Path {
        &self.src_root
    }

    /// `dst/<ns>`: the live payload subtree for this source.
    pub fn ns_root(&self) -> PathBuf {
        self.dst_root.join(&self.ns)
    }

    /// `dst/<ns>/<rel>`: live payload for a normalized relative path.
    pub fn dst_abs(&self, rel: &str) -> PathBuf {
        self.ns_root().join(rel)
    }

    /// `src/<rel>`: the absolute source path a restore targets.
    pub fn src_abs(&self, rel: &str) -> PathBuf {
        self.src_root.join(rel)
    }

    /// `dst/.plugbackup_meta`
    pub fn meta_root(&self) -> PathBuf {
        self.dst_root.join(META_DIR_NAME)
    }

    /// `meta/versions/<ns>`
    pub fn versions_root(&self) -> PathBuf {
        self.meta_root().join("versions").join(&self.ns)
    }

    /// `meta/deleted/<ns>`
    pub fn deleted_root(&self) -> PathBuf {
        self.meta_root().join("deleted").join(&self.ns)
    }

    fn entry_path(&self, kind: VaultKind, rel: &str, ts: &str) -> PathBuf {
        let root = match kind {
            VaultKind::Version => self.versions_root(),
            VaultKind::Deleted => self.deleted_root(),
        };
        let (dir, name) = match rel.rsplit_once('/') {
            Some((d, n)) => (Some(d), n),
            None => (None, rel),
        };
        let mut path = root;
        if let Some(dir) = dir {
            path = path.join(dir);
        }
        path.join(format!("{}{}{}", name, kind.marker(), ts))
    }

    /// `meta/versions/<ns>/<dirname(rel)>/<basename(rel)>.v<ts>`
    pub fn version_path(&self, rel: &str, ts: &str) -> PathBuf {
        self.entry_path(VaultKind::Version, rel, ts)
    }

    /// `meta/deleted/<ns>/<dirname(rel)>/<basename(rel)>.d<ts>`
    pub fn deleted_path(&self, rel: &str, ts: &str) -> PathBuf {
        self.entry_path(VaultKind::Deleted, rel, ts)
    }

    /// `<payload>.json`
    pub fn sidecar_path(payload: &Path) -> PathBuf {
        let mut os = payload.as_os_str().to_os_string();
        os.push(".json");
        PathBuf::from(os)
    }

    /// Write the sidecar for a vault payload; returns the sidecar path.
    pub fn write_sidecar(
        &self,
        kind: VaultKind,
        rel: &str,
        ts: &str,
        payload: &Path,
    ) -> Result<PathBuf, EngineError> {
        let meta = SidecarMeta {
            kind,
            ts: ts.to_string(),
            src_root: self.src_root.to_string_lossy().into_owned(),
            dst_root: self.dst_root.to_string_lossy().into_owned(),
            namespace: self.ns.clone(),
            rel: rel.to_string(),
            orig_abs: self.src_abs(rel).to_string_lossy().into_owned(),
            payload: payload.to_string_lossy().into_owned(),
        };
        let sidecar = Self::sidecar_path(payload);
        let bytes = serde_json::to_vec(&meta).map_err(|e| EngineError::SidecarFailed {
            path: sidecar.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&sidecar, bytes).map_err(|e| EngineError::SidecarFailed {
            path: sidecar.clone(),
            reason: e.to_string(),
        })?;
        Ok(sidecar)
    }
}

/// One payload + sidecar pair found in the vault.
#[derive(Debug, Clone)]
pub struct VaultEntry {
    pub kind: VaultKind,
    pub payload: PathBuf,
    pub sidecar: PathBuf,
    /// Parsed from the payload name; `None` for foreign or renamed files
    pub ts: Option<DateTime<Utc>>,
}

/// List valid vault entries (payload with an existing sidecar) for one
/// namespace, versions first, each subtree in scan order.
pub fn scan_entries(dst_root: &Path, ns: &str) -> Vec<VaultEntry> {
    let layout = VaultLayout::new(PathBuf::new(), dst_root, ns.to_string());
    let mut out = Vec::new();
    for (kind, root) in [
        (VaultKind::Version, layout.versions_root()),
        (VaultKind::Deleted, layout.deleted_root()),
    ] {
        if !root.is_dir() {
            continue;
        }
        for rel in fs_ops::list_relative_files(&root) {
            if rel.ends_with(".json") {
                continue;
            }
            let payload = root.join(&rel);
            let sidecar = VaultLayout::sidecar_path(&payload);
            if !sidecar.is_file() {
                continue;
            }
            let name = rel.rsplit('/').next().unwrap_or(&rel);
            out.push(VaultEntry {
                kind,
                ts: entry_timestamp(name, kind),
                payload,
                sidecar,
            });
        }
    }
    out
}

/// Restore a vault entry to its original source location, replacing any
/// existing file there. Tombstone entries are also copied back to their
/// live destination payload path. Returns the parsed sidecar.
pub fn restore_entry(sidecar: &Path) -> Result<SidecarMeta, EngineError> {
    let meta = SidecarMeta::load(sidecar)?;
    let payload = PathBuf::from(&meta.payload);
    let orig = PathBuf::from(&meta.orig_abs);

    copy_replacing(&payload, &orig)?;
    debug!(payload = %payload.display(), to = %orig.display(), "restored vault entry");

    if meta.kind == VaultKind::Deleted {
        let live = Path::new(&meta.dst_root)
            .join(&meta.namespace)
            .join(&meta.rel);
        copy_replacing(&payload, &live)?;
    }
    Ok(meta)
}

fn copy_replacing(from: &Path, to: &Path) -> Result<(), EngineError> {
    fs_ops::ensure_parent_dir(to)?;
    if to.exists() {
        let _ = fs::remove_file(to);
    }
    fs::copy(from, to).map_err(|e| fs_ops::write_err(to, e))?;
    Ok(())
}
