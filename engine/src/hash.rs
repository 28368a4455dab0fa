//! Content hashing.
//!
//! Verification and equality confirmation use streaming SHA-256 with a
//! fixed 1 MiB read buffer. An unreadable file yields an empty digest;
//! an empty digest never compares equal to anything, so a torn read can
//! not fake a successful verify.
//!
//! SHA-1 appears only as a short namespace fingerprint; it is not used
//! for integrity.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Read buffer for hashing and copying, 1 MiB.
pub const CHUNK_SIZE: usize = 1 << 20;

/// Streaming SHA-256 of a file's contents.
///
/// Returns the 32-byte digest, or an empty vec if the file cannot be
/// opened or read to the end.
pub fn sha256_file(path: &Path) -> Vec<u8> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(_) => return Vec::new(),
        }
    }
    hasher.finalize().to_vec()
}

/// True only when both digests are non-empty and equal.
pub fn digests_match(a: &[u8], b: &[u8]) -> bool {
    !a.is_empty() && !b.is_empty() && a == b
}

/// Lowercase hex of a digest.
pub fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// First 8 hex characters of SHA-1 over a string. Used to disambiguate
/// source directories that share a basename; not a security boundary.
pub fn short_hash(s: &str) -> String {
    let digest = Sha1::digest(s.as_bytes());
    to_hex(&digest)[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sha256_known_value() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("f.txt");
        fs::write(&path, b"hello").expect("Failed to write");

        let digest = sha256_file(&path);
        assert_eq!(
            to_hex(&digest),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sha256_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let digest = sha256_file(&dir.path().join("nope"));
        assert!(digest.is_empty());
    }

    #[test]
    fn test_empty_digest_never_matches() {
        let empty: Vec<u8> = Vec::new();
        assert!(!digests_match(&empty, &empty));
        assert!(!digests_match(&empty, &[1, 2, 3]));
        assert!(!digests_match(&[1, 2, 3], &empty));
        assert!(digests_match(&[1, 2, 3], &[1, 2, 3]));
        assert!(!digests_match(&[1, 2, 3], &[1, 2, 4]));
    }

    #[test]
    fn test_short_hash_is_stable_8_hex() {
        let h = short_hash("abc");
        assert_eq!(h, "a9993e36");
        assert_eq!(short_hash("abc"), h);
        assert_ne!(short_hash("abd"), h);
    }

    #[test]
    fn test_sha256_multi_chunk_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("big.bin");
        // Spans three read chunks.
        let data = vec![0xabu8; CHUNK_SIZE * 2 + 17];
        fs::write(&path, &data).expect("Failed to write");

        let whole = sha256_file(&path);
        assert_eq!(whole.len(), 32);

        let expected = Sha256::digest(&data).to_vec();
        assert_eq!(whole, expected);
    }
}
