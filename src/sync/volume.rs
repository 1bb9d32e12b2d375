//! File signatures for the sync protocol.
//!
//! A signature is the tuple `(relpath, size, mtime_ns, quick_checksum)`
//! used to decide which files a sync pass must transfer. The quick
//! checksum concatenates the first and last KiB of the file; files at or
//! below [`FULL_HASH_THRESHOLD`](crate::constants::FULL_HASH_THRESHOLD)
//! additionally carry a full SHA-256, which catches edits that preserve
//! both size and mtime.

use crate::constants::{FULL_HASH_THRESHOLD, QUICK_CHECKSUM_WINDOW};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

/// Signature of one file under a volume root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    /// Path relative to the volume root, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mtime_ns: i64,
    /// Hex of first-KiB ‖ last-KiB.
    pub quick_checksum: String,
    /// Hex SHA-256 of the whole file, present for small files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Rejects relative paths that could escape the volume root.
pub fn validate_relpath(relpath: &str) -> Result<()> {
    let path = Path::new(relpath);
    if path.is_absolute() {
        return Err(Error::PathTraversal(relpath.to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(Error::PathTraversal(relpath.to_string())),
        }
    }
    Ok(())
}

/// Walks `root` (or `subpath` beneath it) and builds signatures for every
/// regular file.
pub fn collect_signatures(root: &Path, subpath: &str) -> Result<Vec<FileSignature>> {
    let base = if subpath.is_empty() {
        root.to_path_buf()
    } else {
        validate_relpath(subpath)?;
        root.join(subpath)
    };

    let mut signatures = Vec::new();
    if !base.exists() {
        return Ok(signatures);
    }

    walk(&base, &mut |path| {
        let meta = fs::metadata(path)?;
        let relpath = path
            .strip_prefix(&base)
            .map_err(|_| Error::Internal(format!("walk escaped root at {}", path.display())))?;
        let relpath = relpath
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let mtime_ns = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        signatures.push(FileSignature {
            path: relpath,
            size: meta.len(),
            mtime_ns,
            quick_checksum: quick_checksum(path, meta.len())?,
            content_hash: if meta.len() <= FULL_HASH_THRESHOLD {
                Some(content_hash(path)?)
            } else {
                None
            },
        });
        Ok(())
    })?;

    signatures.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(signatures)
}

fn walk(dir: &Path, callback: &mut impl FnMut(&Path) -> Result<()>) -> Result<()> {
    if dir.is_file() {
        return callback(dir);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, callback)?;
        } else if path.is_file() {
            callback(&path)?;
        }
    }
    Ok(())
}

/// Hex of the file's first KiB concatenated with its last KiB.
pub fn quick_checksum(path: &Path, size: u64) -> Result<String> {
    let mut file = fs::File::open(path)?;

    let mut first = vec![0u8; QUICK_CHECKSUM_WINDOW];
    let n1 = file.read(&mut first)?;
    first.truncate(n1);

    let mut last = vec![0u8; QUICK_CHECKSUM_WINDOW];
    if size > QUICK_CHECKSUM_WINDOW as u64 {
        file.seek(SeekFrom::End(-(QUICK_CHECKSUM_WINDOW as i64)))?;
    } else {
        file.seek(SeekFrom::Start(0))?;
    }
    let n2 = file.read(&mut last)?;
    last.truncate(n2);

    first.extend_from_slice(&last);
    Ok(hex::encode(first))
}

fn content_hash(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// Decides whether the local copy of a file is stale relative to a remote
/// signature: missing, size mismatch, strictly older mtime, or (when both
/// sides hashed the content) differing hashes.
pub fn needs_update(local_root: &Path, sig: &FileSignature) -> bool {
    let local_path: PathBuf = local_root.join(&sig.path);
    let Ok(meta) = fs::metadata(&local_path) else {
        return true;
    };

    if meta.len() != sig.size {
        return true;
    }

    if let Some(remote_hash) = &sig.content_hash {
        if meta.len() <= FULL_HASH_THRESHOLD {
            match content_hash(&local_path) {
                Ok(local_hash) => return &local_hash != remote_hash,
                Err(_) => return true,
            }
        }
    }

    let local_mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);

    local_mtime < sig.mtime_ns
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_walks_nested_dirs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("sub/deep/b.txt"), b"beta").unwrap();

        let sigs = collect_signatures(dir.path(), "").unwrap();
        let paths: Vec<&str> = sigs.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub/deep/b.txt"]);
        assert_eq!(sigs[0].size, 5);
        assert!(sigs[0].content_hash.is_some());
    }

    #[test]
    fn test_quick_checksum_small_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hello").unwrap();

        // Below the window the head and tail are the whole content twice.
        let sum = quick_checksum(&path, 5).unwrap();
        assert_eq!(sum, hex::encode(b"hellohello"));
    }

    #[test]
    fn test_needs_update_on_missing_size_and_content() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        fs::write(remote.path().join("f"), b"content").unwrap();

        let sig = &collect_signatures(remote.path(), "").unwrap()[0];

        // Missing locally.
        assert!(needs_update(local.path(), sig));

        // Same content: up to date.
        fs::write(local.path().join("f"), b"content").unwrap();
        assert!(!needs_update(local.path(), sig));

        // Same size, different bytes: caught by the content hash.
        fs::write(local.path().join("f"), b"CONTENT").unwrap();
        assert!(needs_update(local.path(), sig));
    }

    #[test]
    fn test_validate_relpath() {
        assert!(validate_relpath("a/b/c.txt").is_ok());
        assert!(validate_relpath("../escape").is_err());
        assert!(validate_relpath("/etc/passwd").is_err());
        assert!(validate_relpath("a/../../b").is_err());
    }
}
