//! Durable JSON snapshot store.
//!
//! Each persistent entity kind (containers, secrets, networks) lives in a
//! single JSON file under the data directory. Writes are whole-file and
//! atomic: the snapshot is serialised to a unique temp file and renamed
//! over the target, so readers observe either the old or the new snapshot,
//! never a torn one.
//!
//! The data directory is created with mode 0700; snapshot files are
//! written with mode 0600.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Permission bits for the data directory.
pub const DATA_DIR_MODE: u32 = 0o700;

/// Permission bits for snapshot files.
pub const STATE_FILE_MODE: u32 = 0o600;

/// Creates the data directory (and parents) with restricted permissions.
///
/// Failure here is fatal: nothing can be persisted without it.
pub fn init_data_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::DataDirInit {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(DATA_DIR_MODE)).map_err(|e| {
        Error::DataDirInit {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;

    Ok(())
}

/// A JSON snapshot file for one entity kind.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    /// Creates a handle for a snapshot at `path`. The file itself is
    /// created lazily on first save.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, returning an empty list when the file does not
    /// exist yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Atomically replaces the snapshot with `items`.
    ///
    /// The unique temp file name keeps concurrent writers from clobbering
    /// each other's staging files; the final rename is atomic.
    pub fn save<T: Serialize>(&self, items: &[T]) -> Result<()> {
        let data = serde_json::to_vec_pretty(items)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, &data)?;

        #[cfg(unix)]
        fs::set_permissions(&tmp, fs::Permissions::from_mode(STATE_FILE_MODE))?;

        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::Io(e)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        id: String,
        n: u32,
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let snap = SnapshotFile::new(dir.path().join("state.json"));
        let entries: Vec<Entry> = snap.load().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let snap = SnapshotFile::new(dir.path().join("state.json"));

        let entries = vec![
            Entry { id: "a".into(), n: 1 },
            Entry { id: "b".into(), n: 2 },
        ];
        snap.save(&entries).unwrap();

        let loaded: Vec<Entry> = snap.load().unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_save_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let snap = SnapshotFile::new(dir.path().join("state.json"));

        snap.save(&[Entry { id: "a".into(), n: 1 }]).unwrap();
        snap.save(&[Entry { id: "b".into(), n: 2 }]).unwrap();

        let loaded: Vec<Entry> = snap.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "b");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_and_dir_modes() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        init_data_dir(&data_dir).unwrap();

        let meta = fs::metadata(&data_dir).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, DATA_DIR_MODE);

        let snap = SnapshotFile::new(data_dir.join("state.json"));
        snap.save(&[Entry { id: "a".into(), n: 1 }]).unwrap();

        let meta = fs::metadata(snap.path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, STATE_FILE_MODE);
    }
}
