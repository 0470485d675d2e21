//! Atomic file writes for state the daemon and CLI both read.
//!
//! Pending-request snapshots and rollback `metadata.json` files are written
//! with the temp-file + fsync + rename protocol: a crash at any point
//! leaves either the old complete file or the new complete file, never a
//! partial one. Files are created 0600 and directories 0700.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

/// Errors from atomic filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsAtomicError {
    /// The final path has no parent directory to stage the temp file in.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl FsAtomicError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Write `data` to `path` atomically.
///
/// 1. A temp file is created in the same directory (same filesystem, so the
///    rename is atomic).
/// 2. Data is written, flushed, and fsynced.
/// 3. The temp file is renamed over the final path.
/// 4. The parent directory is fsynced to commit the rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsAtomicError> {
    let parent = path
        .parent()
        .ok_or_else(|| FsAtomicError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsAtomicError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| FsAtomicError::io("write to temp file", e))?;
    tmp.flush()
        .map_err(|e| FsAtomicError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsAtomicError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| FsAtomicError::io("atomic rename to final path", e.error))?;

    fsync_directory(parent)
}

/// Serialize `value` as pretty JSON and write it atomically to `path`.
///
/// Serialization happens in memory first, so a serialization failure never
/// leaves a partial file behind.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsAtomicError> {
    let json = serde_json::to_string_pretty(value).map_err(FsAtomicError::SerializeFailed)?;
    atomic_write(path, json.as_bytes())
}

/// Create a directory (and parents) with mode 0700 when missing.
pub fn ensure_dir(dir: &Path) -> Result<(), FsAtomicError> {
    if dir.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| FsAtomicError::io("create directory with mode 0700", e))?;
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(|e| FsAtomicError::io("create directory", e))?;
    }

    Ok(())
}

/// `fsync` a directory so a completed rename is durable.
fn fsync_directory(dir: &Path) -> Result<(), FsAtomicError> {
    let dir_file = File::open(dir).map_err(|e| FsAtomicError::io("open directory for fsync", e))?;
    dir_file
        .sync_all()
        .map_err(|e| FsAtomicError::io("fsync directory", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        atomic_write(&path, b"{\"ok\":true}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"ok\":true}");
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_atomic_write_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        atomic_write_json(&path, &serde_json::json!({"kind": "filesystem"})).unwrap();
        let loaded: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded["kind"], "filesystem");
    }

    #[cfg(unix)]
    #[test]
    fn test_created_dirs_are_0700() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        let mode = std::fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
