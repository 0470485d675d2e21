//! Project workspace layout.
//!
//! A project is any directory containing `.slb/`. All slb state for the
//! project lives under it: the SQLite store, structured logs, materialized
//! pending-request snapshots, rollback captures, and the daemon socket.

use std::path::{Path, PathBuf};

use slb_core::types::Request;
use tracing::debug;

use crate::fs_atomic::{self, FsAtomicError};

/// Name of the per-project state directory.
pub const SLB_DIR: &str = ".slb";

/// Handle to a project's `.slb/` workspace.
#[derive(Debug, Clone)]
pub struct ProjectWorkspace {
    project_root: PathBuf,
}

impl ProjectWorkspace {
    /// Open the workspace rooted at `project_root`, creating the directory
    /// layout when missing.
    pub fn init(project_root: &Path) -> Result<Self, FsAtomicError> {
        let ws = Self {
            project_root: project_root.to_path_buf(),
        };
        fs_atomic::ensure_dir(&ws.slb_dir())?;
        fs_atomic::ensure_dir(&ws.logs_dir())?;
        fs_atomic::ensure_dir(&ws.pending_dir())?;
        fs_atomic::ensure_dir(&ws.rollback_dir())?;
        Ok(ws)
    }

    /// Walk upward from `start` to find the nearest directory containing
    /// `.slb/`.
    #[must_use]
    pub fn discover(start: &Path) -> Option<Self> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir.join(SLB_DIR).is_dir() {
                return Some(Self {
                    project_root: dir.to_path_buf(),
                });
            }
            current = dir.parent();
        }
        None
    }

    /// The project root (the directory containing `.slb/`).
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// `.slb/` itself.
    #[must_use]
    pub fn slb_dir(&self) -> PathBuf {
        self.project_root.join(SLB_DIR)
    }

    /// Path of the authoritative store.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.slb_dir().join("state.db")
    }

    /// Append-only structured logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.slb_dir().join("logs")
    }

    /// Materialized JSON snapshots of pending requests.
    #[must_use]
    pub fn pending_dir(&self) -> PathBuf {
        self.slb_dir().join("pending")
    }

    /// Root of the per-request rollback captures.
    #[must_use]
    pub fn rollback_dir(&self) -> PathBuf {
        self.slb_dir().join("rollback")
    }

    /// The daemon's Unix socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.slb_dir().join("socket")
    }

    /// The project configuration file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.slb_dir().join("config.toml")
    }

    /// Write (or refresh) the JSON snapshot for a pending request.
    pub fn write_pending_snapshot(&self, request: &Request) -> Result<(), FsAtomicError> {
        let path = self.pending_dir().join(format!("{}.json", request.id));
        fs_atomic::atomic_write_json(&path, request)
    }

    /// Remove the snapshot for a request that left `pending`. Missing files
    /// are fine; the snapshot is a convenience view, not the authority.
    pub fn remove_pending_snapshot(&self, request_id: &str) {
        let path = self.pending_dir().join(format!("{request_id}.json"));
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(request_id, %err, "could not remove pending snapshot");
            }
        }
    }
}
