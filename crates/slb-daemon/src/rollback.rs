//! Pre-execution rollback capture and restore.
//!
//! Before an approved destructive command runs, the executor captures the
//! state it is about to destroy:
//!
//! - **filesystem** (`rm`-like): a gzipped tar per target path, symlinks
//!   stored as symlink entries with their literal link names
//! - **git** (`git reset --hard`, `git clean -f`, `git checkout --`): repo
//!   root, `HEAD`, branch, and the current working diff
//! - **kubernetes** (`kubectl delete`): one `kubectl get -o yaml` manifest
//!   per resource
//!
//! Captures live in `.slb/rollback/req-<id>/` with a `metadata.json`
//! describing the kind-specific payload. Restore refuses to write through a
//! symlinked parent, so a post-deletion symlink cannot redirect restored
//! files outside the project.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use chrono::Duration;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use slb_core::normalize::{extract_command_name, normalize_command, resolve_paths_in_command};
use slb_core::types::Request;
use tracing::{debug, info, warn};

use crate::fs_atomic;

/// Rollback kind marker: filesystem tar capture.
pub const KIND_FILESYSTEM: &str = "filesystem";
/// Rollback kind marker: git head/diff capture.
pub const KIND_GIT: &str = "git";
/// Rollback kind marker: kubernetes manifest capture.
pub const KIND_KUBERNETES: &str = "kubernetes";

/// Name of the capture metadata file.
pub const METADATA_FILE: &str = "metadata.json";

/// Errors from rollback operations.
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    /// Rollback data was absent where required.
    #[error("{0} rollback data missing")]
    MissingData(&'static str),

    /// The rollback directory path is empty or whitespace.
    #[error("rollback path is empty")]
    EmptyRollbackPath,

    /// The metadata names a kind this build does not know.
    #[error("unsupported rollback kind: {0:?}")]
    UnsupportedKind(String),

    /// The capture would exceed the configured size bound.
    #[error("capture size {size} bytes exceeds maximum of {max} bytes")]
    SizeExceeded {
        /// Total bytes the capture would need.
        size: u64,
        /// Configured bound.
        max: u64,
    },

    /// A parent in the restore chain is a symlink; writing through it could
    /// escape the project.
    #[error("refusing to restore through symlinked parent {}", path.display())]
    SymlinkParent {
        /// The offending parent.
        path: PathBuf,
    },

    /// Git restore was attempted without the explicit force opt-in.
    #[error("git restore rewrites history; pass force to proceed")]
    ForceRequired,

    /// Git rollback data has no repository root.
    #[error("git repo root missing from rollback data")]
    RepoRootMissing,

    /// A subprocess exited non-zero.
    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        /// The program that failed.
        program: String,
        /// Its exit status.
        status: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// Capture metadata did not parse.
    #[error("parsing {METADATA_FILE}: {0}")]
    Metadata(#[source] serde_json::Error),

    /// Atomic metadata write failed.
    #[error(transparent)]
    FsAtomic(#[from] crate::fs_atomic::FsAtomicError),

    /// An I/O error occurred.
    #[error("rollback I/O during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl RollbackError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Filesystem capture payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemRollback {
    /// Archive file names (`p<i>.tar.gz`), parallel to `targets`.
    pub archives: Vec<String>,
    /// Original absolute target paths, parallel to `archives`.
    pub targets: Vec<String>,
}

/// Git capture payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitRollback {
    /// Repository root.
    pub repo_root: String,
    /// Commit hash of `HEAD` at capture time.
    pub head: String,
    /// Branch name, empty when detached.
    #[serde(default)]
    pub branch: String,
    /// File name of the working diff (`diff.patch`).
    #[serde(default)]
    pub diff_file: String,
}

/// Kubernetes capture payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesRollback {
    /// Manifest file names (`k8s-<i>.yaml`), in capture order.
    pub manifests: Vec<String>,
    /// `<kind>/<name>` labels, parallel to `manifests`.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// A completed capture: `metadata.json` plus the payload files beside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackData {
    /// One of [`KIND_FILESYSTEM`], [`KIND_GIT`], [`KIND_KUBERNETES`].
    pub kind: String,
    /// The request this capture belongs to.
    pub request_id: String,
    /// Filesystem payload, when `kind` is filesystem.
    pub filesystem: Option<FilesystemRollback>,
    /// Git payload, when `kind` is git.
    pub git: Option<GitRollback>,
    /// Kubernetes payload, when `kind` is kubernetes.
    pub kubernetes: Option<KubernetesRollback>,
    /// Directory the capture lives in. Not serialized; set on load.
    #[serde(skip)]
    pub rollback_path: PathBuf,
}

impl Default for RollbackData {
    fn default() -> Self {
        Self {
            kind: String::new(),
            request_id: String::new(),
            filesystem: None,
            git: None,
            kubernetes: None,
            rollback_path: PathBuf::new(),
        }
    }
}

/// Options for [`capture_rollback_state`].
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// Upper bound for a filesystem capture, in bytes. Zero disables the
    /// bound.
    pub max_size_bytes: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Options for [`restore_rollback_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Required for git restore, which rewrites the working tree.
    pub force: bool,
}

/// Inspect the request's command and capture the state it would destroy.
///
/// Returns `Ok(None)` when the command has no rollback-able shape, when no
/// in-project targets exist, or when the needed tool (`git`, `kubectl`) is
/// not on `PATH` — capture degrades, it does not fail the request.
pub fn capture_rollback_state(
    request: &Request,
    rollback_root: &Path,
    options: &CaptureOptions,
) -> Result<Option<RollbackData>, RollbackError> {
    let normalized = normalize_command(&request.command.raw);
    let primary = normalized.primary.as_str();
    let name = extract_command_name(primary);

    match name.as_str() {
        "rm" => capture_filesystem(request, rollback_root, options, primary),
        "git" if is_git_destructive(primary) => capture_git(request, rollback_root),
        "kubectl" if primary.split_whitespace().nth(1) == Some("delete") => {
            capture_kubernetes(request, rollback_root, primary)
        }
        _ => Ok(None),
    }
}

fn is_git_destructive(primary: &str) -> bool {
    let rest = primary.strip_prefix("git").unwrap_or("").trim_start();
    rest.starts_with("reset --hard")
        || (rest.starts_with("clean") && rest.contains("-f"))
        || rest.starts_with("checkout --")
        || rest.starts_with("checkout .")
}

fn capture_dir(rollback_root: &Path, request_id: &str) -> Result<PathBuf, RollbackError> {
    let dir = rollback_root.join(format!("req-{}", request_id.trim_start_matches("req-")));
    fs_atomic::ensure_dir(&dir)?;
    Ok(dir)
}

// ------------------------------------------------------------------
// Filesystem
// ------------------------------------------------------------------

fn capture_filesystem(
    request: &Request,
    rollback_root: &Path,
    options: &CaptureOptions,
    primary: &str,
) -> Result<Option<RollbackData>, RollbackError> {
    let resolved = resolve_paths_in_command(primary, &request.command.cwd);
    let tokens: Vec<String> = shlex_or_whitespace(&resolved);
    let project_root = Path::new(&request.project_path);

    let mut targets: Vec<PathBuf> = Vec::new();
    for tok in tokens.iter().skip(1).filter(|t| !t.starts_with('-')) {
        let path = if Path::new(tok).is_absolute() {
            PathBuf::from(tok)
        } else if request.command.cwd.is_empty() {
            continue;
        } else {
            Path::new(&request.command.cwd).join(tok)
        };
        // Only snapshot paths rooted under the project; anything else is
        // outside our jurisdiction.
        if !path.starts_with(project_root) {
            debug!(path = %path.display(), "skipping target outside project");
            continue;
        }
        if path.symlink_metadata().is_ok() {
            targets.push(path);
        }
    }

    if targets.is_empty() {
        return Ok(None);
    }

    if options.max_size_bytes > 0 {
        let total: u64 = targets.iter().map(|t| path_size(t)).sum();
        if total > options.max_size_bytes {
            return Err(RollbackError::SizeExceeded {
                size: total,
                max: options.max_size_bytes,
            });
        }
    }

    let dir = capture_dir(rollback_root, &request.id)?;
    let mut archives = Vec::new();
    let mut target_names = Vec::new();
    for (i, target) in targets.iter().enumerate() {
        let archive_name = format!("p{i}.tar.gz");
        write_tar_gz(&dir.join(&archive_name), &format!("p{i}"), target)?;
        archives.push(archive_name);
        target_names.push(target.display().to_string());
    }

    let data = RollbackData {
        kind: KIND_FILESYSTEM.to_string(),
        request_id: request.id.clone(),
        filesystem: Some(FilesystemRollback {
            archives,
            targets: target_names,
        }),
        rollback_path: dir.clone(),
        ..RollbackData::default()
    };
    fs_atomic::atomic_write_json(&dir.join(METADATA_FILE), &data)?;
    info!(request_id = %request.id, dir = %dir.display(), "filesystem rollback captured");
    Ok(Some(data))
}

fn shlex_or_whitespace(s: &str) -> Vec<String> {
    shlex::split(s).unwrap_or_else(|| s.split_whitespace().map(str::to_string).collect())
}

fn path_size(path: &Path) -> u64 {
    let Ok(meta) = path.symlink_metadata() else {
        return 0;
    };
    if meta.is_dir() {
        fs::read_dir(path)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| path_size(&e.path()))
                    .sum()
            })
            .unwrap_or(0)
    } else {
        meta.len()
    }
}

fn write_tar_gz(archive_path: &Path, prefix: &str, target: &Path) -> Result<(), RollbackError> {
    let file = File::create(archive_path)
        .map_err(|e| RollbackError::io(format!("create {}", archive_path.display()), e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    // Symlinks must be archived as symlink entries, never dereferenced: the
    // whole point is restoring the tree exactly as it was.
    builder.follow_symlinks(false);

    let meta = target
        .symlink_metadata()
        .map_err(|e| RollbackError::io(format!("stat {}", target.display()), e))?;
    if meta.is_dir() {
        builder
            .append_dir_all(prefix, target)
            .map_err(|e| RollbackError::io(format!("archive {}", target.display()), e))?;
    } else {
        builder
            .append_path_with_name(target, prefix)
            .map_err(|e| RollbackError::io(format!("archive {}", target.display()), e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| RollbackError::io("finish tar archive", e))?;
    encoder
        .finish()
        .map_err(|e| RollbackError::io("finish gzip stream", e))?;
    Ok(())
}

fn restore_filesystem(data: &RollbackData) -> Result<(), RollbackError> {
    let fs_data = data
        .filesystem
        .as_ref()
        .ok_or(RollbackError::MissingData("filesystem"))?;

    for (archive_name, target) in fs_data.archives.iter().zip(&fs_data.targets) {
        let target = PathBuf::from(target);
        let archive_path = data.rollback_path.join(archive_name);
        let file = File::open(&archive_path)
            .map_err(|e| RollbackError::io(format!("open {}", archive_path.display()), e))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);

        let entries = archive
            .entries()
            .map_err(|e| RollbackError::io("read tar entries", e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| RollbackError::io("read tar entry", e))?;
            let entry_path = entry
                .path()
                .map_err(|e| RollbackError::io("read tar entry path", e))?
                .into_owned();

            // Strip the p<i> prefix; what remains is relative to the target.
            let mut components = entry_path.components();
            components.next();
            let remainder = components.as_path().to_path_buf();
            let dest = if remainder.as_os_str().is_empty() {
                target.clone()
            } else {
                target.join(&remainder)
            };

            refuse_symlink_parents(&dest, &target)?;

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| RollbackError::io(format!("create {}", parent.display()), e))?;
            }
            entry
                .unpack(&dest)
                .map_err(|e| RollbackError::io(format!("unpack {}", dest.display()), e))?;
        }
    }
    Ok(())
}

/// `lstat` every directory between `dest` and `target` (inclusive of the
/// target itself); any symlink in the chain aborts the restore.
fn refuse_symlink_parents(dest: &Path, target: &Path) -> Result<(), RollbackError> {
    let stop = target.parent();
    for ancestor in dest.ancestors().skip(1) {
        if Some(ancestor) == stop {
            break;
        }
        if let Ok(meta) = fs::symlink_metadata(ancestor) {
            if meta.file_type().is_symlink() {
                return Err(RollbackError::SymlinkParent {
                    path: ancestor.to_path_buf(),
                });
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------
// Git
// ------------------------------------------------------------------

fn cwd_or_dot(cwd: &str) -> &Path {
    if cwd.is_empty() {
        Path::new(".")
    } else {
        Path::new(cwd)
    }
}

fn capture_git(
    request: &Request,
    rollback_root: &Path,
) -> Result<Option<RollbackData>, RollbackError> {
    let cwd = cwd_or_dot(&request.command.cwd);
    let repo_root = match run_capture_tool(cwd, "git", &["rev-parse", "--show-toplevel"]) {
        Ok(out) => out.trim().to_string(),
        Err(ToolError::NotInstalled) => {
            warn!("git not on PATH; skipping rollback capture");
            return Ok(None);
        }
        Err(ToolError::Failed(e)) => return Err(e),
    };
    let head = run_tool(cwd, "git", &["rev-parse", "HEAD"])?.trim().to_string();
    let branch_raw = run_tool(cwd, "git", &["rev-parse", "--abbrev-ref", "HEAD"])?
        .trim()
        .to_string();
    let branch = if branch_raw == "HEAD" {
        String::new() // detached
    } else {
        branch_raw
    };
    let diff = run_tool(cwd, "git", &["diff", "HEAD"])?;

    let dir = capture_dir(rollback_root, &request.id)?;
    let diff_file = "diff.patch".to_string();
    fs::write(dir.join(&diff_file), &diff)
        .map_err(|e| RollbackError::io("write diff.patch", e))?;

    let data = RollbackData {
        kind: KIND_GIT.to_string(),
        request_id: request.id.clone(),
        git: Some(GitRollback {
            repo_root,
            head,
            branch,
            diff_file,
        }),
        rollback_path: dir.clone(),
        ..RollbackData::default()
    };
    fs_atomic::atomic_write_json(&dir.join(METADATA_FILE), &data)?;
    info!(request_id = %request.id, "git rollback captured");
    Ok(Some(data))
}

fn restore_git(data: &RollbackData, options: &RestoreOptions) -> Result<(), RollbackError> {
    let git = data.git.as_ref().ok_or(RollbackError::MissingData("git"))?;
    if !options.force {
        return Err(RollbackError::ForceRequired);
    }
    if git.repo_root.trim().is_empty() {
        return Err(RollbackError::RepoRootMissing);
    }
    let repo = Path::new(&git.repo_root);
    if !git.branch.is_empty() {
        run_tool(repo, "git", &["checkout", &git.branch])?;
    }
    run_tool(repo, "git", &["reset", "--hard", &git.head])?;
    info!(head = %git.head, "git state restored");
    Ok(())
}

// ------------------------------------------------------------------
// Kubernetes
// ------------------------------------------------------------------

fn capture_kubernetes(
    request: &Request,
    rollback_root: &Path,
    primary: &str,
) -> Result<Option<RollbackData>, RollbackError> {
    let tokens = shlex_or_whitespace(primary);
    // kubectl delete <kind> <name>... — flags are not resources.
    let mut positional = tokens.iter().skip(2).filter(|t| !t.starts_with('-'));
    let Some(resource_kind) = positional.next() else {
        return Ok(None);
    };
    let names: Vec<&String> = positional.collect();
    if names.is_empty() {
        return Ok(None);
    }

    let cwd = cwd_or_dot(&request.command.cwd);
    let mut captured = Vec::new();
    for name in &names {
        let yaml = match run_capture_tool(
            cwd,
            "kubectl",
            &["get", resource_kind, name, "-o", "yaml"],
        ) {
            Ok(out) => out,
            Err(ToolError::NotInstalled) => {
                warn!("kubectl not on PATH; skipping rollback capture");
                return Ok(None);
            }
            Err(ToolError::Failed(e)) => return Err(e),
        };
        captured.push((format!("{resource_kind}/{name}"), yaml));
    }

    let dir = capture_dir(rollback_root, &request.id)?;
    let mut manifests = Vec::new();
    let mut resources = Vec::new();
    for (i, (resource, yaml)) in captured.into_iter().enumerate() {
        let manifest_name = format!("k8s-{i}.yaml");
        fs::write(dir.join(&manifest_name), yaml)
            .map_err(|e| RollbackError::io(format!("write {manifest_name}"), e))?;
        manifests.push(manifest_name);
        resources.push(resource);
    }
    let data = RollbackData {
        kind: KIND_KUBERNETES.to_string(),
        request_id: request.id.clone(),
        kubernetes: Some(KubernetesRollback {
            manifests,
            resources,
        }),
        rollback_path: dir.clone(),
        ..RollbackData::default()
    };
    fs_atomic::atomic_write_json(&dir.join(METADATA_FILE), &data)?;
    info!(request_id = %request.id, "kubernetes rollback captured");
    Ok(Some(data))
}

fn restore_kubernetes(data: &RollbackData) -> Result<(), RollbackError> {
    let k8s = data
        .kubernetes
        .as_ref()
        .ok_or(RollbackError::MissingData("kubernetes"))?;
    for manifest in &k8s.manifests {
        let path = data.rollback_path.join(manifest);
        run_tool(
            &data.rollback_path,
            "kubectl",
            &["apply", "-f", &path.display().to_string()],
        )?;
    }
    info!(manifests = k8s.manifests.len(), "kubernetes manifests re-applied");
    Ok(())
}

// ------------------------------------------------------------------
// Shared entry points
// ------------------------------------------------------------------

/// Restore previously captured state.
///
/// Refuses empty paths and unknown kinds; filesystem restore additionally
/// refuses symlinked parents, and git restore requires `force`.
pub fn restore_rollback_state(
    data: &RollbackData,
    options: &RestoreOptions,
) -> Result<(), RollbackError> {
    if data.rollback_path.as_os_str().is_empty()
        || data.rollback_path.to_string_lossy().trim().is_empty()
    {
        return Err(RollbackError::EmptyRollbackPath);
    }
    match data.kind.as_str() {
        KIND_FILESYSTEM => restore_filesystem(data),
        KIND_GIT => restore_git(data, options),
        KIND_KUBERNETES => restore_kubernetes(data),
        other => Err(RollbackError::UnsupportedKind(other.to_string())),
    }
}

/// Load capture metadata from a rollback directory.
pub fn load_rollback_data(dir: &str) -> Result<RollbackData, RollbackError> {
    if dir.trim().is_empty() {
        return Err(RollbackError::EmptyRollbackPath);
    }
    let dir_path = Path::new(dir);
    let bytes = fs::read(dir_path.join(METADATA_FILE))
        .map_err(|e| RollbackError::io(format!("read {METADATA_FILE} in {dir}"), e))?;
    let mut data: RollbackData =
        serde_json::from_slice(&bytes).map_err(RollbackError::Metadata)?;
    if data.rollback_path.as_os_str().is_empty() {
        data.rollback_path = dir_path.to_path_buf();
    }
    Ok(data)
}

/// Remove expired capture directories under `root`.
///
/// Only directories named `req-*` with a modification time older than
/// `now − retention` are removed; other names and plain files are left
/// alone. A non-positive retention disables collection entirely, and a
/// missing root is not an error.
pub fn cleanup_old_captures(
    root: &Path,
    retention: Duration,
    now: SystemTime,
) -> Result<(), RollbackError> {
    if retention <= Duration::zero() {
        return Ok(());
    }
    let Ok(retention_std) = retention.to_std() else {
        return Ok(());
    };
    let cutoff = now.checked_sub(retention_std).unwrap_or(SystemTime::UNIX_EPOCH);

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RollbackError::io(format!("read {}", root.display()), e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| RollbackError::io("read rollback entry", e))?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("req-") {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified < cutoff {
            info!(dir = %entry.path().display(), "removing expired rollback capture");
            fs::remove_dir_all(entry.path())
                .map_err(|e| RollbackError::io("remove expired capture", e))?;
        }
    }
    Ok(())
}

// ------------------------------------------------------------------
// Subprocess plumbing
// ------------------------------------------------------------------

enum ToolError {
    NotInstalled,
    Failed(RollbackError),
}

fn run_capture_tool(cwd: &Path, program: &str, args: &[&str]) -> Result<String, ToolError> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotInstalled
            } else {
                ToolError::Failed(RollbackError::io(format!("spawn {program}"), e))
            }
        })?;
    if !output.status.success() {
        return Err(ToolError::Failed(RollbackError::CommandFailed {
            program: program.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run_tool(cwd: &Path, program: &str, args: &[&str]) -> Result<String, RollbackError> {
    run_capture_tool(cwd, program, args).map_err(|e| match e {
        ToolError::NotInstalled => RollbackError::io(
            format!("spawn {program}"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "not on PATH"),
        ),
        ToolError::Failed(err) => err,
    })
}
