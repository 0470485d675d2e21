//! Attachment loading for request evidence.
//!
//! Requestors can attach files, screenshots, captured command output, and
//! diffs to a request so reviewers can judge with context. Each type has a
//! size bound; screenshots are stored as base64 data URIs.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::types::{Attachment, AttachmentType};

/// Size bounds for attachment content.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentConfig {
    /// Maximum size for file attachments in bytes.
    pub max_file_bytes: u64,
    /// Maximum captured output size for context commands in bytes.
    pub max_output_bytes: usize,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,
            max_output_bytes: 100 * 1024,
        }
    }
}

/// Error from attachment loading.
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// The file is larger than the configured bound.
    #[error("attachment {path} too large: {size} bytes (max {max})")]
    TooLarge {
        /// Offending path.
        path: String,
        /// Actual size.
        size: u64,
        /// Configured bound.
        max: u64,
    },
    /// The path is not a recognized image format.
    #[error("{path} is not a recognized image format")]
    NotAnImage {
        /// Offending path.
        path: String,
    },
    /// Reading or spawning failed.
    #[error("attachment I/O on {path}: {source}")]
    Io {
        /// Offending path or command.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

const IMAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("webp", "image/webp"),
];

fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

fn looks_like_diff(path: &Path, content: &[u8]) -> bool {
    if matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("diff" | "patch")
    ) {
        return true;
    }
    content.starts_with(b"diff ") || content.starts_with(b"--- ") || content.starts_with(b"@@")
}

/// Load a file as an attachment, detecting screenshots and diffs by
/// extension and content.
pub fn load_file(path: &Path, config: &AttachmentConfig) -> Result<Attachment, AttachmentError> {
    let display = path.display().to_string();
    let meta = std::fs::metadata(path).map_err(|source| AttachmentError::Io {
        path: display.clone(),
        source,
    })?;
    if meta.len() > config.max_file_bytes {
        return Err(AttachmentError::TooLarge {
            path: display,
            size: meta.len(),
            max: config.max_file_bytes,
        });
    }

    let content = std::fs::read(path).map_err(|source| AttachmentError::Io {
        path: display.clone(),
        source,
    })?;

    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), serde_json::json!(display));
    metadata.insert(
        "filename".to_string(),
        serde_json::json!(path.file_name().map(|n| n.to_string_lossy().into_owned())),
    );
    metadata.insert("size".to_string(), serde_json::json!(meta.len()));

    if let Some(mime) = image_mime(path) {
        return Ok(Attachment {
            kind: AttachmentType::Screenshot,
            content: format!("data:{mime};base64,{}", BASE64.encode(&content)),
            metadata,
        });
    }

    let kind = if looks_like_diff(path, &content) {
        AttachmentType::GitDiff
    } else {
        AttachmentType::File
    };
    Ok(Attachment {
        kind,
        content: String::from_utf8_lossy(&content).into_owned(),
        metadata,
    })
}

/// Load an image file as a screenshot attachment.
pub fn load_screenshot(
    path: &Path,
    config: &AttachmentConfig,
) -> Result<Attachment, AttachmentError> {
    if image_mime(path).is_none() {
        return Err(AttachmentError::NotAnImage {
            path: path.display().to_string(),
        });
    }
    load_file(path, config)
}

/// Run a context command through `sh -c` and capture its output as an
/// attachment. Output beyond the bound is truncated with a notice; the exit
/// code is recorded in metadata.
pub fn run_context_command(
    command: &str,
    config: &AttachmentConfig,
) -> Result<Attachment, AttachmentError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|source| AttachmentError::Io {
            path: command.to_string(),
            source,
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !text.is_empty() {
            text.push_str("\n--- stderr ---\n");
        }
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    if text.len() > config.max_output_bytes {
        let mut cut = config.max_output_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [truncated]");
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), serde_json::json!(command));
    metadata.insert(
        "exit_code".to_string(),
        serde_json::json!(output.status.code().unwrap_or(-1)),
    );

    Ok(Attachment {
        kind: AttachmentType::Context,
        content: text,
        metadata,
    })
}

/// Load a line range of a file as a log-excerpt attachment.
///
/// Line numbers are 1-indexed and clamped to the file; a reversed range
/// collapses to the end line.
pub fn load_log_excerpt(
    path: &Path,
    start_line: usize,
    end_line: usize,
    config: &AttachmentConfig,
) -> Result<Attachment, AttachmentError> {
    let display = path.display().to_string();
    let meta = std::fs::metadata(path).map_err(|source| AttachmentError::Io {
        path: display.clone(),
        source,
    })?;
    if meta.len() > config.max_file_bytes {
        return Err(AttachmentError::TooLarge {
            path: display,
            size: meta.len(),
            max: config.max_file_bytes,
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| AttachmentError::Io {
        path: display.clone(),
        source,
    })?;
    let lines: Vec<&str> = content.lines().collect();

    let mut start = start_line.max(1);
    let mut end = end_line;
    if end < 1 || end > lines.len() {
        end = lines.len();
    }
    if start > end {
        start = end.max(1);
    }
    let excerpt = if lines.is_empty() {
        String::new()
    } else {
        lines[start - 1..end].join("\n")
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("file".to_string(), serde_json::json!(display));
    metadata.insert("lines".to_string(), serde_json::json!(format!("{start}-{end}")));
    metadata.insert("total_lines".to_string(), serde_json::json!(lines.len()));
    metadata.insert("type".to_string(), serde_json::json!("log_excerpt"));

    Ok(Attachment {
        kind: AttachmentType::File,
        content: excerpt,
        metadata,
    })
}

/// Wrap a diff string as a `git_diff` attachment.
#[must_use]
pub fn diff_attachment(diff: &str, reference: &str) -> Attachment {
    let mut metadata = BTreeMap::new();
    metadata.insert("ref".to_string(), serde_json::json!(reference));
    Attachment {
        kind: AttachmentType::GitDiff,
        content: diff.to_string(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "some notes").unwrap();

        let att = load_file(&path, &AttachmentConfig::default()).unwrap();
        assert_eq!(att.kind, AttachmentType::File);
        assert_eq!(att.content, "some notes");
        assert_eq!(att.metadata["size"], serde_json::json!(10));
    }

    #[test]
    fn test_load_file_detects_diff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("change.txt");
        std::fs::write(&path, "diff --git a/x b/x\n").unwrap();

        let att = load_file(&path, &AttachmentConfig::default()).unwrap();
        assert_eq!(att.kind, AttachmentType::GitDiff);
    }

    #[test]
    fn test_load_file_detects_image_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        std::fs::write(&path, [0x89u8, 0x50, 0x4e, 0x47]).unwrap();

        let att = load_file(&path, &AttachmentConfig::default()).unwrap();
        assert_eq!(att.kind, AttachmentType::Screenshot);
        assert!(att.content.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_size_bound_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![b'x'; 64]).unwrap();

        let config = AttachmentConfig {
            max_file_bytes: 16,
            ..AttachmentConfig::default()
        };
        assert!(matches!(
            load_file(&path, &config),
            Err(AttachmentError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_screenshot_rejects_non_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "text").unwrap();

        assert!(matches!(
            load_screenshot(&path, &AttachmentConfig::default()),
            Err(AttachmentError::NotAnImage { .. })
        ));
    }

    #[test]
    fn test_log_excerpt_clamps_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();

        let att = load_log_excerpt(&path, 2, 3, &AttachmentConfig::default()).unwrap();
        assert_eq!(att.content, "two\nthree");
        assert_eq!(att.metadata["lines"], serde_json::json!("2-3"));
        assert_eq!(att.metadata["total_lines"], serde_json::json!(4));

        // Out-of-range bounds clamp to the file.
        let att = load_log_excerpt(&path, 0, 99, &AttachmentConfig::default()).unwrap();
        assert_eq!(att.content, "one\ntwo\nthree\nfour");
    }

    #[test]
    fn test_context_command_captures_output_and_exit_code() {
        let att = run_context_command("echo out; echo err >&2", &AttachmentConfig::default())
            .unwrap();
        assert_eq!(att.kind, AttachmentType::Context);
        assert!(att.content.contains("out"));
        assert!(att.content.contains("--- stderr ---"));
        assert!(att.content.contains("err"));
        assert_eq!(att.metadata["exit_code"], serde_json::json!(0));
    }

    #[test]
    fn test_context_command_truncates() {
        let config = AttachmentConfig {
            max_output_bytes: 32,
            ..AttachmentConfig::default()
        };
        let att = run_context_command("yes x | head -100", &config).unwrap();
        assert!(att.content.ends_with("... [truncated]"));
    }
}
