//! Command normalization for pattern matching.
//!
//! Reduces a raw shell string to a canonical form the classifier can match:
//! wrapper prefixes (`sudo`, `env`, `nice`, …) are stripped, compound
//! commands are split into segments, and subshell constructs are flagged.
//! Normalization never fails hard — a tokenizer failure falls back to
//! whitespace splitting and sets [`NormalizedCommand::parse_error`], which
//! the classifier treats as a one-step tier upgrade.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// A parsed and normalized command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedCommand {
    /// The original command string, untouched.
    pub original: String,
    /// The primary command: the first segment after wrapper stripping.
    pub primary: String,
    /// Individual command segments of a compound command or pipeline.
    pub segments: Vec<String>,
    /// Whether the command contains separators or pipes.
    pub is_compound: bool,
    /// Whether the command contains `$( … )`, backticks, or a group.
    pub has_subshell: bool,
    /// Wrapper tokens that were stripped, in encounter order.
    pub stripped_wrappers: Vec<String>,
    /// Tokenization failed somewhere; classification must upgrade the tier.
    pub parse_error: bool,
}

/// Wrapper prefixes stripped before matching.
const WRAPPER_PREFIXES: &[&str] = &[
    "sudo", "doas", "env", "command", "builtin", "time", "nice", "ionice", "nohup", "strace",
    "ltrace",
];

static COMPOUND_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:;|&&|\|\||&)\s*").expect("separator regex is valid"));

static PIPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\|\s*").expect("pipe regex is valid"));

// $(...), `...`, or a parenthesized group.
static SUBSHELL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\([^)]+\)|`[^`]+`|\([^)]+\)").expect("subshell regex is valid"));

static ENV_ASSIGN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("env regex is valid"));

/// Parse and normalize a command for pattern matching.
#[must_use]
pub fn normalize_command(cmd: &str) -> NormalizedCommand {
    let mut result = NormalizedCommand {
        original: cmd.to_string(),
        ..NormalizedCommand::default()
    };

    let cmd = cmd.trim();
    if cmd.is_empty() {
        return result;
    }

    result.has_subshell = SUBSHELL_PATTERN.is_match(cmd);

    // Split on compound separators. When the separators sit inside a quoted
    // string (e.g. `psql -c "DELETE ...; DROP ..."`) keep a single segment
    // so the quoted text stays intact for matching.
    let mut segments: Vec<&str> = COMPOUND_SEPARATORS.split(cmd).collect();
    if segments.len() > 1 {
        if cmd.matches('"').count() >= 2 {
            segments = vec![cmd];
        } else {
            result.is_compound = true;
        }
    }

    // Pipes are not compound separators in the shell grammar, but each side
    // of a pipe is a command of its own for risk purposes.
    let mut raw_segments: Vec<String> = Vec::new();
    for seg in segments {
        if PIPE_PATTERN.is_match(seg) {
            result.is_compound = true;
            for part in PIPE_PATTERN.split(seg) {
                let part = part.trim();
                if !part.is_empty() {
                    raw_segments.push(part.to_string());
                }
            }
        } else {
            let seg = seg.trim();
            if !seg.is_empty() {
                raw_segments.push(seg.to_string());
            }
        }
    }

    for seg in &raw_segments {
        let (normalized, wrappers, parse_err) = normalize_segment(seg);
        if parse_err {
            result.parse_error = true;
        }
        if !normalized.is_empty() {
            result.segments.push(normalized);
        }
        result.stripped_wrappers.extend(wrappers);
    }

    if let Some(first) = result.segments.first() {
        result.primary.clone_from(first);
    }

    result
}

/// Strip wrappers from one segment using a shell-aware tokenizer.
///
/// Returns `(normalized, stripped_wrappers, parse_error)`. On tokenizer
/// failure the segment is split on whitespace instead so no data is lost.
fn normalize_segment(seg: &str) -> (String, Vec<String>, bool) {
    let (tokens, parse_err) = match shlex::split(seg) {
        Some(tokens) => (tokens, false),
        None => (seg.split_whitespace().map(str::to_string).collect(), true),
    };

    let mut stripped = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];

        if tok == "env" {
            stripped.push(tok.clone());
            i += 1;
            while i < tokens.len() && ENV_ASSIGN_PATTERN.is_match(&tokens[i]) {
                i += 1;
            }
            continue;
        }

        if WRAPPER_PREFIXES.contains(&tok.as_str()) {
            stripped.push(tok.clone());
            i += 1;
            continue;
        }
        break;
    }

    if i >= tokens.len() {
        return (String::new(), stripped, parse_err);
    }

    (tokens[i..].join(" ").trim().to_string(), stripped, parse_err)
}

static TILDE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)~(/[^\s]*)?").expect("tilde regex is valid"));

static DOT_SLASH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)\.(/[^\s]*)").expect("dot-slash regex is valid"));

static DOT_DOT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)\.\.(/[^\s]*)").expect("dot-dot regex is valid"));

/// Expand relative paths in a command to absolute paths.
///
/// `~` expands against the home directory even when `cwd` is empty; `./`
/// and `../` expand against `cwd` when it is non-empty. Expansion happens
/// only at word boundaries, so flags like `--exclude=./x` are left alone.
#[must_use]
pub fn resolve_paths_in_command(cmd: &str, cwd: &str) -> String {
    let mut cmd = cmd.to_string();

    if let Some(home) = home_dir() {
        cmd = TILDE_PATTERN
            .replace_all(&cmd, |caps: &regex::Captures<'_>| {
                let prefix = caps.get(1).map_or("", |m| m.as_str());
                let suffix = caps
                    .get(2)
                    .map_or("", |m| m.as_str())
                    .trim_start_matches('/');
                let resolved = if suffix.is_empty() {
                    home.clone()
                } else {
                    home.join(suffix)
                };
                format!("{prefix}{}", resolved.display())
            })
            .into_owned();
    }

    if cwd.is_empty() {
        return cmd;
    }

    let cmd = DOT_SLASH_PATTERN.replace_all(&cmd, |caps: &regex::Captures<'_>| {
        let prefix = caps.get(1).map_or("", |m| m.as_str());
        let rest = caps.get(2).map_or("", |m| m.as_str());
        let joined = Path::new(cwd).join(format!(".{rest}"));
        format!("{prefix}{}", clean_path(&joined).display())
    });

    let cmd = DOT_DOT_PATTERN.replace_all(&cmd, |caps: &regex::Captures<'_>| {
        let prefix = caps.get(1).map_or("", |m| m.as_str());
        let rest = caps.get(2).map_or("", |m| m.as_str());
        let joined = Path::new(cwd).join(format!("..{rest}"));
        format!("{prefix}{}", clean_path(&joined).display())
    });

    cmd.into_owned()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Extract just the command name: the basename of the first word.
#[must_use]
pub fn extract_command_name(cmd: &str) -> String {
    let Some(first) = cmd.split_whitespace().next() else {
        return String::new();
    };
    Path::new(first)
        .file_name()
        .map_or_else(|| first.to_string(), |n| n.to_string_lossy().into_owned())
}
