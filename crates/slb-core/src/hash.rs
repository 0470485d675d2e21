//! Command hashing: binds approvals to the exact invocation.
//!
//! A [`CommandSpec`] is serialized into canonical bytes (domain-prefixed,
//! length-framed, stable across platforms) and hashed with SHA-256. The
//! executor recomputes the hash immediately before spawning and refuses to
//! run if it no longer matches the one the reviewers approved.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::CommandSpec;

/// Domain prefix for the canonical command-spec encoding.
const COMMAND_SPEC_DOMAIN: &[u8] = b"slb.command_spec.v1\n";

/// Compute the SHA-256 hash of a command spec's canonical bytes (hex).
///
/// Deterministic: identical `(raw, cwd, argv, shell)` tuples hash
/// identically on every platform. The derived `display_redacted` field is
/// not part of the identity.
#[must_use]
pub fn compute_command_hash(spec: &CommandSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(COMMAND_SPEC_DOMAIN);
    update_framed(&mut hasher, spec.raw.as_bytes());
    update_framed(&mut hasher, spec.cwd.as_bytes());
    hasher.update(u64::try_from(spec.argv.len()).unwrap_or(u64::MAX).to_be_bytes());
    for arg in &spec.argv {
        update_framed(&mut hasher, arg.as_bytes());
    }
    hasher.update([u8::from(spec.shell)]);
    hex::encode(hasher.finalize())
}

/// Length-frame a field so adjacent fields can never collide.
fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update(u64::try_from(bytes.len()).unwrap_or(u64::MAX).to_be_bytes());
    hasher.update(bytes);
}

/// Error from [`parse_command_to_argv`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseArgvError {
    /// The command could not be tokenized (unterminated quote or escape).
    #[error("command does not tokenize as shell words: {0:?}")]
    Tokenize(String),
    /// The command contained no words at all.
    #[error("command is empty")]
    Empty,
}

/// Split a command into an argument vector using POSIX shell-word rules.
pub fn parse_command_to_argv(cmd: &str) -> Result<Vec<String>, ParseArgvError> {
    let argv = shlex::split(cmd).ok_or_else(|| ParseArgvError::Tokenize(cmd.to_string()))?;
    if argv.is_empty() {
        return Err(ParseArgvError::Empty);
    }
    Ok(argv)
}
