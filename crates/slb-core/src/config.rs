//! Configuration file handling.
//!
//! `slb` reads a TOML configuration from `.slb/config.toml` inside the
//! project (or a path given with `--config`). Every field has a default, so
//! a missing file yields a fully working configuration; CLI flags override
//! file values.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::RateLimitConfig;

/// How conflicting reviews resolve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Any rejection blocks the request, regardless of approvals.
    #[default]
    AnyRejectionBlocks,
    /// The very first review decides the outcome.
    FirstWins,
    /// A mix of approvals and rejections escalates to a human.
    HumanBreaksTie,
}

/// Error loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("parsing config {path}: {source}")]
    Parse {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlbConfig {
    /// Timeouts and polling cadence.
    pub general: GeneralConfig,
    /// Review conflict policy and trusted self-approval.
    pub review: ReviewConfig,
    /// Dynamic quorum controls.
    pub quorum: QuorumConfig,
    /// Per-session request caps.
    pub rate_limits: RateLimitConfig,
    /// Extra redaction patterns.
    pub redaction: RedactionConfig,
    /// Agent block list.
    pub agents: AgentsConfig,
    /// Rollback capture behavior.
    pub rollback: RollbackConfig,
}

/// `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// How long a pending request waits for quorum before timing out, in
    /// seconds.
    pub request_timeout_secs: u64,
    /// Poll interval for the executor and the watch fallback, in
    /// milliseconds.
    pub poll_interval_ms: u64,
    /// Hours before an idle session is deactivated. Zero keeps sessions
    /// alive until ended explicitly.
    pub session_ttl_hours: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 1800,
            poll_interval_ms: 2000,
            session_ttl_hours: 72,
        }
    }
}

/// `[review]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Conflict resolution policy.
    pub conflict_resolution: ConflictResolution,
    /// Agents allowed to approve their own requests after the delay.
    pub trusted_self_approve: Vec<String>,
    /// Delay before a trusted agent may self-approve, in seconds.
    pub trusted_self_approve_delay_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::AnyRejectionBlocks,
            trusted_self_approve: Vec::new(),
            trusted_self_approve_delay_secs: 300,
        }
    }
}

/// `[quorum]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Whether the effective quorum shrinks with the live reviewer pool.
    pub dynamic_enabled: bool,
    /// Lower bound the dynamic quorum never drops below.
    pub floor: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            dynamic_enabled: false,
            floor: 1,
        }
    }
}

/// `[redaction]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// User-supplied regex patterns redacted in addition to the built-ins.
    pub patterns: Vec<String>,
}

/// `[agents]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Agent names that may not create requests.
    pub blocked: Vec<String>,
}

/// `[rollback]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Whether pre-execution capture runs at all.
    pub enabled: bool,
    /// Hours to keep capture directories before garbage collection.
    pub retention_hours: u64,
    /// Upper bound for a single capture, in bytes.
    pub max_size_bytes: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_hours: 24,
            max_size_bytes: 100 * 1024 * 1024,
        }
    }
}

impl SlbConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load from a file when it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SlbConfig::default();
        assert_eq!(config.general.request_timeout_secs, 1800);
        assert_eq!(config.review.conflict_resolution, ConflictResolution::AnyRejectionBlocks);
        assert!(!config.quorum.dynamic_enabled);
        assert_eq!(config.rate_limits.max_pending_per_session, 5);
        assert!(config.rollback.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[review]
conflict_resolution = "human_breaks_tie"
trusted_self_approve = ["ops-agent"]

[quorum]
dynamic_enabled = true
floor = 2
"#,
        )
        .unwrap();

        let config = SlbConfig::from_file(&path).unwrap();
        assert_eq!(config.review.conflict_resolution, ConflictResolution::HumanBreaksTie);
        assert_eq!(config.review.trusted_self_approve, vec!["ops-agent"]);
        assert!(config.quorum.dynamic_enabled);
        assert_eq!(config.quorum.floor, 2);
        // untouched sections keep defaults
        assert_eq!(config.general.poll_interval_ms, 2000);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = SlbConfig::load_or_default(Path::new("/nonexistent/slb.toml")).unwrap();
        assert_eq!(config.rate_limits.max_requests_per_minute, 10);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(matches!(
            SlbConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
