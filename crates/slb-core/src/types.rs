//! Persisted entity types shared across the workspace.
//!
//! All wire and database representations use `snake_case` string forms; the
//! enums here round-trip through serde with the same names the NDJSON event
//! stream and the SQLite store use.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk tier assigned to a command by the classifier.
///
/// Tiers are ordered by the privilege required to release the command:
/// `Safe < Caution < Dangerous < Critical`. The maximum tier across the
/// segments of a compound command wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// No request needed; the caller may execute directly.
    Safe,
    /// Eligible for automated approval by a watching reviewer.
    Caution,
    /// Requires one peer approval.
    Dangerous,
    /// Requires at least two approvals from a different model.
    Critical,
}

impl RiskTier {
    /// Stable string form used in the store and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Caution => "caution",
            Self::Dangerous => "dangerous",
            Self::Critical => "critical",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe" => Some(Self::Safe),
            "caution" => Some(Self::Caution),
            "dangerous" => Some(Self::Dangerous),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// The next tier up; `Critical` saturates.
    ///
    /// Used by the classifier when a parse error or subshell forces an
    /// upgrade — upgrades never downgrade.
    #[must_use]
    pub const fn upgraded(self) -> Self {
        match self {
            Self::Safe => Self::Caution,
            Self::Caution => Self::Dangerous,
            Self::Dangerous | Self::Critical => Self::Critical,
        }
    }

    /// Minimum approvals policy for this tier.
    #[must_use]
    pub const fn min_approvals(self) -> u32 {
        match self {
            Self::Safe => 0,
            Self::Caution | Self::Dangerous => 1,
            Self::Critical => 2,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting reviews.
    Pending,
    /// Review quorum reached; executable until the approval TTL lapses.
    Approved,
    /// A review (or the conflict policy) rejected the request.
    Rejected,
    /// The executor has claimed the approval and is spawning the child.
    Executing,
    /// Child exited with status 0.
    Executed,
    /// Child exited non-zero.
    ExecutionFailed,
    /// Withdrawn by the requestor before execution.
    Cancelled,
    /// No quorum before the request timeout; may still be escalated.
    Timeout,
    /// Execution was interrupted or exceeded its run deadline.
    TimedOut,
    /// Handed to a human after a review conflict or timeout.
    Escalated,
}

impl RequestStatus {
    /// Stable string form used in the store and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::ExecutionFailed => "execution_failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::TimedOut => "timed_out",
            Self::Escalated => "escalated",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "executing" => Some(Self::Executing),
            "executed" => Some(Self::Executed),
            "execution_failed" => Some(Self::ExecutionFailed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            "timed_out" => Some(Self::TimedOut),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reviewer's verdict on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Release the command for execution (subject to quorum).
    Approve,
    /// Block the command.
    Reject,
}

impl Decision {
    /// Stable string form used in the store and signature preimage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated agent session.
///
/// Created by `slb auth`; carries the HMAC key material used to sign this
/// session's reviews. Only active sessions may create requests or reviews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier (`sess-<uuid>`).
    pub id: String,
    /// Agent name chosen at authentication (e.g. `claude-backend`).
    pub agent_name: String,
    /// The driving program (e.g. `claude-code`).
    pub program: String,
    /// Model identifier, compared for the different-model policy.
    pub model: String,
    /// Project the session is scoped to.
    pub project_path: String,
    /// Whether the session may create requests and reviews.
    pub active: bool,
    /// Hex-encoded 32-byte HMAC key. Never leaves the host.
    pub session_key: String,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Generate a fresh session identifier.
    #[must_use]
    pub fn new_id() -> String {
        format!("sess-{}", Uuid::new_v4())
    }

    /// Whether the session may create requests and reviews.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }
}

/// The exact command invocation a request authorizes.
///
/// The tuple `(raw, cwd, argv, shell)` is canonically serialized and hashed
/// (SHA-256) to produce the request's `command_hash`; an approval is only
/// valid for a spec that rehashes to the same value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// The raw command line as submitted.
    pub raw: String,
    /// Working directory the command will run in.
    pub cwd: String,
    /// Parsed argument vector, when shell interpretation is not required.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Whether the command must run through `sh -c`.
    pub shell: bool,
    /// Redacted form shown to reviewers; the raw form never leaves the host.
    #[serde(default)]
    pub display_redacted: String,
}

/// Why the requestor believes the command should run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Justification {
    /// Why the command is needed.
    #[serde(default)]
    pub reason: String,
    /// What the requestor expects the command to change.
    #[serde(default)]
    pub expected_effect: String,
    /// The larger goal this serves.
    #[serde(default)]
    pub goal: String,
    /// Why the requestor believes the command is safe.
    #[serde(default)]
    pub safety_argument: String,
}

/// An authorization request for one command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request identifier (`req-<uuid>`).
    pub id: String,
    /// Session that created the request.
    pub requestor_session_id: String,
    /// Agent name of the requestor, denormalized for display.
    pub requestor_agent: String,
    /// Model of the requestor, compared by the different-model policy.
    pub requestor_model: String,
    /// The command this request authorizes.
    pub command: CommandSpec,
    /// SHA-256 over the canonical [`CommandSpec`] bytes.
    pub command_hash: String,
    /// Classifier verdict.
    pub risk_tier: RiskTier,
    /// Lifecycle status.
    pub status: RequestStatus,
    /// Approvals required before `pending → approved`.
    pub min_approvals: u32,
    /// Approvals must come from a model different from the requestor's.
    pub require_different_model: bool,
    /// Project the request belongs to.
    pub project_path: String,
    /// Requestor-supplied justification fields.
    #[serde(default)]
    pub justification: Justification,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
    /// Set on entry to `approved`; execution must start before this.
    pub approval_expires_at: Option<DateTime<Utc>>,
    /// Set exactly on entry to a concluding terminal state.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Generate a fresh request identifier.
    #[must_use]
    pub fn new_id() -> String {
        format!("req-{}", Uuid::new_v4())
    }

    /// The command text reviewers should see: the redacted display form
    /// when redaction applied, otherwise the raw command.
    #[must_use]
    pub fn display_command(&self) -> &str {
        if self.command.display_redacted.is_empty() {
            &self.command.raw
        } else {
            &self.command.display_redacted
        }
    }
}

/// Structured answers a reviewer gives alongside the decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewResponses {
    /// Reviewer confirms having read the justification.
    #[serde(default)]
    pub risk_acknowledged: bool,
    /// Alternatives the reviewer considered or suggests.
    #[serde(default)]
    pub alternatives_considered: String,
}

/// One reviewer's signed verdict on a request.
///
/// At most one review exists per `(request, reviewer session)` pair; the
/// signature binds `(request_id, decision, timestamp)` to the reviewer's
/// session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    /// Unique review identifier (`rev-<uuid>`).
    pub id: String,
    /// Request being reviewed.
    pub request_id: String,
    /// Session that submitted the review.
    pub reviewer_session_id: String,
    /// Agent name of the reviewer.
    pub reviewer_agent: String,
    /// Model of the reviewer.
    pub reviewer_model: String,
    /// The verdict.
    pub decision: Decision,
    /// Hex HMAC-SHA256 over `(request_id, decision, timestamp)`.
    pub signature: String,
    /// Wall-clock time the signature covers (UTC, second precision).
    pub signature_timestamp: DateTime<Utc>,
    /// Structured responses.
    #[serde(default)]
    pub responses: ReviewResponses,
    /// Free-text comments.
    #[serde(default)]
    pub comments: String,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
}

impl Review {
    /// Generate a fresh review identifier.
    #[must_use]
    pub fn new_id() -> String {
        format!("rev-{}", Uuid::new_v4())
    }
}

/// Kind of evidence attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentType {
    /// Arbitrary text file content.
    File,
    /// Image encoded as a base64 data URI.
    Screenshot,
    /// Captured output of a context command.
    Context,
    /// A unified diff.
    GitDiff,
}

impl AttachmentType {
    /// Stable string form used in the store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Screenshot => "screenshot",
            Self::Context => "context",
            Self::GitDiff => "git_diff",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "screenshot" => Some(Self::Screenshot),
            "context" => Some(Self::Context),
            "git_diff" => Some(Self::GitDiff),
            _ => None,
        }
    }
}

impl fmt::Display for AttachmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evidence attached to a request, owned by its parent request row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Kind of attachment.
    pub kind: AttachmentType,
    /// Text content, or a base64 data URI for screenshots.
    pub content: String,
    /// Kind-specific metadata (source path, exit code, dimensions, …).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_tier_ordering() {
        assert!(RiskTier::Safe < RiskTier::Caution);
        assert!(RiskTier::Caution < RiskTier::Dangerous);
        assert!(RiskTier::Dangerous < RiskTier::Critical);
    }

    #[test]
    fn test_risk_tier_upgrade_saturates() {
        assert_eq!(RiskTier::Safe.upgraded(), RiskTier::Caution);
        assert_eq!(RiskTier::Dangerous.upgraded(), RiskTier::Critical);
        assert_eq!(RiskTier::Critical.upgraded(), RiskTier::Critical);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Rejected,
            RequestStatus::Executing,
            RequestStatus::Executed,
            RequestStatus::ExecutionFailed,
            RequestStatus::Cancelled,
            RequestStatus::Timeout,
            RequestStatus::TimedOut,
            RequestStatus::Escalated,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("bogus"), None);
    }

    #[test]
    fn test_tier_serde_names() {
        let json = serde_json::to_string(&RiskTier::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let tier: RiskTier = serde_json::from_str("\"execution_failed\"").unwrap_or(RiskTier::Safe);
        assert_eq!(tier, RiskTier::Safe);
    }

    #[test]
    fn test_min_approvals_policy() {
        assert_eq!(RiskTier::Safe.min_approvals(), 0);
        assert_eq!(RiskTier::Caution.min_approvals(), 1);
        assert_eq!(RiskTier::Dangerous.min_approvals(), 1);
        assert_eq!(RiskTier::Critical.min_approvals(), 2);
    }

    #[test]
    fn test_display_command_prefers_redacted() {
        let mut req = sample_request();
        assert_eq!(req.display_command(), "echo hello");
        req.command.display_redacted = "echo [REDACTED]".to_string();
        assert_eq!(req.display_command(), "echo [REDACTED]");
    }

    fn sample_request() -> Request {
        Request {
            id: Request::new_id(),
            requestor_session_id: Session::new_id(),
            requestor_agent: "agent".to_string(),
            requestor_model: "model".to_string(),
            command: CommandSpec {
                raw: "echo hello".to_string(),
                ..CommandSpec::default()
            },
            command_hash: String::new(),
            risk_tier: RiskTier::Dangerous,
            status: RequestStatus::Pending,
            min_approvals: 1,
            require_different_model: false,
            project_path: "/project".to_string(),
            justification: Justification::default(),
            created_at: Utc::now(),
            approval_expires_at: None,
            resolved_at: None,
        }
    }
}
