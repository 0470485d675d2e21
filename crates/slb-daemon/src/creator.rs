//! Request creation: validate, classify, redact, hash, persist.
//!
//! The creator is the single entry point for turning a raw command into a
//! persisted authorization request. Nothing is committed until every check
//! has passed — a late failure leaves no row behind.

use chrono::{Duration, Utc};
use slb_core::classify::{Classification, classify_command};
use slb_core::config::SlbConfig;
use slb_core::hash::{compute_command_hash, parse_command_to_argv};
use slb_core::normalize::normalize_command;
use slb_core::ratelimit::{self, RateLimitConfig, RateLimitDecision};
use slb_core::redact::apply_redaction;
use slb_core::statemachine::truncate_to_seconds;
use slb_core::types::{Attachment, CommandSpec, Justification, Request, RequestStatus, RiskTier};
use tracing::{info, warn};

use crate::bus;
use crate::store::{Store, StoreError};
use crate::workspace::ProjectWorkspace;

/// Errors from request creation.
#[derive(Debug, thiserror::Error)]
pub enum CreateRequestError {
    /// No session id was supplied.
    #[error("session_id is required")]
    SessionRequired,

    /// No command was supplied.
    #[error("command is required")]
    CommandRequired,

    /// The session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but is no longer active.
    #[error("session is not active: {0}")]
    SessionInactive(String),

    /// The session's agent is on the block list.
    #[error("agent {0} is blocked from creating requests")]
    AgentBlocked(String),

    /// The session exceeded a rate cap.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creator policy, derived from [`SlbConfig`].
#[derive(Debug, Clone, Default)]
pub struct RequestCreatorConfig {
    /// Agents that may not create requests.
    pub blocked_agents: Vec<String>,
    /// Whether the quorum shrinks with the live reviewer pool.
    pub dynamic_quorum_enabled: bool,
    /// Lower bound for the dynamic quorum.
    pub dynamic_quorum_floor: u32,
    /// Extra redaction patterns.
    pub redaction_patterns: Vec<String>,
    /// Per-session caps.
    pub rate_limits: RateLimitConfig,
}

impl From<&SlbConfig> for RequestCreatorConfig {
    fn from(config: &SlbConfig) -> Self {
        Self {
            blocked_agents: config.agents.blocked.clone(),
            dynamic_quorum_enabled: config.quorum.dynamic_enabled,
            dynamic_quorum_floor: config.quorum.floor,
            redaction_patterns: config.redaction.patterns.clone(),
            rate_limits: config.rate_limits,
        }
    }
}

/// Parameters for [`RequestCreator::create_request`].
#[derive(Debug, Clone, Default)]
pub struct CreateRequestOptions {
    /// The requesting session (required).
    pub session_id: String,
    /// The raw command (required).
    pub command: String,
    /// Working directory the command will run in.
    pub cwd: String,
    /// Justification fields shown to reviewers.
    pub justification: Justification,
    /// Evidence to attach.
    pub attachments: Vec<Attachment>,
}

/// Result of [`RequestCreator::create_request`].
#[derive(Debug, Clone)]
pub struct CreateRequestResult {
    /// True when the command classified safe and no request was needed.
    pub skipped: bool,
    /// The persisted request, absent when skipped.
    pub request: Option<Request>,
    /// The classifier verdict either way.
    pub classification: Classification,
}

/// Creates authorization requests.
pub struct RequestCreator {
    store: Store,
    workspace: Option<ProjectWorkspace>,
    config: RequestCreatorConfig,
}

impl RequestCreator {
    /// Build a creator over the given store.
    ///
    /// When a workspace is supplied, pending snapshots are materialized and
    /// a `request_pending` event is published to a running daemon.
    #[must_use]
    pub fn new(
        store: Store,
        workspace: Option<ProjectWorkspace>,
        config: RequestCreatorConfig,
    ) -> Self {
        Self {
            store,
            workspace,
            config,
        }
    }

    /// Create a request for a command, or report it safe to run directly.
    pub fn create_request(
        &self,
        opts: CreateRequestOptions,
    ) -> Result<CreateRequestResult, CreateRequestError> {
        if opts.session_id.is_empty() {
            return Err(CreateRequestError::SessionRequired);
        }
        if opts.command.trim().is_empty() {
            return Err(CreateRequestError::CommandRequired);
        }

        let session = self.store.get_session(&opts.session_id).map_err(|e| match e {
            StoreError::SessionNotFound(id) => CreateRequestError::SessionNotFound(id),
            other => CreateRequestError::Store(other),
        })?;
        if !session.is_active() {
            return Err(CreateRequestError::SessionInactive(session.id));
        }
        if self.config.blocked_agents.contains(&session.agent_name) {
            return Err(CreateRequestError::AgentBlocked(session.agent_name));
        }

        let normalized = normalize_command(&opts.command);
        let classification = classify_command(&normalized);

        if classification.tier == RiskTier::Safe {
            info!(command = %opts.command, "command classified safe, no request needed");
            return Ok(CreateRequestResult {
                skipped: true,
                request: None,
                classification,
            });
        }

        self.enforce_rate_limits(&session.id)?;

        let display_redacted = apply_redaction(&opts.command, &self.config.redaction_patterns);
        let (argv, shell) = if normalized.is_compound || normalized.has_subshell {
            (Vec::new(), true)
        } else {
            match parse_command_to_argv(&opts.command) {
                Ok(argv) => (argv, false),
                Err(_) => (Vec::new(), true),
            }
        };

        let command = CommandSpec {
            raw: opts.command.clone(),
            cwd: opts.cwd.clone(),
            argv,
            shell,
            display_redacted,
        };
        let command_hash = compute_command_hash(&command);

        let static_min = classification.tier.min_approvals();
        let min_approvals =
            self.dynamic_quorum(classification.tier, static_min, &session.project_path)?;

        let request = Request {
            id: Request::new_id(),
            requestor_session_id: session.id.clone(),
            requestor_agent: session.agent_name.clone(),
            requestor_model: session.model.clone(),
            command,
            command_hash,
            risk_tier: classification.tier,
            status: RequestStatus::Pending,
            min_approvals,
            require_different_model: classification.tier == RiskTier::Critical,
            project_path: session.project_path.clone(),
            justification: opts.justification,
            created_at: truncate_to_seconds(Utc::now()),
            approval_expires_at: None,
            resolved_at: None,
        };

        self.store
            .create_request_with_attachments(&request, &opts.attachments)?;

        if let Some(ws) = &self.workspace {
            if let Err(err) = ws.write_pending_snapshot(&request) {
                warn!(request_id = %request.id, %err, "could not write pending snapshot");
            }
            bus::publish_to_daemon(
                &ws.socket_path(),
                &slb_core::events::RequestEvent::pending(&request),
            );
        }

        info!(
            request_id = %request.id,
            tier = %request.risk_tier,
            min_approvals = request.min_approvals,
            "request created"
        );
        Ok(CreateRequestResult {
            skipped: false,
            request: Some(request),
            classification,
        })
    }

    /// Effective quorum for a tier: when dynamic quorum is enabled, the
    /// static requirement shrinks toward the floor as fewer independent
    /// reviewers are online (`active sessions − 1`, excluding the
    /// requestor), so a critical request cannot deadlock a two-agent
    /// project.
    pub fn dynamic_quorum(
        &self,
        tier: RiskTier,
        static_min: u32,
        project_path: &str,
    ) -> Result<u32, CreateRequestError> {
        if !self.config.dynamic_quorum_enabled || tier == RiskTier::Safe {
            return Ok(static_min);
        }
        let active = self.store.count_active_sessions(project_path)?;
        let available = active.saturating_sub(1);
        let effective = static_min.min(available.max(self.config.dynamic_quorum_floor));
        Ok(effective)
    }

    fn enforce_rate_limits(&self, session_id: &str) -> Result<(), CreateRequestError> {
        let pending = self.store.count_pending_for_session(session_id)?;
        let recent = self
            .store
            .count_recent_for_session(session_id, Utc::now() - Duration::minutes(1))?;
        match ratelimit::check(&self.config.rate_limits, pending, recent) {
            RateLimitDecision::Allow => Ok(()),
            RateLimitDecision::Warn(reason) => {
                warn!(session_id, reason, "rate cap exceeded, proceeding per policy");
                Ok(())
            }
            RateLimitDecision::Reject(reason) | RateLimitDecision::Queue(reason) => {
                Err(CreateRequestError::RateLimited(reason))
            }
        }
    }
}
