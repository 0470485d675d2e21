//! Review submission and validation.
//!
//! Enforces the two-person rule: who may review, how reviews are signed,
//! and how conflicting verdicts resolve into a status transition. The
//! validation order matters and is covered by tests — field checks, then
//! session, then request state, then the self-review gate, idempotence, and
//! the different-model policy, before anything is persisted.

use chrono::{Duration, Utc};
use slb_core::config::{ConflictResolution, SlbConfig};
use slb_core::events::{EventKind, RequestEvent};
use slb_core::signature::compute_review_signature;
use slb_core::statemachine::truncate_to_seconds;
use slb_core::types::{Decision, Request, RequestStatus, Review, ReviewResponses};
use tracing::info;

use crate::bus;
use crate::store::{Store, StoreError};
use crate::workspace::ProjectWorkspace;

/// Errors from review submission.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    /// No session id was supplied.
    #[error("session_id is required")]
    SessionRequired,

    /// No request id was supplied.
    #[error("request_id is required")]
    RequestRequired,

    /// The reviewing session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The reviewing session is no longer active.
    #[error("session is not active: {0}")]
    SessionInactive(String),

    /// No decision was supplied (must be approve or reject).
    #[error("invalid decision (must be approve or reject)")]
    InvalidDecision,

    /// The request does not exist.
    #[error("request not found: {0}")]
    RequestNotFound(String),

    /// The request has already left `pending`.
    #[error("request is not pending: status is {0}")]
    RequestNotPending(RequestStatus),

    /// Reviewer and requestor are the same session.
    #[error("cannot review your own request")]
    SelfReview,

    /// A trusted agent tried to self-approve before the delay elapsed.
    #[error("trusted self-approve requires a {required_secs}s delay; {remaining_secs}s remain")]
    SelfApproveTooSoon {
        /// Configured delay.
        required_secs: i64,
        /// Seconds still to wait.
        remaining_secs: i64,
    },

    /// This session already reviewed this request.
    #[error("you have already reviewed this request")]
    AlreadyReviewed,

    /// Approval requires a model different from the requestor's.
    #[error("different model required for approval: your model ({0}) matches the requestor's")]
    RequireDifferentModel(String),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Review policy, derived from [`SlbConfig`].
#[derive(Debug, Clone)]
pub struct ReviewServiceConfig {
    /// How conflicting verdicts resolve.
    pub conflict_resolution: ConflictResolution,
    /// Agents allowed to approve their own requests after the delay.
    pub trusted_self_approve: Vec<String>,
    /// Delay before a trusted agent may self-approve.
    pub trusted_self_approve_delay: Duration,
}

impl Default for ReviewServiceConfig {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::AnyRejectionBlocks,
            trusted_self_approve: Vec::new(),
            trusted_self_approve_delay: Duration::minutes(5),
        }
    }
}

impl From<&SlbConfig> for ReviewServiceConfig {
    fn from(config: &SlbConfig) -> Self {
        Self {
            conflict_resolution: config.review.conflict_resolution,
            trusted_self_approve: config.review.trusted_self_approve.clone(),
            trusted_self_approve_delay: Duration::seconds(
                i64::try_from(config.review.trusted_self_approve_delay_secs).unwrap_or(300),
            ),
        }
    }
}

/// Parameters for [`ReviewService::submit_review`].
#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    /// The reviewing session (required).
    pub session_id: String,
    /// The request being reviewed (required).
    pub request_id: String,
    /// The verdict.
    pub decision: Option<Decision>,
    /// Structured responses.
    pub responses: ReviewResponses,
    /// Free-text comments.
    pub comments: String,
}

/// Result of a submitted review.
#[derive(Debug, Clone)]
pub struct ReviewResult {
    /// The persisted review.
    pub review: Review,
    /// The request status after conflict resolution, when it changed.
    pub new_status: Option<RequestStatus>,
    /// Current approval count, including this review.
    pub approvals: u32,
    /// Current rejection count, including this review.
    pub rejections: u32,
}

/// Aggregate review state for a request.
#[derive(Debug, Clone)]
pub struct ReviewStatus {
    /// Current request status.
    pub request_status: RequestStatus,
    /// Approval count.
    pub approvals: u32,
    /// Rejection count.
    pub rejections: u32,
    /// Required approvals.
    pub min_approvals: u32,
    /// Whether the request still needs approvals.
    pub needs_more_approvals: bool,
    /// All reviews, oldest first.
    pub reviews: Vec<Review>,
}

/// Handles review operations.
pub struct ReviewService {
    store: Store,
    workspace: Option<ProjectWorkspace>,
    config: ReviewServiceConfig,
}

impl ReviewService {
    /// Build a review service over the given store.
    #[must_use]
    pub fn new(
        store: Store,
        workspace: Option<ProjectWorkspace>,
        config: ReviewServiceConfig,
    ) -> Self {
        Self {
            store,
            workspace,
            config,
        }
    }

    /// Validate and submit a review, resolving the request status.
    pub fn submit_review(&self, opts: ReviewOptions) -> Result<ReviewResult, ReviewError> {
        // Step 1: required fields.
        if opts.session_id.is_empty() {
            return Err(ReviewError::SessionRequired);
        }
        if opts.request_id.is_empty() {
            return Err(ReviewError::RequestRequired);
        }
        let Some(decision) = opts.decision else {
            return Err(ReviewError::InvalidDecision);
        };

        // Step 2: session lookup and active check.
        let session = self.store.get_session(&opts.session_id).map_err(|e| match e {
            StoreError::SessionNotFound(id) => ReviewError::SessionNotFound(id),
            other => ReviewError::Store(other),
        })?;
        if !session.is_active() {
            return Err(ReviewError::SessionInactive(session.id));
        }

        // Step 3: request lookup; must still be pending.
        let request = self.store.get_request(&opts.request_id).map_err(|e| match e {
            StoreError::RequestNotFound(id) => ReviewError::RequestNotFound(id),
            other => ReviewError::Store(other),
        })?;
        if request.status != RequestStatus::Pending {
            return Err(ReviewError::RequestNotPending(request.status));
        }

        // Step 4: self-review gate, with the trusted-agent escape hatch.
        if opts.session_id == request.requestor_session_id {
            self.check_trusted_self_approve(&session.agent_name, &request)?;
        }

        // Step 5: idempotence.
        if self.store.has_reviewed(&opts.request_id, &opts.session_id)? {
            return Err(ReviewError::AlreadyReviewed);
        }

        // Step 6: different-model policy applies to approvals only.
        if decision == Decision::Approve
            && request.require_different_model
            && session.model == request.requestor_model
        {
            return Err(ReviewError::RequireDifferentModel(session.model));
        }

        // Step 7: sign and persist.
        let timestamp = truncate_to_seconds(Utc::now());
        let signature =
            compute_review_signature(&session.session_key, &opts.request_id, decision, timestamp);
        let review = Review {
            id: Review::new_id(),
            request_id: opts.request_id.clone(),
            reviewer_session_id: session.id.clone(),
            reviewer_agent: session.agent_name.clone(),
            reviewer_model: session.model.clone(),
            decision,
            signature,
            signature_timestamp: timestamp,
            responses: opts.responses,
            comments: opts.comments,
            created_at: Utc::now(),
        };
        self.store.create_review(&review).map_err(|e| match e {
            StoreError::AlreadyReviewed { .. } => ReviewError::AlreadyReviewed,
            other => ReviewError::Store(other),
        })?;

        // Step 8: recount and apply the conflict policy.
        let (approvals, rejections) = self.store.count_reviews_by_decision(&opts.request_id)?;
        let target = determine_new_status(
            self.config.conflict_resolution,
            &request,
            decision,
            approvals,
            rejections,
        );
        let mut new_status = None;
        if let Some(target) = target {
            let updated = self.store.update_status(&opts.request_id, target)?;
            new_status = Some(updated.status);
            self.announce_status(&updated);
        }

        info!(
            request_id = %opts.request_id,
            decision = %decision,
            approvals,
            rejections,
            "review submitted"
        );
        Ok(ReviewResult {
            review,
            new_status,
            approvals,
            rejections,
        })
    }

    /// Whether a session could review a request right now, with the reason
    /// when it cannot.
    pub fn can_review(&self, session_id: &str, request_id: &str) -> (bool, String) {
        let session = match self.store.get_session(session_id) {
            Ok(s) => s,
            Err(e) => return (false, format!("session not found: {e}")),
        };
        if !session.is_active() {
            return (false, "session is not active".to_string());
        }

        let request = match self.store.get_request(request_id) {
            Ok(r) => r,
            Err(e) => return (false, format!("request not found: {e}")),
        };
        if request.status != RequestStatus::Pending {
            return (
                false,
                format!("request is not pending (status: {})", request.status),
            );
        }

        if session_id == request.requestor_session_id {
            if let Err(e) = self.check_trusted_self_approve(&session.agent_name, &request) {
                return (false, e.to_string());
            }
        }

        match self.store.has_reviewed(request_id, session_id) {
            Ok(true) => (false, "you have already reviewed this request".to_string()),
            Ok(false) => (true, String::new()),
            Err(e) => (false, format!("error checking previous review: {e}")),
        }
    }

    /// Aggregate review state for a request.
    pub fn review_status(&self, request_id: &str) -> Result<ReviewStatus, ReviewError> {
        let request = self.store.get_request(request_id).map_err(|e| match e {
            StoreError::RequestNotFound(id) => ReviewError::RequestNotFound(id),
            other => ReviewError::Store(other),
        })?;
        let reviews = self.store.list_reviews(request_id)?;
        let (approvals, rejections) = self.store.count_reviews_by_decision(request_id)?;
        Ok(ReviewStatus {
            request_status: request.status,
            approvals,
            rejections,
            min_approvals: request.min_approvals,
            needs_more_approvals: approvals < request.min_approvals
                && request.status == RequestStatus::Pending,
            reviews,
        })
    }

    fn check_trusted_self_approve(
        &self,
        agent_name: &str,
        request: &Request,
    ) -> Result<(), ReviewError> {
        if !self
            .config
            .trusted_self_approve
            .iter()
            .any(|trusted| trusted == agent_name)
        {
            return Err(ReviewError::SelfReview);
        }
        let age = Utc::now() - request.created_at;
        let delay = self.config.trusted_self_approve_delay;
        if age < delay {
            return Err(ReviewError::SelfApproveTooSoon {
                required_secs: delay.num_seconds(),
                remaining_secs: (delay - age).num_seconds(),
            });
        }
        Ok(())
    }

    fn announce_status(&self, request: &Request) {
        let Some(ws) = &self.workspace else { return };
        ws.remove_pending_snapshot(&request.id);
        let kind = match request.status {
            RequestStatus::Approved => EventKind::RequestApproved,
            RequestStatus::Rejected => EventKind::RequestRejected,
            // Escalation has no external event; humans find it in the queue.
            _ => return,
        };
        bus::publish_to_daemon(
            &ws.socket_path(),
            &RequestEvent::status_change(kind, request.id.clone()),
        );
    }
}

/// Decide the request's next status under the conflict policy, if any.
fn determine_new_status(
    policy: ConflictResolution,
    request: &Request,
    decision: Decision,
    approvals: u32,
    rejections: u32,
) -> Option<RequestStatus> {
    match policy {
        ConflictResolution::AnyRejectionBlocks => {
            if rejections > 0 {
                Some(RequestStatus::Rejected)
            } else if approvals >= request.min_approvals {
                Some(RequestStatus::Approved)
            } else {
                None
            }
        }
        ConflictResolution::FirstWins => {
            if approvals + rejections == 1 {
                Some(match decision {
                    Decision::Approve => RequestStatus::Approved,
                    Decision::Reject => RequestStatus::Rejected,
                })
            } else {
                None
            }
        }
        ConflictResolution::HumanBreaksTie => {
            if approvals > 0 && rejections > 0 {
                Some(RequestStatus::Escalated)
            } else if approvals >= request.min_approvals {
                Some(RequestStatus::Approved)
            } else if rejections > 0 {
                Some(RequestStatus::Rejected)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slb_core::signature::{generate_session_key, verify_review_signature};
    use slb_core::types::{CommandSpec, Justification, RiskTier, Session};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.db")).unwrap();
        (dir, store)
    }

    fn make_session(store: &Store, agent: &str, model: &str) -> Session {
        let session = Session {
            id: Session::new_id(),
            agent_name: agent.to_string(),
            program: "test".to_string(),
            model: model.to_string(),
            project_path: "/test/project".to_string(),
            active: true,
            session_key: generate_session_key(),
            created_at: Utc::now(),
        };
        store.create_session(&session).unwrap();
        session
    }

    fn make_request(store: &Store, session: &Session, tier: RiskTier, min: u32) -> Request {
        let request = Request {
            id: Request::new_id(),
            requestor_session_id: session.id.clone(),
            requestor_agent: session.agent_name.clone(),
            requestor_model: session.model.clone(),
            command: CommandSpec {
                raw: "git reset --hard HEAD~1".to_string(),
                cwd: "/test/project".to_string(),
                argv: Vec::new(),
                shell: true,
                display_redacted: String::new(),
            },
            command_hash: "hash".to_string(),
            risk_tier: tier,
            status: RequestStatus::Pending,
            min_approvals: min,
            require_different_model: tier == RiskTier::Critical,
            project_path: session.project_path.clone(),
            justification: Justification::default(),
            created_at: truncate_to_seconds(Utc::now()),
            approval_expires_at: None,
            resolved_at: None,
        };
        store.create_request(&request).unwrap();
        request
    }

    fn service(store: &Store) -> ReviewService {
        ReviewService::new(store.clone(), None, ReviewServiceConfig::default())
    }

    fn approve(session: &Session, request: &Request) -> ReviewOptions {
        ReviewOptions {
            session_id: session.id.clone(),
            request_id: request.id.clone(),
            decision: Some(Decision::Approve),
            ..ReviewOptions::default()
        }
    }

    #[test]
    fn test_single_approval_approves_dangerous() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let reviewer = make_session(&store, "agent2", "opus");
        let request = make_request(&store, &requestor, RiskTier::Dangerous, 1);

        let result = service(&store).submit_review(approve(&reviewer, &request)).unwrap();
        assert_eq!(result.new_status, Some(RequestStatus::Approved));
        assert_eq!(result.approvals, 1);

        let updated = store.get_request(&request.id).unwrap();
        assert_eq!(updated.status, RequestStatus::Approved);
        assert!(updated.approval_expires_at.is_some());
    }

    #[test]
    fn test_signature_verifies_against_session_key() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let reviewer = make_session(&store, "agent2", "sonnet");
        let request = make_request(&store, &requestor, RiskTier::Dangerous, 1);

        let result = service(&store).submit_review(approve(&reviewer, &request)).unwrap();
        let review = result.review;
        assert!(verify_review_signature(
            &reviewer.session_key,
            &review.request_id,
            review.decision,
            review.signature_timestamp,
            &review.signature,
        ));
    }

    #[test]
    fn test_self_review_prohibited() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let request = make_request(&store, &requestor, RiskTier::Dangerous, 1);

        let err = service(&store).submit_review(approve(&requestor, &request)).unwrap_err();
        assert!(matches!(err, ReviewError::SelfReview));
    }

    #[test]
    fn test_trusted_self_approve_requires_delay() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "ops-agent", "opus");
        let request = make_request(&store, &requestor, RiskTier::Dangerous, 1);

        let config = ReviewServiceConfig {
            trusted_self_approve: vec!["ops-agent".to_string()],
            trusted_self_approve_delay: Duration::minutes(5),
            ..ReviewServiceConfig::default()
        };
        let service = ReviewService::new(store.clone(), None, config);
        let err = service.submit_review(approve(&requestor, &request)).unwrap_err();
        assert!(matches!(err, ReviewError::SelfApproveTooSoon { .. }));
    }

    #[test]
    fn test_trusted_self_approve_after_delay() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "ops-agent", "opus");
        let request = make_request(&store, &requestor, RiskTier::Dangerous, 1);

        let config = ReviewServiceConfig {
            trusted_self_approve: vec!["ops-agent".to_string()],
            trusted_self_approve_delay: Duration::zero(),
            ..ReviewServiceConfig::default()
        };
        let service = ReviewService::new(store.clone(), None, config);
        let result = service.submit_review(approve(&requestor, &request)).unwrap();
        assert_eq!(result.new_status, Some(RequestStatus::Approved));
    }

    #[test]
    fn test_already_reviewed() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let reviewer = make_session(&store, "agent2", "opus");
        let request = make_request(&store, &requestor, RiskTier::Critical, 2);

        let service = service(&store);
        service.submit_review(approve(&reviewer, &request)).unwrap();
        let err = service.submit_review(approve(&reviewer, &request)).unwrap_err();
        assert!(matches!(err, ReviewError::AlreadyReviewed));
        assert_eq!(store.list_reviews(&request.id).unwrap().len(), 1);
    }

    #[test]
    fn test_require_different_model_blocks_same_model_approval() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let same_model = make_session(&store, "agent2", "opus");
        let request = make_request(&store, &requestor, RiskTier::Critical, 2);

        let err = service(&store)
            .submit_review(approve(&same_model, &request))
            .unwrap_err();
        assert!(matches!(err, ReviewError::RequireDifferentModel(_)));
    }

    #[test]
    fn test_same_model_rejection_is_allowed() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let same_model = make_session(&store, "agent2", "opus");
        let request = make_request(&store, &requestor, RiskTier::Critical, 2);

        let result = service(&store)
            .submit_review(ReviewOptions {
                session_id: same_model.id,
                request_id: request.id,
                decision: Some(Decision::Reject),
                ..ReviewOptions::default()
            })
            .unwrap();
        assert_eq!(result.new_status, Some(RequestStatus::Rejected));
    }

    #[test]
    fn test_critical_needs_two_approvals() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let first = make_session(&store, "agent2", "gpt-4");
        let second = make_session(&store, "agent3", "sonnet");
        let request = make_request(&store, &requestor, RiskTier::Critical, 2);

        let service = service(&store);
        let partial = service.submit_review(approve(&first, &request)).unwrap();
        assert_eq!(partial.new_status, None);
        assert_eq!(store.get_request(&request.id).unwrap().status, RequestStatus::Pending);

        let full = service.submit_review(approve(&second, &request)).unwrap();
        assert_eq!(full.new_status, Some(RequestStatus::Approved));
    }

    #[test]
    fn test_any_rejection_blocks() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let a = make_session(&store, "agent2", "gpt-4");
        let b = make_session(&store, "agent3", "sonnet");
        let c = make_session(&store, "agent4", "gemini");
        let request = make_request(&store, &requestor, RiskTier::Critical, 3);

        let service = service(&store);
        service.submit_review(approve(&a, &request)).unwrap();
        service.submit_review(approve(&b, &request)).unwrap();
        let result = service
            .submit_review(ReviewOptions {
                session_id: c.id,
                request_id: request.id.clone(),
                decision: Some(Decision::Reject),
                ..ReviewOptions::default()
            })
            .unwrap();
        assert_eq!(result.new_status, Some(RequestStatus::Rejected));
    }

    #[test]
    fn test_human_breaks_tie_escalates() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let a = make_session(&store, "agent2", "gpt-4");
        let b = make_session(&store, "agent3", "sonnet");
        let request = make_request(&store, &requestor, RiskTier::Critical, 3);

        let config = ReviewServiceConfig {
            conflict_resolution: ConflictResolution::HumanBreaksTie,
            ..ReviewServiceConfig::default()
        };
        let service = ReviewService::new(store.clone(), None, config);
        service.submit_review(approve(&a, &request)).unwrap();
        let result = service
            .submit_review(ReviewOptions {
                session_id: b.id,
                request_id: request.id.clone(),
                decision: Some(Decision::Reject),
                ..ReviewOptions::default()
            })
            .unwrap();
        assert_eq!(result.new_status, Some(RequestStatus::Escalated));
    }

    #[test]
    fn test_first_wins() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let a = make_session(&store, "agent2", "gpt-4");
        let request = make_request(&store, &requestor, RiskTier::Critical, 2);

        let config = ReviewServiceConfig {
            conflict_resolution: ConflictResolution::FirstWins,
            ..ReviewServiceConfig::default()
        };
        let service = ReviewService::new(store.clone(), None, config);
        let result = service.submit_review(approve(&a, &request)).unwrap();
        assert_eq!(result.new_status, Some(RequestStatus::Approved));
    }

    #[test]
    fn test_review_of_resolved_request_fails() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let reviewer = make_session(&store, "agent2", "gpt-4");
        let request = make_request(&store, &requestor, RiskTier::Dangerous, 1);
        store.update_status(&request.id, RequestStatus::Cancelled).unwrap();

        let err = service(&store).submit_review(approve(&reviewer, &request)).unwrap_err();
        assert!(matches!(err, ReviewError::RequestNotPending(RequestStatus::Cancelled)));
    }

    #[test]
    fn test_can_review() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let reviewer = make_session(&store, "agent2", "gpt-4");
        let request = make_request(&store, &requestor, RiskTier::Dangerous, 1);

        let service = service(&store);
        let (ok, _) = service.can_review(&reviewer.id, &request.id);
        assert!(ok);

        let (ok, reason) = service.can_review(&requestor.id, &request.id);
        assert!(!ok);
        assert!(reason.contains("own request"));

        service.submit_review(approve(&reviewer, &request)).unwrap();
        let (ok, reason) = service.can_review(&reviewer.id, &request.id);
        assert!(!ok);
        assert!(reason.contains("not pending"));
    }

    #[test]
    fn test_review_status() {
        let (_dir, store) = open_store();
        let requestor = make_session(&store, "agent1", "opus");
        let a = make_session(&store, "agent2", "gpt-4");
        let request = make_request(&store, &requestor, RiskTier::Critical, 2);

        let service = service(&store);
        service.submit_review(approve(&a, &request)).unwrap();

        let status = service.review_status(&request.id).unwrap();
        assert_eq!(status.approvals, 1);
        assert_eq!(status.rejections, 0);
        assert_eq!(status.min_approvals, 2);
        assert!(status.needs_more_approvals);
        assert_eq!(status.reviews.len(), 1);
    }
}
