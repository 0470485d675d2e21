//! The request lifecycle state machine.
//!
//! All status movement goes through [`transition`], which enforces the edge
//! table, stamps `approval_expires_at` on entry to `approved`, and stamps
//! `resolved_at` on entry to a concluding terminal state. An invalid
//! transition leaves the request untouched.
//!
//! ```text
//! ∅        → pending
//! pending  → approved | rejected | cancelled | timeout
//! timeout  → escalated
//! approved → executing | cancelled
//! executing→ executed | execution_failed | timed_out
//! ```
//!
//! `timeout` is deliberately not a resolving state: a timed-out request can
//! still be escalated to a human. A stale `approved` request is not moved to
//! `timeout` either — the executor's TTL gate refuses it instead.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::types::{Request, RequestStatus, RiskTier};

/// How long an approval stays executable for dangerous-tier requests.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::minutes(15);

/// How long an approval stays executable for critical-tier requests.
/// Deliberately shorter: the blast radius justifies a tighter window.
pub const DEFAULT_APPROVAL_TTL_CRITICAL: Duration = Duration::minutes(5);

/// The approval TTL for a tier.
#[must_use]
pub fn approval_ttl(tier: RiskTier) -> Duration {
    match tier {
        RiskTier::Critical => DEFAULT_APPROVAL_TTL_CRITICAL,
        _ => DEFAULT_APPROVAL_TTL,
    }
}

/// Error from [`transition`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The target status equals the current status.
    #[error("request is already {0}")]
    SameState(RequestStatus),
    /// The edge is not in the lifecycle table.
    #[error("cannot transition from {from} to {to}")]
    NotAllowed {
        /// Current status.
        from: RequestStatus,
        /// Requested status.
        to: RequestStatus,
    },
}

/// Whether `from → to` is a legal lifecycle edge.
///
/// `None` is the unborn state: only `∅ → pending` is legal from it.
#[must_use]
pub fn can_transition(from: Option<RequestStatus>, to: RequestStatus) -> bool {
    use RequestStatus::{
        Approved, Cancelled, Escalated, Executed, Executing, ExecutionFailed, Pending, Rejected,
        TimedOut, Timeout,
    };
    match from {
        None => to == Pending,
        Some(Pending) => matches!(to, Approved | Rejected | Cancelled | Timeout),
        Some(Timeout) => to == Escalated,
        Some(Approved) => matches!(to, Executing | Cancelled),
        Some(Executing) => matches!(to, Executed | ExecutionFailed | TimedOut),
        Some(Rejected | Executed | ExecutionFailed | Cancelled | TimedOut | Escalated) => false,
    }
}

/// Whether a status concludes the request (and therefore sets
/// `resolved_at`). `timeout` and `escalated` are not terminal — both can
/// still move or be acted on by a human.
#[must_use]
pub fn is_terminal(status: RequestStatus) -> bool {
    matches!(
        status,
        RequestStatus::Rejected
            | RequestStatus::Executed
            | RequestStatus::ExecutionFailed
            | RequestStatus::Cancelled
            | RequestStatus::TimedOut
    )
}

/// Apply a status transition to a request, stamping timestamps per edge.
///
/// On failure the request is left completely unchanged.
pub fn transition(request: &mut Request, to: RequestStatus) -> Result<(), TransitionError> {
    transition_at(request, to, Utc::now())
}

/// [`transition`] with an explicit clock, for deterministic tests.
pub fn transition_at(
    request: &mut Request,
    to: RequestStatus,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    if request.status == to {
        return Err(TransitionError::SameState(to));
    }
    if !can_transition(Some(request.status), to) {
        return Err(TransitionError::NotAllowed {
            from: request.status,
            to,
        });
    }

    if request.status == RequestStatus::Pending && to == RequestStatus::Approved {
        request.approval_expires_at =
            Some(truncate_to_seconds(now + approval_ttl(request.risk_tier)));
    }
    if is_terminal(to) {
        request.resolved_at = Some(now);
    }
    request.status = to;
    Ok(())
}

/// Drop sub-second precision so stored timestamps are stable across
/// platforms and serialization round-trips.
#[must_use]
pub fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandSpec, Justification};

    fn request(status: RequestStatus, tier: RiskTier) -> Request {
        Request {
            id: Request::new_id(),
            requestor_session_id: "sess-1".to_string(),
            requestor_agent: "agent".to_string(),
            requestor_model: "model".to_string(),
            command: CommandSpec::default(),
            command_hash: String::new(),
            risk_tier: tier,
            status,
            min_approvals: 1,
            require_different_model: false,
            project_path: "/project".to_string(),
            justification: Justification::default(),
            created_at: Utc::now(),
            approval_expires_at: None,
            resolved_at: None,
        }
    }

    #[test]
    fn test_can_transition_table() {
        use RequestStatus::{
            Approved, Cancelled, Escalated, Executed, Executing, ExecutionFailed, Pending,
            Rejected, TimedOut, Timeout,
        };
        let cases: &[(Option<RequestStatus>, RequestStatus, bool)] = &[
            (None, Pending, true),
            (None, Approved, false),
            (Some(Pending), Approved, true),
            (Some(Pending), Rejected, true),
            (Some(Pending), Cancelled, true),
            (Some(Pending), Timeout, true),
            (Some(Pending), Executing, false),
            (Some(Timeout), Escalated, true),
            (Some(Timeout), Approved, false),
            (Some(Approved), Executing, true),
            (Some(Approved), Cancelled, true),
            (Some(Approved), Executed, false),
            (Some(Executing), Executed, true),
            (Some(Executing), ExecutionFailed, true),
            (Some(Executing), TimedOut, true),
            (Some(Executed), Pending, false),
            (Some(Rejected), Approved, false),
            (Some(Cancelled), Approved, false),
        ];
        for (from, to, want) in cases {
            assert_eq!(
                can_transition(*from, *to),
                *want,
                "can_transition({from:?}, {to})"
            );
        }
    }

    #[test]
    fn test_terminal_set() {
        use RequestStatus::{
            Approved, Cancelled, Escalated, Executed, Executing, ExecutionFailed, Pending,
            Rejected, TimedOut, Timeout,
        };
        let cases = [
            (Pending, false),
            (Approved, false),
            (Rejected, true),
            (Executing, false),
            (Executed, true),
            (ExecutionFailed, true),
            (Cancelled, true),
            (Timeout, false),
            (TimedOut, true),
            (Escalated, false),
        ];
        for (status, want) in cases {
            assert_eq!(is_terminal(status), want, "is_terminal({status})");
        }
    }

    #[test]
    fn test_rejected_sets_resolved_at() {
        let mut req = request(RequestStatus::Pending, RiskTier::Dangerous);
        transition(&mut req, RequestStatus::Rejected).unwrap();
        assert_eq!(req.status, RequestStatus::Rejected);
        assert!(req.resolved_at.is_some());
    }

    #[test]
    fn test_timeout_does_not_set_resolved_at() {
        let mut req = request(RequestStatus::Pending, RiskTier::Dangerous);
        transition(&mut req, RequestStatus::Timeout).unwrap();
        assert_eq!(req.status, RequestStatus::Timeout);
        assert!(req.resolved_at.is_none());
    }

    #[test]
    fn test_executed_sets_resolved_at() {
        let mut req = request(RequestStatus::Executing, RiskTier::Dangerous);
        transition(&mut req, RequestStatus::Executed).unwrap();
        assert!(req.resolved_at.is_some());
    }

    #[test]
    fn test_approved_sets_ttl_for_dangerous() {
        let mut req = request(RequestStatus::Pending, RiskTier::Dangerous);
        let before = Utc::now();
        transition(&mut req, RequestStatus::Approved).unwrap();
        let after = Utc::now();

        let expires = req.approval_expires_at.expect("TTL must be stamped");
        assert!(expires >= truncate_to_seconds(before + DEFAULT_APPROVAL_TTL));
        assert!(expires <= after + DEFAULT_APPROVAL_TTL);
    }

    #[test]
    fn test_approved_sets_shorter_ttl_for_critical() {
        let mut req = request(RequestStatus::Pending, RiskTier::Critical);
        let before = Utc::now();
        transition(&mut req, RequestStatus::Approved).unwrap();
        let after = Utc::now();

        let expires = req.approval_expires_at.expect("TTL must be stamped");
        assert!(expires >= truncate_to_seconds(before + DEFAULT_APPROVAL_TTL_CRITICAL));
        assert!(expires <= after + DEFAULT_APPROVAL_TTL_CRITICAL);
        assert!(DEFAULT_APPROVAL_TTL_CRITICAL < DEFAULT_APPROVAL_TTL);
    }

    #[test]
    fn test_invalid_transition_leaves_request_unchanged() {
        let mut req = request(RequestStatus::Pending, RiskTier::Dangerous);
        let err = transition(&mut req, RequestStatus::Executing).unwrap_err();
        assert!(matches!(err, TransitionError::NotAllowed { .. }));
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(req.resolved_at.is_none());
        assert!(req.approval_expires_at.is_none());
    }

    #[test]
    fn test_same_state_transition_is_rejected() {
        let mut req = request(RequestStatus::Pending, RiskTier::Dangerous);
        let err = transition(&mut req, RequestStatus::Pending).unwrap_err();
        assert_eq!(err, TransitionError::SameState(RequestStatus::Pending));
    }
}
