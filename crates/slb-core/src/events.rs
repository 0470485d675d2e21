//! Event model for the daemon stream and the polling fallback.
//!
//! Events are newline-delimited JSON records. Subscribers either receive
//! them pushed from the daemon socket or synthesize the same sequence by
//! polling the store and diffing observed status against a per-subscriber
//! `seen` map; [`evaluate_for_polling`] is the pure decision both the watch
//! loop and the daemon poller share.

use std::collections::HashMap;
use std::fmt;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::types::{Request, RequestStatus};

/// Kinds of events emitted over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new request is awaiting review.
    RequestPending,
    /// A request reached its approval quorum.
    RequestApproved,
    /// A request was rejected.
    RequestRejected,
    /// An approved request was executed (successfully or not).
    RequestExecuted,
    /// A request timed out waiting for reviews.
    RequestTimeout,
    /// A request was cancelled by its requestor.
    RequestCancelled,
}

impl EventKind {
    /// Stable string form used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestPending => "request_pending",
            Self::RequestApproved => "request_approved",
            Self::RequestRejected => "request_rejected",
            Self::RequestExecuted => "request_executed",
            Self::RequestTimeout => "request_timeout",
            Self::RequestCancelled => "request_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One NDJSON event record.
///
/// Context fields (`risk_tier`, `command`, …) are populated for
/// `request_pending`; status-change events carry only the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    /// Event kind.
    pub event: EventKind,
    /// The request the event concerns.
    pub request_id: String,
    /// Risk tier, for pending events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_tier: Option<String>,
    /// Redacted command display, for pending events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Requestor agent name, for pending events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requestor: Option<String>,
    /// RFC 3339 creation time, for pending events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl RequestEvent {
    /// A `request_pending` event with full context from the request row.
    #[must_use]
    pub fn pending(request: &Request) -> Self {
        Self {
            event: EventKind::RequestPending,
            request_id: request.id.clone(),
            risk_tier: Some(request.risk_tier.to_string()),
            command: Some(request.display_command().to_string()),
            requestor: Some(request.requestor_agent.clone()),
            created_at: Some(
                request
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        }
    }

    /// A bare status-change event.
    #[must_use]
    pub fn status_change(event: EventKind, request_id: impl Into<String>) -> Self {
        Self {
            event,
            request_id: request_id.into(),
            risk_tier: None,
            command: None,
            requestor: None,
            created_at: None,
        }
    }
}

/// Outcome of the polling decision for one observed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDecision {
    /// The event to emit, if any.
    pub emit: Option<EventKind>,
    /// Why the decision came out this way.
    pub reason: String,
}

/// Decide what (if anything) to emit for an observed `(request, status)`.
///
/// - Unseen request ⇒ `request_pending`.
/// - Seen, status unchanged ⇒ nothing.
/// - Seen, status changed to a known event-bearing status ⇒ the matching
///   event; `execution_failed` maps to `request_executed` like a successful
///   run (the external contract only says "it ran").
/// - Any other status change ⇒ nothing, with the reason recorded.
///
/// The caller is responsible for updating `seen` afterwards.
#[must_use]
pub fn evaluate_for_polling(
    request_id: &str,
    status: RequestStatus,
    seen: &HashMap<String, RequestStatus>,
) -> PollDecision {
    let Some(previous) = seen.get(request_id) else {
        return PollDecision {
            emit: Some(EventKind::RequestPending),
            reason: "request not seen before".to_string(),
        };
    };

    if *previous == status {
        return PollDecision {
            emit: None,
            reason: format!("status unchanged ({status})"),
        };
    }

    let kind = match status {
        RequestStatus::Approved => EventKind::RequestApproved,
        RequestStatus::Rejected => EventKind::RequestRejected,
        RequestStatus::Executed | RequestStatus::ExecutionFailed => EventKind::RequestExecuted,
        RequestStatus::Timeout => EventKind::RequestTimeout,
        RequestStatus::Cancelled => EventKind::RequestCancelled,
        other => {
            return PollDecision {
                emit: None,
                reason: format!("no event defined for status {other}"),
            };
        }
    };

    PollDecision {
        emit: Some(kind),
        reason: format!("status changed from {previous} to {status}"),
    }
}
