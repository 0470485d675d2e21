//! Per-session request rate limiting.
//!
//! Caps how many requests a single session can have pending at once and how
//! many it can create per minute, so a runaway agent cannot flood the
//! review queue. The check itself is pure; the store supplies the counts.

use serde::{Deserialize, Serialize};

/// What to do when a session exceeds a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    /// Refuse the request with an error.
    #[default]
    Reject,
    /// Accept the request but leave it queued for later submission.
    Queue,
    /// Accept the request and log a warning.
    Warn,
}

impl RateLimitAction {
    /// Parse the config string form; anything unknown falls back to
    /// `Reject` — the limiter fails closed.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "queue" => Self::Queue,
            "warn" => Self::Warn,
            _ => Self::Reject,
        }
    }
}

/// Rate limiter configuration. A cap of zero disables that cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum simultaneously-pending requests per session.
    pub max_pending_per_session: u32,
    /// Maximum requests created per session per minute.
    pub max_requests_per_minute: u32,
    /// Action taken on violation.
    pub action: RateLimitAction,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_pending_per_session: 5,
            max_requests_per_minute: 10,
            action: RateLimitAction::Reject,
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Within limits; proceed.
    Allow,
    /// Over a cap; refuse with the given reason.
    Reject(String),
    /// Over a cap; accept but queue.
    Queue(String),
    /// Over a cap; accept with a warning.
    Warn(String),
}

impl RateLimitDecision {
    /// Whether the request may be persisted now.
    #[must_use]
    pub const fn permits_create(&self) -> bool {
        matches!(self, Self::Allow | Self::Warn(_))
    }
}

/// Check the caps against the session's current counts.
#[must_use]
pub fn check(config: &RateLimitConfig, pending_count: u32, recent_count: u32) -> RateLimitDecision {
    let violation = if config.max_pending_per_session > 0
        && pending_count >= config.max_pending_per_session
    {
        Some(format!(
            "session has {pending_count} pending requests (max {})",
            config.max_pending_per_session
        ))
    } else if config.max_requests_per_minute > 0 && recent_count >= config.max_requests_per_minute {
        Some(format!(
            "session created {recent_count} requests in the last minute (max {})",
            config.max_requests_per_minute
        ))
    } else {
        None
    };

    match violation {
        None => RateLimitDecision::Allow,
        Some(reason) => match config.action {
            RateLimitAction::Reject => RateLimitDecision::Reject(reason),
            RateLimitAction::Queue => RateLimitDecision::Queue(reason),
            RateLimitAction::Warn => RateLimitDecision::Warn(reason),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limits_allows() {
        let config = RateLimitConfig::default();
        assert_eq!(check(&config, 0, 0), RateLimitDecision::Allow);
        assert_eq!(check(&config, 4, 9), RateLimitDecision::Allow);
    }

    #[test]
    fn test_pending_cap_rejects() {
        let config = RateLimitConfig {
            max_pending_per_session: 5,
            ..RateLimitConfig::default()
        };
        let decision = check(&config, 5, 0);
        assert!(matches!(decision, RateLimitDecision::Reject(_)));
        assert!(!decision.permits_create());
    }

    #[test]
    fn test_per_minute_cap_rejects() {
        let config = RateLimitConfig::default();
        assert!(matches!(check(&config, 0, 10), RateLimitDecision::Reject(_)));
    }

    #[test]
    fn test_queue_action() {
        let config = RateLimitConfig {
            action: RateLimitAction::Queue,
            ..RateLimitConfig::default()
        };
        let decision = check(&config, 5, 0);
        assert!(matches!(decision, RateLimitDecision::Queue(_)));
        assert!(!decision.permits_create());
    }

    #[test]
    fn test_warn_action_permits_create() {
        let config = RateLimitConfig {
            action: RateLimitAction::Warn,
            ..RateLimitConfig::default()
        };
        let decision = check(&config, 5, 0);
        assert!(matches!(decision, RateLimitDecision::Warn(_)));
        assert!(decision.permits_create());
    }

    #[test]
    fn test_unknown_action_parses_to_reject() {
        assert_eq!(RateLimitAction::parse("invalid-action"), RateLimitAction::Reject);
        assert_eq!(RateLimitAction::parse("queue"), RateLimitAction::Queue);
        assert_eq!(RateLimitAction::parse("warn"), RateLimitAction::Warn);
    }

    #[test]
    fn test_zero_caps_disable() {
        let config = RateLimitConfig {
            max_pending_per_session: 0,
            max_requests_per_minute: 0,
            action: RateLimitAction::Reject,
        };
        assert_eq!(check(&config, 1000, 1000), RateLimitDecision::Allow);
    }
}
