//! HMAC review signatures.
//!
//! Every review is signed with the reviewer session's key over
//! `(request_id, decision, timestamp)`, so a stored review can be verified
//! against the session that produced it and cannot be re-bound to another
//! request or decision. Keys are 32 random bytes, hex-encoded at rest;
//! verification compares in constant time.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::types::Decision;

type HmacSha256 = Hmac<Sha256>;

/// Length of a session signing key in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Generate a fresh hex-encoded session signing key.
#[must_use]
pub fn generate_session_key() -> String {
    let mut key = [0u8; SESSION_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

/// Compute the hex HMAC-SHA256 signature for a review.
///
/// The preimage is `request_id ‖ '\n' ‖ decision ‖ '\n' ‖ timestamp`, with
/// the timestamp rendered as RFC 3339 UTC at second precision — the same
/// form the store persists, so a loaded review re-verifies byte-for-byte.
#[must_use]
pub fn compute_review_signature(
    session_key: &str,
    request_id: &str,
    decision: Decision,
    timestamp: DateTime<Utc>,
) -> String {
    let mut mac = HmacSha256::new_from_slice(session_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(request_id.as_bytes());
    mac.update(b"\n");
    mac.update(decision.as_str().as_bytes());
    mac.update(b"\n");
    mac.update(
        timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .as_bytes(),
    );
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a review signature in constant time.
#[must_use]
pub fn verify_review_signature(
    session_key: &str,
    request_id: &str,
    decision: Decision,
    timestamp: DateTime<Utc>,
    signature: &str,
) -> bool {
    let expected = compute_review_signature(session_key, request_id, decision, timestamp);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_session_key_is_random_hex() {
        let a = generate_session_key();
        let b = generate_session_key();
        assert_eq!(a.len(), SESSION_KEY_LEN * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_signature_round_trip() {
        let key = generate_session_key();
        let ts = Utc::now();
        let sig = compute_review_signature(&key, "req-1", Decision::Approve, ts);
        assert!(verify_review_signature(&key, "req-1", Decision::Approve, ts, &sig));
    }

    #[test]
    fn test_signature_binds_request_decision_and_key() {
        let key = generate_session_key();
        let other_key = generate_session_key();
        let ts = Utc::now();
        let sig = compute_review_signature(&key, "req-1", Decision::Approve, ts);

        assert!(!verify_review_signature(&key, "req-2", Decision::Approve, ts, &sig));
        assert!(!verify_review_signature(&key, "req-1", Decision::Reject, ts, &sig));
        assert!(!verify_review_signature(&other_key, "req-1", Decision::Approve, ts, &sig));
    }

    #[test]
    fn test_signature_stable_at_second_precision() {
        let key = generate_session_key();
        let ts = Utc::now();
        let truncated = crate::statemachine::truncate_to_seconds(ts);
        let sig = compute_review_signature(&key, "req-1", Decision::Approve, ts);
        let sig_truncated = compute_review_signature(&key, "req-1", Decision::Approve, truncated);
        assert_eq!(sig, sig_truncated);
    }
}
