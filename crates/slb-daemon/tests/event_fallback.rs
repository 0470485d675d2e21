//! Polling fallback: with no daemon running, a watcher synthesizes the
//! event stream by diffing store state against its `seen` map. The
//! sequence must match what the daemon would have pushed, with no
//! duplicates across poll cycles.

use std::collections::HashMap;

use chrono::Utc;
use slb_core::events::{EventKind, evaluate_for_polling};
use slb_core::signature::generate_session_key;
use slb_core::types::{Decision, RequestStatus, Session};
use slb_daemon::creator::{CreateRequestOptions, RequestCreator, RequestCreatorConfig};
use slb_daemon::review::{ReviewOptions, ReviewService, ReviewServiceConfig};
use slb_daemon::store::Store;

fn make_session(store: &Store, project: &str, agent: &str, model: &str) -> Session {
    let session = Session {
        id: Session::new_id(),
        agent_name: agent.to_string(),
        program: "test".to_string(),
        model: model.to_string(),
        project_path: project.to_string(),
        active: true,
        session_key: generate_session_key(),
        created_at: Utc::now(),
    };
    store.create_session(&session).unwrap();
    session
}

/// One poll cycle: returns the events that would be emitted, updating
/// `seen` the way the watch loop does.
fn poll(store: &Store, seen: &mut HashMap<String, RequestStatus>) -> Vec<EventKind> {
    let horizon = Utc::now() - chrono::Duration::hours(1);
    let mut emitted = Vec::new();
    for request in store.list_watchable_requests(None, horizon).unwrap() {
        let decision = evaluate_for_polling(&request.id, request.status, seen);
        if let Some(kind) = decision.emit {
            emitted.push(kind);
        }
        seen.insert(request.id.clone(), request.status);
    }
    emitted
}

#[test]
fn polling_watcher_sees_each_lifecycle_event_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("state.db")).unwrap();
    let project = dir.path().display().to_string();

    let requestor = make_session(&store, &project, "agent-a", "opus");
    let reviewer = make_session(&store, &project, "agent-b", "gpt-4");

    let mut seen = HashMap::new();

    // Nothing yet.
    assert!(poll(&store, &mut seen).is_empty());

    // A new pending request appears as exactly one pending event.
    let creator = RequestCreator::new(store.clone(), None, RequestCreatorConfig::default());
    let request = creator
        .create_request(CreateRequestOptions {
            session_id: requestor.id.clone(),
            command: "git reset --hard HEAD~1".to_string(),
            cwd: project.clone(),
            ..CreateRequestOptions::default()
        })
        .unwrap()
        .request
        .unwrap();

    assert_eq!(poll(&store, &mut seen), vec![EventKind::RequestPending]);

    // Re-polling with no change emits nothing.
    assert!(poll(&store, &mut seen).is_empty());
    assert!(poll(&store, &mut seen).is_empty());

    // Approval surfaces as exactly one approved event.
    let reviews = ReviewService::new(store.clone(), None, ReviewServiceConfig::default());
    reviews
        .submit_review(ReviewOptions {
            session_id: reviewer.id,
            request_id: request.id.clone(),
            decision: Some(Decision::Approve),
            ..ReviewOptions::default()
        })
        .unwrap();

    assert_eq!(poll(&store, &mut seen), vec![EventKind::RequestApproved]);
    assert!(poll(&store, &mut seen).is_empty());

    // Execution result: executing emits nothing, the terminal state does.
    store.update_status(&request.id, RequestStatus::Executing).unwrap();
    assert!(poll(&store, &mut seen).is_empty());
    store.update_status(&request.id, RequestStatus::ExecutionFailed).unwrap();
    assert_eq!(poll(&store, &mut seen), vec![EventKind::RequestExecuted]);
    assert!(poll(&store, &mut seen).is_empty());
}

#[test]
fn expired_pending_requests_surface_as_timeout_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("state.db")).unwrap();
    let project = dir.path().display().to_string();
    let requestor = make_session(&store, &project, "agent-a", "opus");

    let creator = RequestCreator::new(store.clone(), None, RequestCreatorConfig::default());
    let request = creator
        .create_request(CreateRequestOptions {
            session_id: requestor.id,
            command: "git clean -fd".to_string(),
            cwd: project,
            ..CreateRequestOptions::default()
        })
        .unwrap()
        .request
        .unwrap();

    let mut seen = HashMap::new();
    assert_eq!(poll(&store, &mut seen), vec![EventKind::RequestPending]);

    // A zero-age cutoff expires everything pending.
    let expired = store.expire_stale_requests(chrono::Duration::zero()).unwrap();
    assert_eq!(expired, vec![request.id.clone()]);

    assert_eq!(poll(&store, &mut seen), vec![EventKind::RequestTimeout]);
    assert!(poll(&store, &mut seen).is_empty());
}
