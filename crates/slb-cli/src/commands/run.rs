//! `slb run` — create a request, poll for approval, execute.
//!
//! The executor half of the gate. A safe command runs immediately; anything
//! riskier becomes a request that must reach `approved` before the child is
//! spawned. Immediately before spawning, the approval is re-verified:
//! status, TTL, and the command-hash binding all have to hold, otherwise
//! the user is told to file a fresh request.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use slb_core::attachment::{self, AttachmentConfig};
use slb_core::events::{EventKind, RequestEvent};
use slb_core::hash::compute_command_hash;
use slb_core::types::{Attachment, CommandSpec, Justification, Request, RequestStatus};
use slb_daemon::bus;
use slb_daemon::creator::{CreateRequestError, CreateRequestOptions, RequestCreator};
use slb_daemon::rollback::{self, CaptureOptions};
use tracing::{info, warn};

use super::CliError;
use crate::CommandContext;

/// Arguments for `slb run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// The command to run
    pub command: String,

    /// Why the command is needed
    #[arg(long, default_value = "")]
    pub reason: String,

    /// What the command is expected to change
    #[arg(long, default_value = "")]
    pub expected_effect: String,

    /// The larger goal this serves
    #[arg(long, default_value = "")]
    pub goal: String,

    /// Why the command is believed safe
    #[arg(long, default_value = "")]
    pub safety: String,

    /// Seconds to wait for approval before giving up
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Submit the request and return immediately instead of polling
    #[arg(long = "yield")]
    pub yield_after_submit: bool,

    /// Attach a file as evidence (repeatable)
    #[arg(long = "attach-file")]
    pub attach_file: Vec<PathBuf>,

    /// Run a command and attach its output (repeatable)
    #[arg(long = "attach-context")]
    pub attach_context: Vec<String>,

    /// Attach an image as a screenshot (repeatable)
    #[arg(long = "attach-screenshot")]
    pub attach_screenshot: Vec<PathBuf>,
}

/// What the poller should do for an observed request status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDecision {
    /// Spawn the child now.
    pub should_execute: bool,
    /// Keep polling.
    pub should_continue_polling: bool,
    /// Why the decision came out this way.
    pub reason: String,
}

/// The executor's polling decision table.
///
/// Only `approved` executes; only `pending` keeps polling; every other
/// status is terminal for this invocation.
#[must_use]
pub fn evaluate_for_execution(status: RequestStatus) -> ExecutionDecision {
    match status {
        RequestStatus::Approved => ExecutionDecision {
            should_execute: true,
            should_continue_polling: false,
            reason: "request approved".to_string(),
        },
        RequestStatus::Pending => ExecutionDecision {
            should_execute: false,
            should_continue_polling: true,
            reason: "request still pending".to_string(),
        },
        other => ExecutionDecision {
            should_execute: false,
            should_continue_polling: false,
            reason: format!("terminal status: {other}"),
        },
    }
}

/// Entry point for `slb run`.
pub fn run(ctx: &CommandContext, args: &RunArgs) -> Result<()> {
    let session_id = ctx.require_session_id()?;
    let attachments = load_attachments(args)?;

    let creator = RequestCreator::new(
        ctx.store.clone(),
        Some(ctx.workspace.clone()),
        (&ctx.config).into(),
    );
    let result = creator
        .create_request(CreateRequestOptions {
            session_id,
            command: args.command.clone(),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            justification: Justification {
                reason: args.reason.clone(),
                expected_effect: args.expected_effect.clone(),
                goal: args.goal.clone(),
                safety_argument: args.safety.clone(),
            },
            attachments,
        })
        .map_err(map_create_error)?;

    if result.skipped {
        info!(command = %args.command, "command is safe; executing directly");
        let spec = CommandSpec {
            raw: args.command.clone(),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            argv: Vec::new(),
            shell: true,
            display_redacted: String::new(),
        };
        return finish_execution(ctx, None, &spec);
    }

    let request = result
        .request
        .context("request creation returned neither a request nor a skip")?;

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({
                "request_id": request.id,
                "risk_tier": request.risk_tier.to_string(),
                "min_approvals": request.min_approvals,
                "status": request.status.to_string(),
            })
        );
    } else {
        eprintln!(
            "slb: {} request {} awaiting {} approval(s)",
            request.risk_tier, request.id, request.min_approvals
        );
    }

    if args.yield_after_submit {
        if !ctx.json {
            println!("{}", request.id);
        }
        return Ok(());
    }

    let approved = poll_until_decided(ctx, &request.id, Duration::from_secs(args.timeout))?;
    verify_approval_gate(&approved)?;

    ctx.store
        .update_status(&approved.id, RequestStatus::Executing)
        .map_err(|e| CliError::new("state_invalid", e.to_string()))?;
    ctx.workspace.remove_pending_snapshot(&approved.id);

    if ctx.config.rollback.enabled {
        let options = CaptureOptions {
            max_size_bytes: ctx.config.rollback.max_size_bytes,
        };
        match rollback::capture_rollback_state(&approved, &ctx.workspace.rollback_dir(), &options) {
            Ok(Some(data)) => info!(kind = %data.kind, "rollback state captured"),
            Ok(None) => {}
            // Capture failure degrades the safety net, not the request.
            Err(err) => warn!(%err, "proceeding without rollback capture"),
        }
    }

    finish_execution(ctx, Some(&approved), &approved.command)
}

fn load_attachments(args: &RunArgs) -> Result<Vec<Attachment>> {
    let config = AttachmentConfig::default();
    let mut attachments = Vec::new();
    for path in &args.attach_file {
        attachments.push(
            attachment::load_file(path, &config)
                .map_err(|e| CliError::new("capture_failed", e.to_string()))?,
        );
    }
    for path in &args.attach_screenshot {
        attachments.push(
            attachment::load_screenshot(path, &config)
                .map_err(|e| CliError::new("capture_failed", e.to_string()))?,
        );
    }
    for command in &args.attach_context {
        attachments.push(
            attachment::run_context_command(command, &config)
                .map_err(|e| CliError::new("capture_failed", e.to_string()))?,
        );
    }
    Ok(attachments)
}

fn map_create_error(err: CreateRequestError) -> anyhow::Error {
    let kind = match &err {
        CreateRequestError::SessionRequired | CreateRequestError::CommandRequired => {
            "input_missing"
        }
        CreateRequestError::SessionNotFound(_) => "not_found",
        CreateRequestError::SessionInactive(_) => "inactive",
        CreateRequestError::AgentBlocked(_) => "blocked",
        CreateRequestError::RateLimited(_) => "rate_limited",
        CreateRequestError::Store(_) => "error",
    };
    CliError::new(kind, err.to_string()).into()
}

/// Poll the store until the request leaves `pending` (or we give up).
fn poll_until_decided(
    ctx: &CommandContext,
    request_id: &str,
    timeout: Duration,
) -> Result<Request> {
    let poll_interval = Duration::from_millis(ctx.config.general.poll_interval_ms.max(100));
    let started = Instant::now();

    loop {
        let request = ctx
            .store
            .get_request(request_id)
            .map_err(|e| CliError::new("not_found", e.to_string()))?;
        let decision = evaluate_for_execution(request.status);

        if decision.should_execute {
            return Ok(request);
        }
        if !decision.should_continue_polling {
            return Err(CliError::new(request.status.as_str(), decision.reason).into());
        }
        if started.elapsed() >= timeout {
            if let Err(err) = ctx.store.update_status(request_id, RequestStatus::Timeout) {
                warn!(%err, "could not mark request as timed out");
            }
            ctx.workspace.remove_pending_snapshot(request_id);
            bus::publish_to_daemon(
                &ctx.workspace.socket_path(),
                &RequestEvent::status_change(EventKind::RequestTimeout, request_id.to_string()),
            );
            return Err(CliError::new(
                "timeout",
                format!("no approval quorum within {}s", timeout.as_secs()),
            )
            .into());
        }
        std::thread::sleep(poll_interval);
    }
}

/// The approval gate: everything must still hold right before the spawn.
fn verify_approval_gate(request: &Request) -> Result<(), CliError> {
    if request.status != RequestStatus::Approved {
        return Err(CliError::new(
            "state_invalid",
            format!("request is {}, not approved", request.status),
        ));
    }
    let Some(expires) = request.approval_expires_at else {
        return Err(CliError::new(
            "state_invalid",
            "approved request carries no expiry; refusing to execute",
        ));
    };
    if chrono::Utc::now() >= expires {
        return Err(CliError::new(
            "policy_denied",
            "approval has expired; submit a fresh request",
        ));
    }
    if compute_command_hash(&request.command) != request.command_hash {
        return Err(CliError::new(
            "policy_denied",
            "command no longer matches what reviewers approved; submit a fresh request",
        ));
    }
    Ok(())
}

/// Outcome of running the child process.
enum ExecOutcome {
    Exited(i32),
    Interrupted,
}

/// Spawn the child and reflect its outcome into the store and exit code.
///
/// `request` is `None` for safe commands that never had a request row.
fn finish_execution(
    ctx: &CommandContext,
    request: Option<&Request>,
    spec: &CommandSpec,
) -> Result<()> {
    let outcome = execute_spec(spec)?;

    match outcome {
        ExecOutcome::Exited(code) => {
            if let Some(request) = request {
                let status = if code == 0 {
                    RequestStatus::Executed
                } else {
                    RequestStatus::ExecutionFailed
                };
                if let Err(err) = ctx.store.update_status(&request.id, status) {
                    warn!(%err, "could not record execution result");
                }
                bus::publish_to_daemon(
                    &ctx.workspace.socket_path(),
                    &RequestEvent::status_change(EventKind::RequestExecuted, request.id.clone()),
                );
            }
            if code == 0 {
                Ok(())
            } else {
                eprintln!("execution_failed");
                std::process::exit(code.clamp(1, 255));
            }
        }
        ExecOutcome::Interrupted => {
            if let Some(request) = request {
                if let Err(err) = ctx.store.update_status(&request.id, RequestStatus::TimedOut) {
                    warn!(%err, "could not record interruption");
                }
            }
            eprintln!("timed_out");
            std::process::exit(1);
        }
    }
}

/// Run the command, forwarding the terminal and handling interruption: on
/// Ctrl-C the child gets SIGTERM, then SIGKILL after a grace period.
fn execute_spec(spec: &CommandSpec) -> Result<ExecOutcome> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building executor runtime")?;

    runtime.block_on(async {
        let mut command = if spec.shell || spec.argv.is_empty() {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(&spec.raw);
            c
        } else {
            let mut c = tokio::process::Command::new(&spec.argv[0]);
            c.args(&spec.argv[1..]);
            c
        };
        if !spec.cwd.is_empty() {
            command.current_dir(&spec.cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {:?}", spec.raw))?;
        let pid = child.id();

        tokio::select! {
            status = child.wait() => {
                let status = status.context("waiting for child")?;
                Ok(ExecOutcome::Exited(status.code().unwrap_or(-1)))
            }
            _ = tokio::signal::ctrl_c() => {
                graceful_kill(&mut child, pid).await;
                Ok(ExecOutcome::Interrupted)
            }
        }
    })
}

/// SIGTERM, a grace period, then SIGKILL.
async fn graceful_kill(child: &mut tokio::process::Child, pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    let grace = Duration::from_secs(5);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approved_executes() {
        let decision = evaluate_for_execution(RequestStatus::Approved);
        assert!(decision.should_execute);
        assert!(!decision.should_continue_polling);
        assert!(decision.reason.contains("approved"));
    }

    #[test]
    fn test_pending_keeps_polling() {
        let decision = evaluate_for_execution(RequestStatus::Pending);
        assert!(!decision.should_execute);
        assert!(decision.should_continue_polling);
        assert!(decision.reason.contains("pending"));
    }

    #[test]
    fn test_all_statuses_table() {
        use RequestStatus::{
            Approved, Cancelled, Escalated, Executed, Executing, ExecutionFailed, Pending,
            Rejected, TimedOut, Timeout,
        };
        let cases = [
            (Approved, true, false),
            (Pending, false, true),
            (Rejected, false, false),
            (Timeout, false, false),
            (Cancelled, false, false),
            (Executed, false, false),
            (ExecutionFailed, false, false),
            (Executing, false, false),
            (TimedOut, false, false),
            (Escalated, false, false),
        ];
        for (status, execute, keep_polling) in cases {
            let decision = evaluate_for_execution(status);
            assert_eq!(decision.should_execute, execute, "status {status}");
            assert_eq!(decision.should_continue_polling, keep_polling, "status {status}");
            assert!(!decision.reason.is_empty(), "status {status}");
        }
    }

    #[test]
    fn test_terminal_reasons_name_the_status() {
        for status in [
            RequestStatus::Rejected,
            RequestStatus::Timeout,
            RequestStatus::Cancelled,
            RequestStatus::Executed,
            RequestStatus::ExecutionFailed,
        ] {
            let decision = evaluate_for_execution(status);
            assert!(
                decision.reason.contains(status.as_str()),
                "reason {:?} should mention {}",
                decision.reason,
                status
            );
        }
    }

    #[test]
    fn test_verify_approval_gate_checks_hash_binding() {
        let mut request = sample_approved_request();
        verify_approval_gate(&request).unwrap();

        request.command.raw = "rm -rf / --no-preserve-root".to_string();
        let err = verify_approval_gate(&request).unwrap_err();
        assert_eq!(err.kind, "policy_denied");
        assert!(err.message.contains("no longer matches"));
    }

    #[test]
    fn test_verify_approval_gate_checks_expiry() {
        let mut request = sample_approved_request();
        request.approval_expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        let err = verify_approval_gate(&request).unwrap_err();
        assert_eq!(err.kind, "policy_denied");
        assert!(err.message.contains("expired"));
    }

    #[test]
    fn test_verify_approval_gate_requires_approved() {
        let mut request = sample_approved_request();
        request.status = RequestStatus::Pending;
        let err = verify_approval_gate(&request).unwrap_err();
        assert_eq!(err.kind, "state_invalid");
    }

    fn sample_approved_request() -> Request {
        let command = CommandSpec {
            raw: "git reset --hard HEAD~1".to_string(),
            cwd: "/project".to_string(),
            argv: vec!["git".into(), "reset".into(), "--hard".into(), "HEAD~1".into()],
            shell: false,
            display_redacted: String::new(),
        };
        let command_hash = compute_command_hash(&command);
        Request {
            id: Request::new_id(),
            requestor_session_id: "sess-1".to_string(),
            requestor_agent: "agent".to_string(),
            requestor_model: "model".to_string(),
            command,
            command_hash,
            risk_tier: slb_core::types::RiskTier::Dangerous,
            status: RequestStatus::Approved,
            min_approvals: 1,
            require_different_model: false,
            project_path: "/project".to_string(),
            justification: Justification::default(),
            created_at: chrono::Utc::now(),
            approval_expires_at: Some(chrono::Utc::now() + chrono::Duration::minutes(10)),
            resolved_at: None,
        }
    }
}
