//! `slb review` — approve or reject pending requests.

use anyhow::Result;
use clap::Subcommand;
use slb_core::types::Decision;
use slb_daemon::review::{ReviewError, ReviewOptions, ReviewService};

use super::CliError;
use crate::CommandContext;

/// Review subcommands.
#[derive(Subcommand, Debug)]
pub enum ReviewCommand {
    /// Approve a pending request
    Approve {
        /// The request to approve
        request_id: String,

        /// Free-text comments for the audit trail
        #[arg(long, default_value = "")]
        comments: String,
    },

    /// Reject a pending request
    Reject {
        /// The request to reject
        request_id: String,

        /// Free-text comments for the audit trail
        #[arg(long, default_value = "")]
        comments: String,
    },

    /// Show the review state of a request
    Status {
        /// The request to inspect
        request_id: String,
    },
}

/// Entry point for `slb review`.
pub fn run(ctx: &CommandContext, cmd: &ReviewCommand) -> Result<()> {
    let service = ReviewService::new(
        ctx.store.clone(),
        Some(ctx.workspace.clone()),
        (&ctx.config).into(),
    );

    match cmd {
        ReviewCommand::Approve {
            request_id,
            comments,
        } => submit(ctx, &service, request_id, Decision::Approve, comments),
        ReviewCommand::Reject {
            request_id,
            comments,
        } => submit(ctx, &service, request_id, Decision::Reject, comments),
        ReviewCommand::Status { request_id } => status(ctx, &service, request_id),
    }
}

fn submit(
    ctx: &CommandContext,
    service: &ReviewService,
    request_id: &str,
    decision: Decision,
    comments: &str,
) -> Result<()> {
    let session_id = ctx.require_session_id()?;
    let result = service
        .submit_review(ReviewOptions {
            session_id,
            request_id: request_id.to_string(),
            decision: Some(decision),
            comments: comments.to_string(),
            ..ReviewOptions::default()
        })
        .map_err(map_review_error)?;

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({
                "review_id": result.review.id,
                "decision": decision.to_string(),
                "approvals": result.approvals,
                "rejections": result.rejections,
                "new_status": result.new_status.map(|s| s.to_string()),
            })
        );
    } else {
        match result.new_status {
            Some(status) => println!("{decision} recorded; request is now {status}"),
            None => println!(
                "{decision} recorded; {} approval(s), {} rejection(s) so far",
                result.approvals, result.rejections
            ),
        }
    }
    Ok(())
}

fn status(ctx: &CommandContext, service: &ReviewService, request_id: &str) -> Result<()> {
    let status = service.review_status(request_id).map_err(map_review_error)?;
    if ctx.json {
        println!(
            "{}",
            serde_json::json!({
                "status": status.request_status.to_string(),
                "approvals": status.approvals,
                "rejections": status.rejections,
                "min_approvals": status.min_approvals,
                "needs_more_approvals": status.needs_more_approvals,
            })
        );
    } else {
        println!(
            "{}: {}/{} approvals, {} rejections",
            status.request_status, status.approvals, status.min_approvals, status.rejections
        );
        for review in &status.reviews {
            println!(
                "  {} by {} ({})",
                review.decision, review.reviewer_agent, review.reviewer_model
            );
        }
    }
    Ok(())
}

fn map_review_error(err: ReviewError) -> anyhow::Error {
    let kind = match &err {
        ReviewError::SessionRequired | ReviewError::RequestRequired | ReviewError::InvalidDecision => {
            "input_missing"
        }
        ReviewError::SessionNotFound(_) | ReviewError::RequestNotFound(_) => "not_found",
        ReviewError::SessionInactive(_) => "inactive",
        ReviewError::RequestNotPending(_) | ReviewError::AlreadyReviewed => "state_invalid",
        ReviewError::SelfReview
        | ReviewError::SelfApproveTooSoon { .. }
        | ReviewError::RequireDifferentModel(_) => "policy_denied",
        ReviewError::Store(_) => "error",
    };
    CliError::new(kind, err.to_string()).into()
}
