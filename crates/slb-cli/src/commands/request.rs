//! `slb request` — inspect and cancel requests.

use anyhow::Result;
use clap::Subcommand;
use slb_core::events::{EventKind, RequestEvent};
use slb_core::types::{Request, RequestStatus};
use slb_daemon::bus;
use slb_daemon::store::StoreError;

use super::CliError;
use crate::CommandContext;

/// Request subcommands.
#[derive(Subcommand, Debug)]
pub enum RequestCommand {
    /// List recent requests for this project
    List {
        /// Maximum number of rows
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show one request in full
    Show {
        /// The request to show
        request_id: String,
    },

    /// Cancel a pending or approved request
    Cancel {
        /// The request to cancel
        request_id: String,
    },
}

/// Entry point for `slb request`.
pub fn run(ctx: &CommandContext, cmd: &RequestCommand) -> Result<()> {
    match cmd {
        RequestCommand::List { limit } => {
            let project = ctx.workspace.project_root().display().to_string();
            let requests = ctx
                .store
                .list_requests(Some(&project), *limit)
                .map_err(map_store_error)?;
            if ctx.json {
                let rows: Vec<_> = requests.iter().map(summary).collect();
                println!("{}", serde_json::json!(rows));
            } else {
                for request in requests {
                    println!(
                        "{}\t{}\t{}\t{}",
                        request.id,
                        request.status,
                        request.risk_tier,
                        request.display_command()
                    );
                }
            }
            Ok(())
        }

        RequestCommand::Show { request_id } => {
            let request = ctx.store.get_request(request_id).map_err(map_store_error)?;
            let reviews = ctx.store.list_reviews(request_id).map_err(map_store_error)?;
            if ctx.json {
                let mut row = summary(&request);
                row["justification"] = serde_json::to_value(&request.justification)?;
                row["reviews"] = serde_json::json!(
                    reviews
                        .iter()
                        .map(|r| {
                            serde_json::json!({
                                "reviewer": r.reviewer_agent,
                                "model": r.reviewer_model,
                                "decision": r.decision.to_string(),
                            })
                        })
                        .collect::<Vec<_>>()
                );
                println!("{row}");
            } else {
                println!("request:   {}", request.id);
                println!("status:    {}", request.status);
                println!("tier:      {}", request.risk_tier);
                println!("command:   {}", request.display_command());
                println!("requestor: {} ({})", request.requestor_agent, request.requestor_model);
                if !request.justification.reason.is_empty() {
                    println!("reason:    {}", request.justification.reason);
                }
                for review in reviews {
                    println!(
                        "review:    {} by {} ({})",
                        review.decision, review.reviewer_agent, review.reviewer_model
                    );
                }
            }
            Ok(())
        }

        RequestCommand::Cancel { request_id } => {
            let updated = ctx
                .store
                .update_status(request_id, RequestStatus::Cancelled)
                .map_err(map_store_error)?;
            ctx.workspace.remove_pending_snapshot(request_id);
            bus::publish_to_daemon(
                &ctx.workspace.socket_path(),
                &RequestEvent::status_change(EventKind::RequestCancelled, request_id.to_string()),
            );
            if ctx.json {
                println!(
                    "{}",
                    serde_json::json!({ "request_id": updated.id, "status": updated.status.to_string() })
                );
            } else {
                println!("request {} cancelled", updated.id);
            }
            Ok(())
        }
    }
}

fn summary(request: &Request) -> serde_json::Value {
    serde_json::json!({
        "request_id": request.id,
        "status": request.status.to_string(),
        "risk_tier": request.risk_tier.to_string(),
        "command": request.display_command(),
        "requestor": request.requestor_agent,
        "created_at": request.created_at.to_rfc3339(),
    })
}

fn map_store_error(err: StoreError) -> anyhow::Error {
    let kind = match &err {
        StoreError::RequestNotFound(_) | StoreError::SessionNotFound(_) => "not_found",
        StoreError::InvalidTransition(_) => "state_invalid",
        _ => "error",
    };
    CliError::new(kind, err.to_string()).into()
}
