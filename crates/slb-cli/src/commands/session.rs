//! `slb session` — agent session lifecycle.

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;
use slb_core::signature::generate_session_key;
use slb_core::types::Session;

use super::CliError;
use crate::CommandContext;

/// Session subcommands.
#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Authenticate an agent and print its new session id
    Create {
        /// Agent name (e.g. `claude-backend`)
        #[arg(long)]
        agent: String,

        /// The driving program
        #[arg(long, default_value = "cli")]
        program: String,

        /// Model identifier, used by the different-model policy
        #[arg(long, default_value = "unknown")]
        model: String,
    },

    /// List active sessions for this project
    List,

    /// Deactivate a session
    End {
        /// Session to end (defaults to `--session-id`)
        session_id: Option<String>,
    },
}

/// Entry point for `slb session`.
pub fn run(ctx: &CommandContext, cmd: &SessionCommand) -> Result<()> {
    match cmd {
        SessionCommand::Create {
            agent,
            program,
            model,
        } => {
            let session = Session {
                id: Session::new_id(),
                agent_name: agent.clone(),
                program: program.clone(),
                model: model.clone(),
                project_path: ctx.workspace.project_root().display().to_string(),
                active: true,
                session_key: generate_session_key(),
                created_at: Utc::now(),
            };
            ctx.store
                .create_session(&session)
                .map_err(|e| CliError::new("error", e.to_string()))?;
            if ctx.json {
                println!(
                    "{}",
                    serde_json::json!({ "session_id": session.id, "agent": agent, "model": model })
                );
            } else {
                println!("{}", session.id);
            }
            Ok(())
        }

        SessionCommand::List => {
            let project = ctx.workspace.project_root().display().to_string();
            let sessions = ctx
                .store
                .list_active_sessions(&project)
                .map_err(|e| CliError::new("error", e.to_string()))?;
            if ctx.json {
                let rows: Vec<_> = sessions
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "session_id": s.id,
                            "agent": s.agent_name,
                            "model": s.model,
                            "created_at": s.created_at.to_rfc3339(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::json!(rows));
            } else {
                for s in sessions {
                    println!("{}\t{}\t{}", s.id, s.agent_name, s.model);
                }
            }
            Ok(())
        }

        SessionCommand::End { session_id } => {
            let id = match session_id.clone().or_else(|| ctx.session_id.clone()) {
                Some(id) => id,
                None => return Err(ctx.require_session_id().unwrap_err().into()),
            };
            ctx.store
                .deactivate_session(&id)
                .map_err(|e| CliError::new("not_found", e.to_string()))?;
            if !ctx.json {
                println!("session {id} deactivated");
            }
            Ok(())
        }
    }
}
