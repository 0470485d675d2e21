//! `slb rollback` — restore pre-execution captures and collect old ones.

use anyhow::Result;
use clap::Subcommand;
use slb_daemon::rollback::{self, RestoreOptions, RollbackError};

use super::CliError;
use crate::CommandContext;

/// Rollback subcommands.
#[derive(Subcommand, Debug)]
pub enum RollbackCommand {
    /// Restore the capture taken for a request
    Restore {
        /// The request whose capture to restore
        request_id: String,

        /// Confirm a git restore, which rewrites the working tree
        #[arg(long)]
        force: bool,
    },

    /// Remove captures older than the configured retention
    Gc,
}

/// Entry point for `slb rollback`.
pub fn run(ctx: &CommandContext, cmd: &RollbackCommand) -> Result<()> {
    match cmd {
        RollbackCommand::Restore { request_id, force } => {
            let dir = ctx
                .workspace
                .rollback_dir()
                .join(format!("req-{}", request_id.trim_start_matches("req-")));
            let data = rollback::load_rollback_data(&dir.display().to_string())
                .map_err(map_rollback_error)?;
            rollback::restore_rollback_state(&data, &RestoreOptions { force: *force })
                .map_err(map_rollback_error)?;
            if ctx.json {
                println!(
                    "{}",
                    serde_json::json!({ "request_id": data.request_id, "kind": data.kind, "restored": true })
                );
            } else {
                println!("restored {} capture for {}", data.kind, data.request_id);
            }
            Ok(())
        }

        RollbackCommand::Gc => {
            let retention = chrono::Duration::hours(
                i64::try_from(ctx.config.rollback.retention_hours).unwrap_or(24),
            );
            rollback::cleanup_old_captures(
                &ctx.workspace.rollback_dir(),
                retention,
                std::time::SystemTime::now(),
            )
            .map_err(map_rollback_error)?;
            if !ctx.json {
                println!("rollback retention sweep complete");
            }
            Ok(())
        }
    }
}

fn map_rollback_error(err: RollbackError) -> anyhow::Error {
    let kind = match &err {
        RollbackError::SymlinkParent { .. }
        | RollbackError::ForceRequired
        | RollbackError::RepoRootMissing => "restore_unsafe",
        RollbackError::SizeExceeded { .. } => "capture_failed",
        RollbackError::EmptyRollbackPath
        | RollbackError::UnsupportedKind(_)
        | RollbackError::MissingData(_)
        | RollbackError::Metadata(_) => "state_invalid",
        RollbackError::CommandFailed { .. } => "external",
        RollbackError::FsAtomic(_) | RollbackError::Io { .. } => "error",
    };
    CliError::new(kind, err.to_string()).into()
}
