//! CLI subcommand implementations.

pub mod request;
pub mod review;
pub mod rollback;
pub mod run;
pub mod session;
pub mod watch;

use anyhow::Result;

/// An error with a machine-readable kind, surfaced as
/// `{error_kind, message}` in `--json` mode.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CliError {
    /// Stable kind string (`input_missing`, `not_found`, `policy_denied`,
    /// a terminal status name, …).
    pub kind: &'static str,
    /// Human-readable diagnostic.
    pub message: String,
}

impl CliError {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// `slb dry-run <cmd>`: print the preview command, if one is defined.
pub fn dry_run(command: &str, json: bool) -> Result<()> {
    match slb_core::dryrun::dry_run_command(command) {
        Some(preview) => {
            if json {
                println!("{}", serde_json::json!({ "dry_run": preview }));
            } else {
                println!("{preview}");
            }
            Ok(())
        }
        None => Err(CliError::new(
            "not_found",
            format!("no dry-run equivalent defined for {command:?}"),
        )
        .into()),
    }
}
