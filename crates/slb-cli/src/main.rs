//! slb — run dangerous commands through the two-person rule.
//!
//! An agent submits the command it wants to run (`slb run`); independent
//! reviewing agents watch the queue (`slb watch`) and approve or reject
//! (`slb review`). Approved commands execute with a pre-capture that can be
//! rolled back (`slb rollback`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slb_core::config::SlbConfig;
use slb_daemon::store::Store;
use slb_daemon::workspace::ProjectWorkspace;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod client;
mod commands;

use commands::CliError;

/// slb — two-person rule for dangerous commands
#[derive(Parser, Debug)]
#[command(name = "slb")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project directory (a directory containing `.slb/`)
    #[arg(short = 'C', long, global = true)]
    project: Option<PathBuf>,

    /// Session ID for attribution
    #[arg(short = 's', long, global = true)]
    session_id: Option<String>,

    /// Emit machine-readable JSON on stdout
    #[arg(short, long, global = true)]
    json: bool,

    /// Path to the configuration file (defaults to `.slb/config.toml`)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command, requesting approval first when it is risky
    Run(commands::run::RunArgs),

    /// Stream request events for reviewing agents (NDJSON)
    Watch(commands::watch::WatchArgs),

    /// Approve or reject a pending request
    #[command(subcommand)]
    Review(commands::review::ReviewCommand),

    /// Manage agent sessions
    #[command(subcommand)]
    Session(commands::session::SessionCommand),

    /// Inspect or cancel requests
    #[command(subcommand)]
    Request(commands::request::RequestCommand),

    /// Restore or clean up pre-execution captures
    #[command(subcommand)]
    Rollback(commands::rollback::RollbackCommand),

    /// Print the dry-run equivalent of a command, if one is defined
    DryRun {
        /// The command to derive a preview for
        command: String,
    },
}

/// Everything a command needs: the workspace, an open store, and config.
pub struct CommandContext {
    /// The project workspace.
    pub workspace: ProjectWorkspace,
    /// The open state store.
    pub store: Store,
    /// Effective configuration.
    pub config: SlbConfig,
    /// `--session-id`, when given.
    pub session_id: Option<String>,
    /// `--json` machine-readable mode.
    pub json: bool,
}

impl CommandContext {
    /// The session id, or a [`CliError`] telling the user to pass it.
    pub fn require_session_id(&self) -> Result<String, CliError> {
        self.session_id.clone().ok_or_else(|| CliError {
            kind: "input_missing",
            message: "--session-id is required (create one with `slb session create`)".to_string(),
        })
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let json = cli.json;
    if let Err(err) = dispatch(cli) {
        report_error(json, &err);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    // dry-run needs no workspace at all.
    if let Commands::DryRun { command } = &cli.command {
        return commands::dry_run(command, cli.json);
    }

    let ctx = build_context(&cli)?;
    match cli.command {
        Commands::Run(args) => commands::run::run(&ctx, &args),
        Commands::Watch(args) => commands::watch::run(&ctx, &args),
        Commands::Review(cmd) => commands::review::run(&ctx, &cmd),
        Commands::Session(cmd) => commands::session::run(&ctx, &cmd),
        Commands::Request(cmd) => commands::request::run(&ctx, &cmd),
        Commands::Rollback(cmd) => commands::rollback::run(&ctx, &cmd),
        Commands::DryRun { .. } => unreachable!("handled above"),
    }
}

fn build_context(cli: &Cli) -> Result<CommandContext> {
    let start = match &cli.project {
        Some(p) => p.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let workspace = match ProjectWorkspace::discover(&start) {
        Some(ws) => ws,
        None => ProjectWorkspace::init(&start).context("initializing .slb workspace")?,
    };

    let config_path = cli.config.clone().unwrap_or_else(|| workspace.config_path());
    let config = SlbConfig::load_or_default(&config_path).context("loading configuration")?;
    let store = Store::open(&workspace.db_path()).context("opening state store")?;

    Ok(CommandContext {
        workspace,
        store,
        config,
        session_id: cli.session_id.clone(),
        json: cli.json,
    })
}

fn report_error(json: bool, err: &anyhow::Error) {
    let (kind, message) = match err.downcast_ref::<CliError>() {
        Some(cli_err) => (cli_err.kind, cli_err.message.clone()),
        None => ("error", format!("{err:#}")),
    };
    if json {
        let payload = serde_json::json!({ "error_kind": kind, "message": message });
        println!("{payload}");
    } else {
        eprintln!("slb: {message}");
    }
}
