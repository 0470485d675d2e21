//! slb-daemon — event multiplexer for a project's `.slb/` workspace.
//!
//! The daemon is optional: the store remains the authority and every CLI
//! works without it. When it runs, it serves push events on the project
//! socket so watchers do not each have to poll the store, synthesizes
//! events for store changes made while no publisher was connected, and
//! expires stale pending requests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use slb_core::config::SlbConfig;
use slb_core::events::{RequestEvent, evaluate_for_polling};
use slb_core::types::RequestStatus;
use slb_daemon::bus::{self, EventBus};
use slb_daemon::rollback;
use slb_daemon::store::Store;
use slb_daemon::workspace::ProjectWorkspace;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// slb-daemon — project event multiplexer
#[derive(Parser, Debug)]
#[command(name = "slb-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Project directory (a directory containing `.slb/`)
    #[arg(short = 'C', long, default_value = ".")]
    project: PathBuf,

    /// Path to the Unix socket (defaults to `.slb/socket`)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to the configuration file (defaults to `.slb/config.toml`)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store poll interval in milliseconds
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to `.slb/logs/daemon.log` instead of stdout
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project = args
        .project
        .canonicalize()
        .with_context(|| format!("resolving project directory {}", args.project.display()))?;
    let workspace = ProjectWorkspace::init(&project).context("initializing .slb workspace")?;

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(workspace.logs_dir().join("daemon.log"))
            .context("opening daemon log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Arc::new(file)),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
    let config_path = args.config.unwrap_or_else(|| workspace.config_path());
    let config = SlbConfig::load_or_default(&config_path).context("loading configuration")?;

    let store = Store::open(&workspace.db_path()).context("opening state store")?;
    let socket_path = args.socket.unwrap_or_else(|| workspace.socket_path());
    let poll_interval =
        Duration::from_millis(args.poll_interval.unwrap_or(config.general.poll_interval_ms));

    let bus = Arc::new(EventBus::new());
    info!(project = %project.display(), "slb-daemon starting");

    let server = tokio::spawn({
        let bus = Arc::clone(&bus);
        let socket_path = socket_path.clone();
        async move { bus::serve(&socket_path, bus).await }
    });

    let poller = tokio::spawn(poll_store(
        store,
        Arc::clone(&bus),
        workspace.clone(),
        config,
        poll_interval,
    ));

    wait_for_shutdown().await;
    info!("shutting down");
    server.abort();
    poller.abort();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Poll the store and synthesize events for anything that changed outside a
/// connected publisher. Transient store errors are logged and survived.
async fn poll_store(
    store: Store,
    bus: Arc<EventBus>,
    workspace: ProjectWorkspace,
    config: SlbConfig,
    interval: Duration,
) {
    let mut seen: HashMap<String, RequestStatus> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    let request_timeout =
        chrono::Duration::seconds(i64::try_from(config.general.request_timeout_secs).unwrap_or(1800));
    let retention = chrono::Duration::hours(
        i64::try_from(config.rollback.retention_hours).unwrap_or(24),
    );
    let session_ttl = chrono::Duration::hours(
        i64::try_from(config.general.session_ttl_hours).unwrap_or(72),
    );

    loop {
        ticker.tick().await;

        if let Err(err) = store.deactivate_stale_sessions(session_ttl) {
            warn!(%err, "could not expire stale sessions");
        }

        match store.expire_stale_requests(request_timeout) {
            Ok(expired) => {
                for id in &expired {
                    workspace.remove_pending_snapshot(id);
                }
            }
            Err(err) => warn!(%err, "could not expire stale requests"),
        }

        let horizon = Utc::now() - chrono::Duration::hours(24);
        let requests = match store.list_watchable_requests(None, horizon) {
            Ok(requests) => requests,
            Err(err) => {
                warn!(%err, "store poll failed; retrying next tick");
                continue;
            }
        };

        for request in requests {
            let decision = evaluate_for_polling(&request.id, request.status, &seen);
            if let Some(kind) = decision.emit {
                let event = if kind == slb_core::events::EventKind::RequestPending {
                    RequestEvent::pending(&request)
                } else {
                    RequestEvent::status_change(kind, request.id.clone())
                };
                bus.publish(event);
            } else {
                debug!(request_id = %request.id, reason = %decision.reason, "no event");
            }
            seen.insert(request.id.clone(), request.status);
        }

        if let Err(err) = rollback::cleanup_old_captures(
            &workspace.rollback_dir(),
            retention,
            std::time::SystemTime::now(),
        ) {
            warn!(%err, "rollback retention sweep failed");
        }
    }
}
