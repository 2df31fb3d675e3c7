//! PaneDock
//!
//! Tracks running agent sessions from their lifecycle hooks and transcripts,
//! and delivers approvals and messages back into the tmux pane or editor
//! terminal each session runs in.

mod cmd_panes;
mod cmd_send_hook;
mod cmd_status;
mod command;
mod config;
mod dispatcher;
mod editor;
mod error;
mod health;
mod hook_listener;
mod http;
mod interrupt_watcher;
mod logging;
mod paths;
mod process_tree;
mod services;
mod session;
mod session_command;
mod session_store;
mod sweeper;
mod tmux;
mod transcript;
mod transcript_watcher;
mod transition;
mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::command::SystemRunner;
use crate::config::{CoreConfig, DEFAULT_BIND};
use crate::dispatcher::Dispatcher;
use crate::editor::SystemLiveness;
use crate::health::HealthChecker;
use crate::hook_listener::{bind_socket, serve_socket, EditorAncestorDetector, HookIngress};
use crate::http::AppState;
use crate::logging::{init_logging, LogSink};
use crate::paths::Paths;
use crate::services::Services;
use crate::session_store::SessionStore;
use crate::sweeper::StaleSweeper;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "panedock", version, about = "Route approvals and messages to running agent sessions")]
struct Cli {
    /// Data directory (defaults to ~/.panedock)
    #[arg(long, global = true, env = "PANEDOCK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    stderr_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Start(StartArgs),

    /// Check whether the daemon is running
    Status {
        #[arg(long, env = "PANEDOCK_BIND", default_value = DEFAULT_BIND)]
        bind: String,
    },

    /// Print every tmux pane the resolver can see
    Panes,

    /// Forward one hook payload from stdin to the daemon socket
    SendHook {
        /// Set `event_name` on the forwarded payload
        #[arg(long)]
        event: Option<String>,
    },
}

#[derive(Args)]
struct StartArgs {
    /// HTTP bind address
    #[arg(long, env = "PANEDOCK_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Editor bridge executable
    #[arg(long, env = "PANEDOCK_BRIDGE")]
    bridge: Option<String>,

    /// Editor registry file
    #[arg(long, env = "PANEDOCK_REGISTRY")]
    registry: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = Paths::resolve(cli.data_dir.as_deref());

    match cli.command {
        Command::Start(args) => run_daemon(paths, args, cli.stderr_log).await,
        Command::Status { bind } => cmd_status::run(&paths, &bind),
        Command::Panes => cmd_panes::run(&CoreConfig::new(&paths)).await,
        Command::SendHook { event } => cmd_send_hook::run(&paths, event.as_deref()),
    }
}

async fn run_daemon(paths: Paths, args: StartArgs, stderr_log: bool) -> anyhow::Result<()> {
    paths
        .ensure_dirs()
        .with_context(|| format!("creating {}", paths.data_dir().display()))?;
    let sink = if stderr_log { LogSink::Stderr } else { LogSink::File };
    let logging = init_logging(&paths.log_dir(), sink)?;

    let config = CoreConfig::new(&paths)
        .with_bridge(args.bridge)
        .with_registry(args.registry);

    info!(
        component = "main",
        event = "main.starting",
        version = VERSION,
        run_id = %logging.run_id,
        data_dir = %paths.data_dir().display(),
        bridge = %config.bridge_path,
        registry = %config.registry_path.display(),
        "Starting PaneDock"
    );

    let pid_path = paths.pid_file_path();
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("writing {}", pid_path.display()))?;

    let (store, store_task) = SessionStore::spawn(&config, paths.clone());
    let services = Services::new(&config, Arc::new(SystemRunner), Arc::new(SystemLiveness));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let detector = Arc::new(EditorAncestorDetector::new(
        services.processes.clone(),
        config.editor_process_name.clone(),
    ));
    let ingress = HookIngress::new(store.sink(), detector);

    let socket_path = paths.socket_path();
    let socket_listener = bind_socket(&socket_path)
        .with_context(|| format!("binding hook socket {}", socket_path.display()))?;
    let socket_task = tokio::spawn(serve_socket(
        socket_listener,
        socket_path,
        ingress.clone(),
        shutdown_rx.clone(),
    ));

    let health_task = tokio::spawn(
        HealthChecker::new(
            store.clone(),
            &services,
            config.health_interval,
            config.health_concurrency,
        )
        .run(shutdown_rx.clone()),
    );
    let sweeper_task = tokio::spawn(
        StaleSweeper::new(
            store.clone(),
            services.processes.clone(),
            config.sweep_interval,
            config.stale_threshold,
        )
        .run(shutdown_rx.clone()),
    );

    let tcp = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(
        component = "main",
        event = "main.listening",
        bind = %args.bind,
        "HTTP API listening"
    );
    let state = AppState {
        store: store.clone(),
        ingress,
        dispatcher: Arc::new(Dispatcher::new(store.clone(), &services)),
    };
    let http_task = tokio::spawn(http::serve(tcp, state, shutdown_rx));

    shutdown_signal().await;
    info!(
        component = "main",
        event = "main.shutdown",
        "Shutting down"
    );
    shutdown_tx.send_replace(true);

    let (socket, health, sweeper, http) =
        tokio::join!(socket_task, health_task, sweeper_task, http_task);
    for (name, joined) in [("hook_socket", socket), ("health", health), ("sweeper", sweeper)] {
        if let Err(err) = joined {
            warn!(component = "main", event = "main.task_failed", task = name, error = %err);
        }
    }
    match http {
        Ok(Err(err)) => warn!(component = "main", event = "main.task_failed", task = "http", error = %err),
        Err(err) => warn!(component = "main", event = "main.task_failed", task = "http", error = %err),
        Ok(Ok(())) => {}
    }

    store.sink().shutdown().await;
    let _ = store_task.await;
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
