//! portico agent binary entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use portico_agent::{
    assets, supervisor, AgentListener, AgentState, AuthContext, Cli, ConnectionRegistry,
    Dispatcher, ProcessExtensionHostFactory, SupervisorHandle, WebviewListener,
};
use portico_core::constants::SHUTDOWN_TIMEOUT;
use portico_core::Result;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = portico_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    // Workspace-path resolution honors the override used by wrapper
    // scripts.
    if let Ok(cwd) = std::env::var("PORTICO_CWD") {
        if let Err(e) = std::env::set_current_dir(&cwd) {
            error!(cwd = %cwd, error = %e, "failed to change working directory");
            std::process::exit(1);
        }
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "agent failed to start");
            eprintln!("portico-agent: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    info!(version = env!("CARGO_PKG_VERSION"), "portico-agent starting");

    let connection_token = cli.resolve_connection_token()?;
    if cli.connection_token.is_none() && cli.connection_token_file.is_none() {
        info!(token = %connection_token, "generated connection token");
    }

    let registry = ConnectionRegistry::new();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<i32>(1);

    let supervisor = if cli.enable_remote_auto_shutdown {
        let counter = Arc::clone(&registry);
        supervisor::spawn(
            SHUTDOWN_TIMEOUT,
            registry.subscribe_events(),
            move || counter.extension_host_count(),
            shutdown_tx.clone(),
        )
    } else {
        SupervisorHandle::disabled()
    };

    let factory = Arc::new(ProcessExtensionHostFactory::new(
        cli.worker_cmd.clone(),
        cli.worker_args.clone(),
    ));
    let reconnection_grace = Duration::from_secs(cli.reconnection_grace_secs);
    let dispatcher = Dispatcher::new(Arc::clone(&registry), factory, reconnection_grace);
    let auth = AuthContext::new(connection_token.clone(), cli.commit.clone());

    let state = Arc::new(AgentState {
        dispatcher,
        auth,
        supervisor: supervisor.clone(),
        commit: cli.commit.clone(),
        web_root: cli.web_root.clone(),
    });

    let listener = AgentListener::bind(cli.socket_addr(), Arc::clone(&state)).await?;
    let port = listener.local_addr()?.port();
    let webview = WebviewListener::bind(cli.webview_socket_addr(), cli.web_root.clone()).await?;
    let webview_port = webview.local_addr()?.port();

    info!(port, webview_port, "agent listening");

    // Stable stdout lines; supervisor tooling scrapes these.
    println!("Extension host agent listening on {port}");
    println!("webview server listening on {webview_port}");
    if assets::has_built_ui(cli.web_root.as_deref()) {
        if port == 80 {
            println!("Web UI available at http://localhost/#tkn={connection_token}");
        } else {
            println!("Web UI available at http://localhost:{port}/#tkn={connection_token}");
        }
    }

    tokio::spawn(listener.run());
    tokio::spawn(webview.run());

    // Runs until the idle supervisor asks for a clean exit; without
    // auto-shutdown this waits forever.
    let code = shutdown_rx.recv().await.unwrap_or(0);
    info!(code, "agent shutting down");
    Ok(code)
}
