//! Conductor server: HTTP API for submitting and governing tasks, plus a
//! live stream of lifecycle events.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use conductor::io::command::CommandExecutor;
use conductor::io::config::{DEFAULT_CONFIG_FILE, load_config};
use conductor::watchdog::Watchdog;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "conductor-server")]
#[command(about = "Task orchestration server with queue governance and live events")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Config file (defaults apply when missing)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("conductor_server=info".parse()?)
                .add_directive("conductor=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)
        .with_context(|| format!("load {}", args.config.display()))?;

    let call_timeout = config
        .executor
        .timeout_secs
        .max(config.healing.iteration_timeout_secs);
    let commands =
        CommandExecutor::new(&config.commands).with_timeout(Duration::from_secs(call_timeout));
    info!(
        capabilities = ?commands.capabilities().collect::<Vec<_>>(),
        limit = config.queue.concurrency_limit,
        "starting conductor-server"
    );

    let state = AppState::from_config(&config, Arc::new(commands), Arc::new(config.cost.clone()));
    let dispatcher = state.orchestrator.start();

    let shutdown = CancellationToken::new();
    let watchdog = Watchdog::new(state.orchestrator.clone(), config.watchdog_config())
        .spawn(shutdown.clone());

    let app = app(state.clone());
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    state.orchestrator.shutdown();
    shutdown.cancel();
    if let Err(err) = dispatcher.await {
        warn!(error = %err, "dispatcher task failed");
    }
    if let Err(err) = watchdog.await {
        warn!(error = %err, "watchdog task failed");
    }
    info!("stopped");
    Ok(())
}

/// Task and queue API plus the event stream, all at the root.
fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::api_router()
        .route("/events", get(sse::events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Resolve on ctrl-c, or when `shutdown` is cancelled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
}
