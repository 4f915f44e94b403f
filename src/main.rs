#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::middleware::{Cors, Tracing};
use poem::{EndpointExt, Route, Server, listener::TcpListener};
use tracing::info;

use ssh_gateway::config;
use ssh_gateway::executor::CommandExecutor;
use ssh_gateway::janitor::Janitor;
use ssh_gateway::orchestrator::Orchestrator;
use ssh_gateway::queue::{CommandQueue, QueueConfig};
use ssh_gateway::session::Registry;
use ssh_gateway::transport::{AppState, health_handler, ws_handler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let port = config::resolve_port(None);
    let host = config::resolve_host(None);
    let cors_origins = config::resolve_cors_origins(None);

    let registry = Arc::new(Registry::new());
    let queue = CommandQueue::new(QueueConfig::from_env());
    let orchestrator = Arc::new(Orchestrator::new(registry.clone()));
    let executor = Arc::new(CommandExecutor::new(queue.clone()));
    let janitor = Arc::new(Janitor::new(registry.clone()));

    let shutdown = tokio_util::sync::CancellationToken::new();
    janitor.clone().spawn(shutdown.clone());

    let state = AppState {
        registry,
        queue,
        orchestrator,
        executor,
        janitor: janitor.clone(),
    };

    let mut cors = Cors::new();
    for origin in &cors_origins {
        cors = cors.allow_origin(origin.clone());
    }

    let app = Route::new()
        .at("/ws", ws_handler)
        .at("/health", health_handler)
        .with(Tracing)
        .with(cors)
        .data(state);

    let addr = format!("{host}:{port}");
    info!("SSH gateway listening on {addr}");

    let shutdown_signal = shutdown.clone();
    let server = Server::new(TcpListener::bind(&addr)).name("ssh-gateway").run_with_graceful_shutdown(
        app,
        async move { ssh_gateway::janitor::wait_for_shutdown_signal(shutdown_signal).await },
        None,
    );

    server.await?;

    janitor.shutdown().await;
    info!("SSH gateway stopped");

    Ok(())
}
