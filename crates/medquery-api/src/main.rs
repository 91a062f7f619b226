//! MedQuery API Server
//!
//! Usage:
//!   medquery-api [--config <file>] [--host <host>] [--port <port>] [serve]
//!   medquery-api check
//!
//! Author: hephaex@gmail.com

use clap::{Parser, Subcommand};
use medquery_api::{create_router, state::AppState};
use medquery_core::{AppConfig, LoggingConfig};
use medquery_store::connector_for;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[command(name = "medquery-api")]
#[command(about = "RAG medical query API with request logging")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Connect to the log store, print the probe result and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config.logging);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Check => check(config).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &logging.level;
        tracing_subscriber::EnvFilter::new(format!(
            "medquery_api={level},medquery_store={level},medquery_core={level},tower_http={level}"
        ))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr = config.server.bind_addr();
    if config.database.uri.is_none() {
        tracing::warn!("MONGO_URI is not set. Database will not connect.");
    }

    // Create application state
    let connector = connector_for(&config.database);
    let state = Arc::new(AppState::start(config, connector).await);

    let result = run(&addr, create_router(state.clone())).await;

    // Runs however serving ended
    state.stop().await;
    tracing::info!("MedQuery API Server stopped");
    result
}

async fn run(addr: &str, app: axum::Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("MedQuery API Server starting on http://{}", addr);
    tracing::info!("OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn check(config: AppConfig) -> anyhow::Result<()> {
    let connector = connector_for(&config.database);
    let state = AppState::start(config, connector).await;

    let report = state.probe().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    state.stop().await;

    if !report.is_healthy() {
        anyhow::bail!("log store is unavailable");
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
