use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use workbook_mcp::config::{CliArgs, ServerConfig, TransportKind};
use workbook_mcp::http;
use workbook_mcp::server::AnalysisServer;
use workbook_mcp::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Diagnostics always go to stderr; in stdio mode stdout carries only
    // tool traffic.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(ServerConfig::from_args(args)?);
    let state = Arc::new(AppState::new(config.clone())?);

    let sweeper = state
        .cache
        .clone()
        .start_sweeper(config.cache_cleanup_interval);

    let server = Arc::new(AnalysisServer::new(state));

    let result = match config.transport {
        TransportKind::Stdio => {
            tracing::info!("stdio transport ready");
            server.run_stdio().await
        }
        TransportKind::Http => run_http(server, config.shutdown_grace).await,
    };

    sweeper.abort();
    result
}

/// Serve HTTP until ctrl-c, then drain in-flight requests for at most the
/// configured grace period.
async fn run_http(server: Arc<AnalysisServer>, grace: std::time::Duration) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serve_task = tokio::spawn(http::serve(server, async {
        let _ = shutdown_rx.await;
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!(grace_ms = grace.as_millis() as u64, "shutting down");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(grace, serve_task).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!("grace period elapsed before all requests drained"),
    }
    Ok(())
}
