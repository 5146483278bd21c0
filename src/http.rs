use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::server::{AnalysisServer, SERVER_VERSION};

/// JSON-RPC over POST plus the health and metrics surfaces. Tool errors
/// ride in the response body; the HTTP status stays 200.
pub fn build_router(server: Arc<AnalysisServer>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

pub async fn serve(
    server: Arc<AnalysisServer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind_address = server.state().config().http_bind_address;
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    serve_on(listener, server, shutdown).await
}

/// Serve on an already-bound listener (tests bind port 0).
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    server: Arc<AnalysisServer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let address = listener.local_addr().context("listener address")?;
    tracing::info!(address = %address, version = SERVER_VERSION, "http transport listening");

    axum::serve(listener, build_router(server))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")?;
    Ok(())
}

async fn handle_rpc(State(server): State<Arc<AnalysisServer>>, body: String) -> Json<Value> {
    let response = server.handle_line(&body).await;
    Json(serde_json::to_value(&response).unwrap_or_else(|error| {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {
                "code": crate::errors::CODE_INTERNAL_ERROR,
                "message": format!("failed to encode response: {error}"),
            },
        })
    }))
}

async fn handle_health(State(server): State<Arc<AnalysisServer>>) -> Json<Value> {
    let state = server.state();
    let (memory_used, memory_total) = state.cache.memory_usage();

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": SERVER_VERSION,
        "cache": {
            "memory_used": memory_used,
            "memory_total": memory_total,
            "hit_ratio": state.cache.hit_ratio(),
        },
    }))
}

async fn handle_metrics(State(server): State<Arc<AnalysisServer>>) -> Json<Value> {
    let state = server.state();
    let (used, total) = state.cache.memory_usage();

    Json(json!({
        "cache_stats": state.cache.stats(),
        "cache_hit_ratio": state.cache.hit_ratio(),
        "memory_usage": {
            "used_bytes": used,
            "total_bytes": total,
            "used_mb": used / (1024 * 1024),
            "total_mb": total / (1024 * 1024),
            "utilization": used as f64 / total as f64,
        },
        "timestamp": Utc::now(),
    }))
}
