use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

const AUTH_HEADER: &str = "x-queue-key";

#[derive(Clone)]
struct AppState {
    queue_url: String,
    queue_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct QueueParams {
    queue: Option<String>,
}

#[derive(Serialize)]
struct ProxyResponse {
    status: u16,
    body: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let queue_url =
        std::env::var("QUEUE_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".to_string());
    let queue_key = std::env::var("QUEUE_KEY").unwrap_or_default();
    let bind_addr: SocketAddr = std::env::var("MONITOR_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    if queue_key.is_empty() {
        tracing::warn!("QUEUE_KEY is not set, protected endpoints will answer 401");
    }

    let state = AppState {
        queue_url: queue_url.trim_end_matches('/').to_string(),
        queue_key,
        client: reqwest::Client::new(),
    };

    let app = Router::new()
        .route("/", get(dashboard))
        .route("/api/health", get(api_health))
        .route("/api/stats", get(api_stats))
        .route("/api/instances", get(api_instances))
        .with_state(state);

    tracing::info!("Monitor listening on {}", bind_addr);
    axum::serve(tokio::net::TcpListener::bind(bind_addr).await?, app).await?;

    Ok(())
}

async fn dashboard() -> Html<&'static str> {
    Html(include_str!("monitor.html"))
}

async fn api_health(
    State(state): State<AppState>,
    Query(params): Query<QueueParams>,
) -> Result<Json<ProxyResponse>, (StatusCode, String)> {
    proxy(&state, params.queue, "/health").await
}

async fn api_stats(
    State(state): State<AppState>,
    Query(params): Query<QueueParams>,
) -> Result<Json<ProxyResponse>, (StatusCode, String)> {
    proxy(&state, params.queue, "/stats").await
}

async fn api_instances(
    State(state): State<AppState>,
    Query(params): Query<QueueParams>,
) -> Result<Json<ProxyResponse>, (StatusCode, String)> {
    proxy(&state, params.queue, "/instances").await
}

async fn proxy(
    state: &AppState,
    queue: Option<String>,
    path: &str,
) -> Result<Json<ProxyResponse>, (StatusCode, String)> {
    let url = format!("{}{}", resolve_queue_url(state, queue), path);
    let resp = state
        .client
        .get(url)
        .header(AUTH_HEADER, &state.queue_key)
        .send()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    let status = resp.status().as_u16();
    let body = resp
        .json::<serde_json::Value>()
        .await
        .unwrap_or(serde_json::Value::Null);

    Ok(Json(ProxyResponse { status, body }))
}

fn resolve_queue_url(state: &AppState, override_url: Option<String>) -> String {
    let candidate = override_url.unwrap_or_else(|| state.queue_url.clone());
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return state.queue_url.clone();
    }

    let normalized = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    normalized.trim_end_matches('/').to_string()
}
