//! HTTP API for request logging, inspection, and administration.
//!
//! The ingest surface (`/api/v1/log`, `/api/v1/inspect`) is open to
//! co-located applications; the operator surface is guarded by the admin
//! token. Status mapping: BAN is 403, THROTTLE is 429, ALLOW and FLAG
//! are 200 with the decision in the body either way.

use crate::limiter::{Action, Decision, Limiter, RequestLog};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<Limiter>,
    pub admin_token: String,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/v1/bans", get(list_bans).post(create_ban))
        .route("/api/v1/bans/{ip}", axum::routing::delete(remove_ban))
        .route(
            "/api/v1/callbacks",
            get(list_callbacks)
                .post(add_callback)
                .delete(remove_callback),
        )
        .route("/api/v1/recent", get(recent_requests))
        .route("/api/v1/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/log", post(handle_log))
        .route("/api/v1/inspect", get(handle_inspect))
        .merge(admin)
        .with_state(state)
}

/// Run the HTTP server until `shutdown` is cancelled.
///
/// This is a long-running task that should be spawned in the background.
pub async fn run_server(addr: SocketAddr, state: AppState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!("HTTP server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await });

    if let Err(e) = serve.await {
        tracing::error!("HTTP server error: {}", e);
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// Reject requests without the operator token.
async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if token.is_empty() || token != state.admin_token {
        return error_response(StatusCode::UNAUTHORIZED, "invalid admin token");
    }
    next.run(request).await
}

#[derive(Debug, Default, Deserialize)]
struct LogPayload {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    user_id: Option<String>,
}

async fn handle_log(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Tolerate an empty or malformed body; the caller's socket address
    // still attributes the event.
    let payload: LogPayload = serde_json::from_slice(&body).unwrap_or_default();
    let ip = if payload.ip.is_empty() {
        client_ip(&headers, peer)
    } else {
        payload.ip
    };

    // Banned IPs are rejected before consuming any window budget.
    if let Some(ban) = state.limiter.is_banned(&ip).await {
        let decision = Decision::ban(ip, &ban.reason);
        return (StatusCode::FORBIDDEN, Json(decision)).into_response();
    }

    let decision = state
        .limiter
        .log_request(RequestLog {
            time: Utc::now(),
            ip,
            method: payload.method,
            path: payload.path,
            user_id: payload.user_id,
        })
        .await;

    if decision.action == Action::Ban {
        let reason = decision.reason.as_deref().unwrap_or("auto-ban");
        if let Err(e) = state.limiter.record_auto_ban(&decision.ip, reason).await {
            // The ban decision still stands; only durability suffered.
            error!(ip = %decision.ip, error = %e, "Failed to persist auto-ban");
        }
    }

    state.limiter.notify_callbacks(&decision).await;

    (status_for(&decision), Json(decision)).into_response()
}

#[derive(Debug, Deserialize)]
struct IpQuery {
    ip: String,
}

async fn handle_inspect(State(state): State<AppState>, Query(query): Query<IpQuery>) -> Response {
    let decision = state.limiter.inspect(&query.ip).await;
    (status_for(&decision), Json(decision)).into_response()
}

async fn list_bans(State(state): State<AppState>) -> Response {
    match state.limiter.list_bans().await {
        Ok(bans) => Json(bans).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list bans");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

#[derive(Debug, Deserialize)]
struct BanPayload {
    ip: String,
    #[serde(default)]
    reason: Option<String>,
    /// Ban duration in seconds; 0 or absent means permanent.
    #[serde(default)]
    duration_secs: u64,
}

async fn create_ban(State(state): State<AppState>, Json(payload): Json<BanPayload>) -> Response {
    if payload.ip.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "ip required");
    }

    let reason = payload.reason.as_deref().unwrap_or("manual ban");
    let duration = Duration::from_secs(payload.duration_secs);
    match state
        .limiter
        .record_manual_ban(&payload.ip, reason, duration)
        .await
    {
        Ok(ban) => Json(ban).into_response(),
        Err(e) => {
            error!(ip = %payload.ip, error = %e, "Failed to record manual ban");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn remove_ban(State(state): State<AppState>, Path(ip): Path<String>) -> Response {
    match state.limiter.unban(&ip).await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => {
            error!(ip = %ip, error = %e, "Failed to unban");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackPayload {
    url: String,
}

async fn list_callbacks(State(state): State<AppState>) -> Response {
    Json(state.limiter.callbacks().await).into_response()
}

async fn add_callback(
    State(state): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> Response {
    if payload.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url required");
    }
    state.limiter.register_callback(&payload.url).await;
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn remove_callback(
    State(state): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> Response {
    state.limiter.unregister_callback(&payload.url).await;
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn recent_requests(State(state): State<AppState>) -> Response {
    Json(state.limiter.recent_requests().await).into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(state.limiter.stats().await).into_response()
}

/// Map a decision onto the caller-visible status code.
fn status_for(decision: &Decision) -> StatusCode {
    match decision.action {
        Action::Ban => StatusCode::FORBIDDEN,
        Action::Throttle => StatusCode::TOO_MANY_REQUESTS,
        Action::Allow | Action::Flag => StatusCode::OK,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Client IP attribution: first `X-Forwarded-For` entry, else the socket
/// peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    peer.ip().to_string()
}
