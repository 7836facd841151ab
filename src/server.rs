//! HTTP chat server.
//!
//! Exposes the question-answering pipeline and the usage counters as a
//! small JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` , `/health` | Health check (service name and version) |
//! | `POST` | `/chat` | Answer a question with citations |
//! | `GET`  | `/usage` | Usage counter snapshot |
//! | `POST` | `/usage/reset` | Zero the counters (requires `x-admin-secret`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "input_rejected", "message": "question is 240 characters long; the limit is 200" } }
//! ```
//!
//! Error codes: `input_rejected` (400), `unauthorized` (401), `not_found`
//! (404), `internal` (500). Provider outages are not errors: `/chat`
//! answers with `"provider": "degraded"` instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser chat widgets
//! can call the API directly.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::RagError;
use crate::models::{ChatRequest, ChatResponse};
use crate::pipeline::Assistant;
use crate::usage::{UsageCounters, UsageSnapshot};

/// Header carrying the usage-reset secret.
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

const SERVICE_NAME: &str = "askdocs";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub assistant: Arc<Assistant>,
    pub usage: Arc<UsageCounters>,
    /// Secret required by `POST /usage/reset`; reset is disabled when `None`.
    pub admin_secret: Option<String>,
}

/// Build the router with all routes and the CORS layer.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_health))
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/usage", get(handle_usage))
        .route("/usage/reset", post(handle_usage_reset))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let usage = Arc::new(UsageCounters::new());
    let assistant = Arc::new(Assistant::from_config(config, usage.clone())?);
    let state = AppState {
        assistant,
        usage,
        admin_secret: config.server.admin_secret.clone(),
    };

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("listening on http://{}", bind_addr);
    println!("askdocs listening on http://{}", bind_addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::InputRejected { .. } => {
                AppError::new(StatusCode::BAD_REQUEST, "input_rejected", err.to_string())
            }
            other => AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", other.to_string()),
        }
    }
}

// ============ GET / and /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /chat ============

/// Answers one question. Over-long questions are rejected with 400 before
/// any provider is called.
async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id);

    async move {
        let response = state.assistant.ask(&request).await?;
        info!(
            provider = ?response.provider,
            sources = response.sources.len(),
            "answered"
        );
        Ok::<_, AppError>(Json(response))
    }
    .instrument(span)
    .await
}

// ============ /usage ============

async fn handle_usage(State(state): State<AppState>) -> Json<UsageSnapshot> {
    Json(state.usage.snapshot())
}

async fn handle_usage_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let expected = state
        .admin_secret
        .as_deref()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", "usage reset is disabled"))?;

    let provided = headers
        .get(ADMIN_SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if !bool::from(provided.ct_eq(expected.as_bytes())) {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin secret",
        ));
    }

    state.usage.reset();
    info!("usage counters reset");
    Ok(StatusCode::NO_CONTENT)
}
