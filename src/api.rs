use crate::config::ApiConfig;
use crate::deposit::{DepositError, DepositPipeline, DepositRequest};
use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

/// Header carrying the verified external user id, set by the upstream
/// identity layer. This service does no identity verification of its own.
pub const EXTERNAL_USER_ID_HEADER: &str = "x-external-user-id";

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DepositPipeline>,
    /// Server-wide shutdown token; in-flight deposits get a child of it so
    /// shutdown aborts remaining steps and runs compensation
    pub shutdown: CancellationToken,
}

/// Successful deposit response
#[derive(Debug, Serialize)]
pub struct DepositResponse {
    pub success: bool,
    pub image_url: String,
    pub transaction_id: Uuid,
    pub status: &'static str,
}

/// Error response with a stable kind and human-readable detail
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: &'static str,
    pub detail: String,
}

impl ErrorResponse {
    fn invalid(detail: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                success: false,
                error: "InvalidRequest",
                detail: detail.into(),
            }),
        )
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/deposits", post(create_deposit))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "deposit-service"
    }))
}

/// Handle an image deposit: multipart body with an `image` part, external
/// user id in the identity header
#[instrument(skip(state, headers, multipart))]
async fn create_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DepositResponse>), (StatusCode, Json<ErrorResponse>)> {
    let external_user_id = headers
        .get(EXTERNAL_USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut image_bytes = Vec::new();
    let mut filename = String::from("upload.jpg");

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ErrorResponse::invalid(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("image") {
            if let Some(name) = field.file_name() {
                filename = name.to_string();
            }
            image_bytes = field
                .bytes()
                .await
                .map_err(|e| ErrorResponse::invalid(format!("failed to read image part: {e}")))?
                .to_vec();
        }
    }

    let request = DepositRequest {
        external_user_id,
        image_bytes,
        filename,
    };

    match state
        .pipeline
        .deposit(request, state.shutdown.child_token())
        .await
    {
        Ok(outcome) => Ok((
            StatusCode::CREATED,
            Json(DepositResponse {
                success: true,
                image_url: outcome.image_url,
                transaction_id: outcome.transaction_id,
                status: outcome.status.as_str(),
            }),
        )),
        Err(e) => Err((
            error_status(&e),
            Json(ErrorResponse {
                success: false,
                error: e.kind(),
                detail: e.to_string(),
            }),
        )),
    }
}

/// Map a classified deposit failure to an HTTP status
fn error_status(error: &DepositError) -> StatusCode {
    match error {
        DepositError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DepositError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        DepositError::UploadFailed(_)
        | DepositError::UserResolutionFailed(_)
        | DepositError::TransactionInsertFailed(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Start the deposit API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting deposit API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
