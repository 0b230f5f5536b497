use anyhow::Context;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::rules::{Rule, RuleError, RuleStore, Upserted};
use crate::solar::SolarResolver;
use crate::telemetry::{Reading, TelemetryWindow};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AppState<S> {
    pub rules: Arc<RuleStore<S>>,
    pub telemetry: Arc<TelemetryWindow>,
}

// Manual impl: `S` itself need not be Clone.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            rules: Arc::clone(&self.rules),
            telemetry: Arc::clone(&self.telemetry),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub enum ApiError {
    InvalidJson(JsonRejection),
    InvalidId(PathRejection),
    Rule(RuleError),
}

impl From<RuleError> for ApiError {
    fn from(err: RuleError) -> Self {
        Self::Rule(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidJson(rejection) => {
                tracing::debug!("web: rejected body: {}", rejection.body_text());
                (StatusCode::BAD_REQUEST, "Invalid JSON format".to_string())
            }
            Self::InvalidId(rejection) => (StatusCode::BAD_REQUEST, rejection.body_text()),
            Self::Rule(err) => {
                let status = match &err {
                    RuleError::Invalid(_) => StatusCode::BAD_REQUEST,
                    RuleError::NotFound(_) => StatusCode::NOT_FOUND,
                    RuleError::Resolution { .. } => StatusCode::BAD_GATEWAY,
                    RuleError::Persist(_) => {
                        tracing::error!(error = %err, "web: rule change not persisted");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<S: SolarResolver + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route(
            "/config",
            get(list_rules::<S>)
                .post(upsert_rule::<S>)
                .delete(clear_rules::<S>),
        )
        .route("/config/{id}", put(replace_rule::<S>))
        .route("/latest-data", get(latest_data::<S>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn list_rules<S: SolarResolver>(State(state): State<AppState<S>>) -> Json<Vec<Rule>> {
    Json(state.rules.list().await)
}

async fn upsert_rule<S: SolarResolver>(
    State(state): State<AppState<S>>,
    body: Result<Json<Rule>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(rule) = body.map_err(ApiError::InvalidJson)?;
    let message = match state.rules.upsert(rule).await? {
        Upserted::Added => "Configuration added successfully",
        Upserted::Updated => "Configuration updated successfully",
    };
    Ok(Json(json!({ "message": message })))
}

async fn replace_rule<S: SolarResolver>(
    State(state): State<AppState<S>>,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<Rule>, JsonRejection>,
) -> Result<Json<Rule>, ApiError> {
    let Path(id) = id.map_err(ApiError::InvalidId)?;
    let Json(rule) = body.map_err(ApiError::InvalidJson)?;
    Ok(Json(state.rules.replace(id, rule).await?))
}

async fn clear_rules<S: SolarResolver>(
    State(state): State<AppState<S>>,
) -> Result<impl IntoResponse, ApiError> {
    state.rules.clear().await?;
    Ok(Json(json!({ "message": "All configurations cleared successfully" })))
}

async fn latest_data<S: SolarResolver>(State(state): State<AppState<S>>) -> Json<Vec<Reading>> {
    Json(state.telemetry.snapshot().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))
}

/// Serve the API until `cancel` fires.
pub async fn serve<S: SolarResolver + 'static>(
    listener: TcpListener,
    state: AppState<S>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("http api listening on http://{addr}");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("http api stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
