use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::warn;

use super::store::DeploymentStore;
use super::vcs;
use super::webhook::{self, EVENT_HEADER, SIGNATURE_HEADER, WebhookRouter};
use crate::errors::{DeployError, WebhookError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn DeploymentStore>,
    pub router: WebhookRouter,
    pub webhook_secret: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub project_name: String,
    pub github_repo: String,
    #[serde(default)]
    pub framework: String,
}

/// Query for the deployment history of one repo+branch.
#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    pub repo: String,
    pub branch: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        ApiError::Unauthorized(err.to_string())
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::UserInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/webhook", post(receive_webhook))
        .route("/api/deployments", get(list_route_deployments))
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/users/{id}/projects", post(add_user_project))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn receive_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = webhook::authenticate(state.webhook_secret.as_deref(), signature, &body) {
        warn!(error = %e, "webhook rejected");
        return Err(e.into());
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("Missing {} header", EVENT_HEADER)))?;

    let ack = state.router.handle(event, &body).await?;
    Ok(Json(ack))
}

async fn get_deployment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .store
        .get_deployment(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Deployment {} not found", id)))?;
    Ok(Json(deployment))
}

async fn list_route_deployments(
    State(state): State<SharedState>,
    Query(query): Query<RouteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let deployments = state
        .store
        .list_deployments_for_route(&query.repo, &query.branch)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(deployments))
}

async fn add_user_project(
    State(state): State<SharedState>,
    Path(user_id): Path<i64>,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if req.project_name.trim().is_empty() {
        return Err(ApiError::BadRequest("projectName must not be empty".into()));
    }
    vcs::validate_repo_url(&req.github_repo).map_err(ApiError::BadRequest)?;

    state
        .store
        .get_user(user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("User {} not found", user_id)))?;

    let project = state
        .store
        .create_project(req.project_name.trim(), &req.github_repo, &req.framework)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    state
        .store
        .add_project_to_user(user_id, project.id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((StatusCode::CREATED, Json(project)))
}
