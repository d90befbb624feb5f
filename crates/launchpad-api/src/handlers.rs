//! Front door handlers.
//!
//! Every handler answers `200 {}` on success and `{"error": ...}` otherwise.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use launchpad_core::{AccessEvent, Project, Service};
use launchpad_driver::DriverError;

use crate::auth::{bearer_token, AuthError};
use crate::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::Driver(DriverError::InvalidScale { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({})))
}

/// POST /v1/launchpad/project
pub async fn apply_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Project>, JsonRejection>,
) -> ApiResult {
    state.verifier.verify(bearer_token(&headers)?)?;
    let Json(project) = body?;

    state.driver.create_project(&project).await.inspect_err(|e| {
        error!(project = %project.id, error = %e, "could not create project");
    })?;
    ok()
}

/// POST /v1/launchpad/service
pub async fn apply_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Service>, JsonRejection>,
) -> ApiResult {
    state.verifier.verify(bearer_token(&headers)?)?;
    let Json(service) = body?;

    info!(project = %service.project_id, service = %service.id, "applying service");
    state.driver.apply_service(&service).await.inspect_err(|e| {
        error!(project = %service.project_id, service = %service.id, error = %e, "could not apply service");
    })?;
    ok()
}

/// POST /v1/launchpad/metrics
pub async fn report_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Vec<AccessEvent>>, JsonRejection>,
) -> ApiResult {
    state.verifier.verify_reporter(bearer_token(&headers)?)?;
    let Json(events) = body?;

    let total = events.len();
    let dropped = events
        .into_iter()
        .filter(|event| !state.recorder.record(event.clone()))
        .count();
    if dropped > 0 {
        warn!(total, dropped, "access channel full, metric events dropped");
    }
    ok()
}
