// Copyright 2025 Tooldock (https://github.com/tooldock)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Public HTTP surface of a serving host.

pub mod outputs;
pub mod store;
pub mod tools;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::executor::{Executor, ExecutorError};
use crate::files::{OutputManager, OutputError};
use crate::filestore::{Store, StoreError};
use crate::registry::ToolRegistry;

/// Upper bound on request bodies; sized for multipart file ingest.
pub(crate) const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<Executor>,
    pub outputs: Arc<OutputManager>,
    pub store: Option<Arc<Store>>,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match &err {
            ExecutorError::ToolNotFound(_) | ExecutorError::MethodNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            ExecutorError::NotRunning(_)
            | ExecutorError::AlreadyRunning(_)
            | ExecutorError::WrongMode(_) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<OutputError> for ApiError {
    fn from(err: OutputError) -> Self {
        match &err {
            OutputError::NotFound(_) => ApiError::NotFound(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

/// Bearer auth: when a credential is configured, every request must
/// present it via `Authorization: Bearer <token>` or a `token` query
/// parameter.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = &state.config.auth.token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query_param(request.uri().query(), "token"));

        let expected = format!("Bearer {token}");
        let authorized = matches!(&presented, Some(p) if *p == expected || p == token);
        if !authorized {
            return ApiError::Unauthorized.into_response();
        }
    }

    next.run(request).await
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the serving host's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tools", get(tools::list_tools))
        .route("/v1/tools/:name", get(tools::get_tool))
        .route("/v1/tools/:name/schema", get(tools::get_schema))
        .route("/v1/tools/:name/start", post(tools::start_tool))
        .route("/v1/tools/:name/stop", post(tools::stop_tool))
        .route("/v1/tools/:name/:method", post(tools::call_tool))
        .route("/v1/files", get(outputs::list_output_refs))
        .route(
            "/v1/files/:name",
            get(outputs::serve_output).delete(outputs::delete_output),
        )
        .route(
            "/v1/store",
            get(store::list_files).post(store::import_file),
        )
        .route(
            "/v1/store/:id",
            get(store::file_info)
                .patch(store::patch_file)
                .delete(store::delete_file),
        )
        .route("/v1/store/:id/content", get(store::file_content))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param(Some("a=1&token=T&b=2"), "token"),
            Some("T".to_string())
        );
        assert_eq!(query_param(Some("a=1"), "token"), None);
        assert_eq!(query_param(None, "token"), None);
    }

    #[test]
    fn executor_errors_map_to_statuses() {
        let e: ApiError = ExecutorError::ToolNotFound("x".into()).into();
        assert!(matches!(e, ApiError::NotFound(_)));

        let e: ApiError = ExecutorError::WrongMode("x".into()).into();
        assert!(matches!(e, ApiError::BadRequest(_)));

        let e: ApiError = ExecutorError::Tool("ValueError: bad".into()).into();
        assert!(matches!(e, ApiError::Internal(_)));
    }
}
