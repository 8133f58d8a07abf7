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

//! Legacy per-call output-ref routes.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::{ApiError, AppState};
use crate::files::media_type_for;

/// GET /v1/files - list live output refs.
pub async fn list_output_refs(State(state): State<AppState>) -> Response {
    Json(state.outputs.list_outputs()).into_response()
}

/// GET /v1/files/{name} - stream an output file.
pub async fn serve_output(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let path = state
        .outputs
        .output_path(&name)
        .ok_or_else(|| ApiError::NotFound(format!("file not found: {name}")))?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("file not found: {name}")))?;

    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let response = Response::builder()
        .header(header::CONTENT_TYPE, media_type_for(&ext))
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

/// DELETE /v1/files/{name} - drop an output ref and its file. The name
/// may carry the serving extension.
pub async fn delete_output(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let ref_id = name
        .split_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(name.as_str());
    state.outputs.delete_output(ref_id)?;
    Ok(Json(json!({"status": "deleted"})).into_response())
}
