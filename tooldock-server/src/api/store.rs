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

//! Durable file store routes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::{ApiError, AppState};
use crate::files::media_type_for;
use crate::filestore::Store;

fn store_of(state: &AppState) -> Result<Arc<Store>, ApiError> {
    state
        .store
        .clone()
        .ok_or_else(|| ApiError::Unavailable("file store not configured".to_string()))
}

/// GET /v1/store - list files, excluding expired rows unless asked.
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let store = store_of(&state)?;
    let include_expired = query.get("include_expired").map(String::as_str) == Some("true");
    let files = store.list(include_expired)?;
    Ok(Json(json!({"files": files})).into_response())
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    ttl: i64,
}

/// POST /v1/store - import a file, from a multipart upload or a
/// JSON-with-path body.
pub async fn import_file(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let store = store_of(&state)?;

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (source, name, ttl, temp): (PathBuf, String, i64, Option<PathBuf>) =
        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(request, &())
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to parse form: {e}")))?;
            let (path, name, ttl) = read_upload_form(&state, multipart).await?;
            (path.clone(), name, ttl, Some(path))
        } else {
            let bytes = axum::body::to_bytes(request.into_body(), super::MAX_BODY_BYTES)
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
            let req: ImportRequest = serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?;
            if req.path.is_empty() {
                return Err(ApiError::BadRequest("path is required".to_string()));
            }
            (PathBuf::from(req.path), req.name, req.ttl, None)
        };

    let import_store = store.clone();
    let result = tokio::task::spawn_blocking(move || import_store.import(&source, &name, ttl))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if let Some(temp) = temp {
        let _ = std::fs::remove_file(temp);
    }

    let info = result.map_err(|e| ApiError::Internal(format!("import failed: {e}")))?;
    Ok(Json(info).into_response())
}

/// Pull the file part plus optional `name` and `ttl` fields out of an
/// upload form. The file is spooled through the uploads directory.
async fn read_upload_form(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<(PathBuf, String, i64), ApiError> {
    let mut spooled: Option<(PathBuf, String)> = None;
    let mut name = String::new();
    let mut ttl: i64 = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to parse form: {e}")))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
                let path = state
                    .outputs
                    .save_upload(&filename, &data)
                    .map_err(|e| ApiError::Internal(format!("failed to save upload: {e}")))?;
                spooled = Some((path, filename));
            }
            Some("name") => {
                name = field.text().await.unwrap_or_default();
            }
            Some("ttl") => {
                ttl = field
                    .text()
                    .await
                    .unwrap_or_default()
                    .parse()
                    .unwrap_or_default();
            }
            _ => {}
        }
    }

    let (path, filename) = spooled.ok_or_else(|| ApiError::BadRequest("no file provided".into()))?;
    if name.is_empty() {
        name = filename;
    }
    Ok((path, name, ttl))
}

/// GET /v1/store/{id} - file metadata.
pub async fn file_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = store_of(&state)?;
    let info = store.info(&id)?;
    Ok(Json(info).into_response())
}

/// GET /v1/store/{id}/content - stream blob bytes.
pub async fn file_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = store_of(&state)?;
    let info = store.info(&id)?;

    // The row may outlive the blob for an instant around GC; treat an
    // unopenable blob as not found.
    let file = tokio::fs::File::open(&info.path)
        .await
        .map_err(|_| ApiError::NotFound(format!("file not found: {id}")))?;

    let ext = std::path::Path::new(&info.name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let stream = ReaderStream::new(file);
    let response = Response::builder()
        .header(header::CONTENT_TYPE, media_type_for(&ext))
        .header(header::CONTENT_LENGTH, info.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", info.name),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub(crate) struct PatchRequest {
    #[serde(default)]
    name: String,
    // Pointer semantics: absent leaves the TTL unchanged, 0 makes the
    // file permanent.
    ttl: Option<i64>,
}

/// PATCH /v1/store/{id} - rename and/or reset TTL.
pub(crate) async fn patch_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PatchRequest>,
) -> Result<Response, ApiError> {
    let store = store_of(&state)?;

    if !req.name.is_empty() {
        store.rename(&id, &req.name)?;
    }
    if let Some(ttl) = req.ttl {
        store.set_ttl(&id, ttl)?;
    }

    let info = store.info(&id)?;
    Ok(Json(info).into_response())
}

/// DELETE /v1/store/{id} - remove row and blob.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = store_of(&state)?;
    store.delete(&id)?;
    Ok(Json(json!({"status": "deleted", "id": id})).into_response())
}
