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

//! Tool routes: listing, info, schema, lifecycle, and method calls with
//! multipart ingest and schema-driven output wrapping.

use std::collections::HashSet;
use std::path::{Path as FsPath, PathBuf};

use axum::body::to_bytes;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use super::{ApiError, AppState, MAX_BODY_BYTES};
use crate::files::OutputManager;
use tooldock_core::Method;

/// GET /v1/tools - summary list of installed tools.
pub async fn list_tools(State(state): State<AppState>) -> Response {
    Json(state.registry.list()).into_response()
}

/// GET /v1/tools/{name} - detailed info.
pub async fn get_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let info = state
        .registry
        .info(&name)
        .ok_or_else(|| ApiError::NotFound(format!("tool not found: {name}")))?;
    Ok(Json(info).into_response())
}

/// GET /v1/tools/{name}/schema - raw methods map.
pub async fn get_schema(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let tool = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("tool not found: {name}")))?;
    Ok(Json(tool.manifest.rpc.methods.clone()).into_response())
}

/// POST /v1/tools/{name}/start - start a persistent tool's shared child.
pub async fn start_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.executor.start(&name).await?;
    Ok(Json(json!({"status": "started", "tool": name})).into_response())
}

/// POST /v1/tools/{name}/stop - stop the shared child.
pub async fn stop_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.executor.stop(&name).await?;
    Ok(Json(json!({"status": "stopped", "tool": name})).into_response())
}

/// POST /v1/tools/{name}/{method} - invoke a method with a JSON or
/// multipart body.
pub async fn call_tool(
    State(state): State<AppState>,
    Path((name, method_name)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let tool = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("tool not found: {name}")))?;
    let method = tool
        .manifest
        .rpc
        .methods
        .get(&method_name)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("method not found: {method_name}")))?;

    let (params, temp_files) = parse_request_params(&state, &method, request).await?;

    let result = state.executor.call(&name, &method_name, params).await;

    // Spooled inputs are removed whether the call succeeded or not.
    state.outputs.cleanup_all(&temp_files);

    let value = result.map_err(ApiError::from)?;
    let wrapped = wrap_file_outputs(&state.outputs, value, &method);
    Ok(Json(wrapped).into_response())
}

/// Decode the request body into a params map. Multipart file parts are
/// spooled to temp paths which become the corresponding param values; a
/// non-file part named `params` carries JSON merged in without
/// overriding file keys.
async fn parse_request_params(
    state: &AppState,
    method: &Method,
    request: Request,
) -> Result<(Map<String, Value>, Vec<PathBuf>), ApiError> {
    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to parse multipart form: {e}")))?;
        return parse_multipart(state, method, multipart).await;
    }

    let bytes = to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;

    if bytes.is_empty() {
        return Ok((Map::new(), Vec::new()));
    }

    let params: Map<String, Value> = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?;
    Ok((params, Vec::new()))
}

async fn parse_multipart(
    state: &AppState,
    method: &Method,
    multipart: Multipart,
) -> Result<(Map<String, Value>, Vec<PathBuf>), ApiError> {
    let mut temp_files: Vec<PathBuf> = Vec::new();
    match parse_multipart_fields(state, method, multipart, &mut temp_files).await {
        Ok(params) => Ok((params, temp_files)),
        Err(e) => {
            // Anything already spooled goes with the failed request.
            state.outputs.cleanup_all(&temp_files);
            Err(e)
        }
    }
}

async fn parse_multipart_fields(
    state: &AppState,
    method: &Method,
    mut multipart: Multipart,
    temp_files: &mut Vec<PathBuf>,
) -> Result<Map<String, Value>, ApiError> {
    let file_fields: HashSet<String> = method
        .input_file_fields()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut params = Map::new();
    let mut uploaded: HashSet<String> = HashSet::new();
    let mut params_json: Option<Map<String, Value>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to parse multipart form: {e}")))?
    {
        let Some(field_name) = field.name().map(str::to_string) else {
            continue;
        };

        if let Some(filename) = field.file_name().map(str::to_string) {
            let data = field.bytes().await.map_err(|e| {
                ApiError::BadRequest(format!("failed to read upload {field_name}: {e}"))
            })?;
            let path = state.outputs.save_upload(&filename, &data).map_err(|e| {
                ApiError::Internal(format!("failed to save upload {field_name}: {e}"))
            })?;
            temp_files.push(path.clone());
            uploaded.insert(field_name.clone());
            params.insert(field_name, Value::String(path.display().to_string()));
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read field {field_name}: {e}")))?;

        if field_name == "params" {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) {
                params_json = Some(map);
            }
        } else if !file_fields.contains(&field_name) && !uploaded.contains(&field_name) {
            params.insert(field_name, Value::String(text));
        }
    }

    // Members of the `params` JSON part never override file keys.
    if let Some(map) = params_json {
        for (key, value) in map {
            if !file_fields.contains(&key) && !uploaded.contains(&key) {
                params.insert(key, value);
            }
        }
    }

    Ok(params)
}

/// Walk the result tree and replace any field whose output schema type
/// is `file` and whose value is an existing file path with a serving
/// ref. Wrapping is driven by the declared schema, never by guessing at
/// path-like strings.
pub fn wrap_file_outputs(outputs: &OutputManager, value: Value, method: &Method) -> Value {
    let file_fields: HashSet<&str> = method.output_file_fields().into_iter().collect();
    if file_fields.is_empty() {
        return value;
    }
    wrap_value(outputs, value, &file_fields)
}

fn wrap_value(outputs: &OutputManager, value: Value, file_fields: &HashSet<&str>) -> Value {
    match value {
        Value::Object(map) => {
            let mut wrapped = Map::new();
            for (key, val) in map {
                if file_fields.contains(key.as_str()) {
                    if let Value::String(path) = &val {
                        if is_file_path(path) {
                            if let Ok(file_ref) = outputs.register_output(FsPath::new(path)) {
                                let entry = serde_json::to_value(file_ref)
                                    .unwrap_or(Value::Null);
                                wrapped.insert(key, entry);
                                continue;
                            }
                        }
                    }
                }
                wrapped.insert(key, wrap_value(outputs, val, file_fields));
            }
            Value::Object(wrapped)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| wrap_value(outputs, item, file_fields))
                .collect(),
        ),
        other => other,
    }
}

fn is_file_path(s: &str) -> bool {
    s.starts_with('/')
        && std::fs::metadata(s)
            .map(|m| m.is_file())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tooldock_core::Manifest;

    fn outputs(dir: &TempDir) -> OutputManager {
        OutputManager::new(dir.path().join("uploads"), dir.path().join("outputs")).unwrap()
    }

    fn method_with_file_output() -> Method {
        let manifest = Manifest::from_yaml(
            r#"
name: t
rpc:
  methods:
    render:
      description: render
      output:
        type: object
        properties:
          image:
            type: file
          caption:
            type: string
"#,
        )
        .unwrap();
        manifest.rpc.methods["render"].clone()
    }

    #[test]
    fn file_typed_output_is_wrapped() {
        let dir = TempDir::new().unwrap();
        let mgr = outputs(&dir);

        let out_file = dir.path().join("a.png");
        std::fs::write(&out_file, b"img").unwrap();

        let result = json!({
            "image": out_file.display().to_string(),
            "caption": "a cat",
        });

        let wrapped = wrap_file_outputs(&mgr, result, &method_with_file_output());
        let image = &wrapped["image"];
        assert!(image.is_object());
        assert_eq!(image["size"], json!(3));
        assert!(image["url"].as_str().unwrap().starts_with("/v1/files/"));
        assert!(image["url"].as_str().unwrap().ends_with(".png"));
        assert_eq!(image["ref"].as_str().unwrap().len(), 8);
        assert_eq!(wrapped["caption"], json!("a cat"));
    }

    #[test]
    fn nested_results_are_walked() {
        let dir = TempDir::new().unwrap();
        let mgr = outputs(&dir);

        let out_file = dir.path().join("b.png");
        std::fs::write(&out_file, b"img").unwrap();

        let result = json!({
            "frames": [
                {"image": out_file.display().to_string()},
                {"image": "/does/not/exist.png"},
            ]
        });

        let wrapped = wrap_file_outputs(&mgr, result, &method_with_file_output());
        assert!(wrapped["frames"][0]["image"].is_object());
        // Missing files are left untouched.
        assert_eq!(wrapped["frames"][1]["image"], json!("/does/not/exist.png"));
    }

    #[test]
    fn non_file_schema_leaves_result_alone() {
        let dir = TempDir::new().unwrap();
        let mgr = outputs(&dir);
        let method = Method::default();

        let out_file = dir.path().join("c.png");
        std::fs::write(&out_file, b"img").unwrap();

        let result = json!({"image": out_file.display().to_string()});
        let wrapped = wrap_file_outputs(&mgr, result.clone(), &method);
        assert_eq!(wrapped, result);
    }

    #[test]
    fn relative_paths_are_never_wrapped() {
        assert!(!is_file_path("relative/path.png"));
        assert!(!is_file_path(""));
    }
}
