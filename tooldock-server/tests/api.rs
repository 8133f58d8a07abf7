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

//! Router-level tests for the serving host: auth, tool routes, store
//! round trips, and legacy file routes. No Python children are spawned;
//! transport behavior is covered by the executor's own tests.

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use tooldock_server::config::Config;
use tooldock_server::{api, build_state, ServeOptions};

struct TestHost {
    state: TempDir,
    app: Router,
}

fn host_with(manifests: &[(&str, &str)], auth_token: Option<&str>) -> TestHost {
    let state = TempDir::new().unwrap();

    let tools_dir = state.path().join("tools");
    for (name, text) in manifests {
        let dir = tools_dir.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tooldock.yaml"), text).unwrap();
    }

    let mut config = Config::default();
    config.state.root = state.path().to_path_buf();
    config.auth.token = auth_token.map(str::to_string);

    let app_state = build_state(config, &ServeOptions::default()).unwrap();
    let app = api::router(app_state);

    TestHost { state, app }
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

const CALC: &str = r#"
name: calc
version: "1.0"
description: Arithmetic
capabilities: [math]
rpc:
  methods:
    add:
      description: Add two numbers
      input:
        type: object
        properties:
          a: {type: number}
          b: {type: number}
"#;

const SVC: &str = r#"
name: svc
runtime:
  mode: persistent
  transport: framed
rpc:
  methods:
    ping:
      description: Ping
"#;

#[tokio::test]
async fn health_is_open() {
    let host = host_with(&[], None);
    let response = host.app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn auth_guards_every_route() {
    let host = host_with(&[], Some("T"));

    let response = host.app.clone().oneshot(get("/v1/tools")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/v1/tools")
        .header("authorization", "Bearer T")
        .body(Body::empty())
        .unwrap();
    let response = host.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = host
        .app
        .clone()
        .oneshot(get("/v1/tools?token=T"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/v1/tools")
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let response = host.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tools_list_and_info() {
    let host = host_with(&[("calc", CALC)], None);

    let response = host.app.clone().oneshot(get("/v1/tools")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = body_json(response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["name"], "calc");
    assert_eq!(list[0]["mode"], "oneshot");
    assert_eq!(list[0]["status"], "stopped");
    assert_eq!(list[0]["methods"][0], "add");
    assert!(list[0].get("health_status").is_none());

    let response = host
        .app
        .clone()
        .oneshot(get("/v1/tools/calc"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert_eq!(info["version"], "1.0");
    assert_eq!(info["capabilities"][0], "math");
    assert!(info["methods"]["add"].is_object());

    let response = host
        .app
        .clone()
        .oneshot(get("/v1/tools/ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn schema_returns_raw_methods_map() {
    let host = host_with(&[("calc", CALC)], None);
    let response = host
        .app
        .oneshot(get("/v1/tools/calc/schema"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let schema = body_json(response).await;
    assert_eq!(schema["add"]["description"], "Add two numbers");
    assert_eq!(schema["add"]["input"]["properties"]["a"]["type"], "number");
}

#[tokio::test]
async fn start_rejects_oneshot_tools() {
    let host = host_with(&[("calc", CALC)], None);
    let response = host
        .app
        .oneshot(post_json("/v1/tools/calc/start", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("not a persistent"));
}

#[tokio::test]
async fn stop_rejects_stopped_tools() {
    let host = host_with(&[("svc", SVC)], None);
    let response = host
        .app
        .oneshot(post_json("/v1/tools/svc/stop", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn call_on_stopped_persistent_tool_is_rejected() {
    let host = host_with(&[("svc", SVC)], None);
    // Pre-create the environment so no provisioning runs.
    std::fs::create_dir_all(host.state.path().join("envs").join("tool-svc")).unwrap();

    let response = host
        .app
        .oneshot(post_json("/v1/tools/svc/ping", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("not running"));
}

#[tokio::test]
async fn call_unknown_tool_and_method_are_not_found() {
    let host = host_with(&[("calc", CALC)], None);

    let response = host
        .app
        .clone()
        .oneshot(post_json("/v1/tools/ghost/add", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = host
        .app
        .clone()
        .oneshot(post_json("/v1/tools/calc/divide", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn store_import_info_content_round_trip() {
    let host = host_with(&[], None);

    let source = host.state.path().join("payload.txt");
    std::fs::write(&source, b"store me").unwrap();

    let response = host
        .app
        .clone()
        .oneshot(post_json(
            "/v1/store",
            serde_json::json!({"path": source.display().to_string(), "name": "payload.txt"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    let id = info["id"].as_str().unwrap().to_string();
    assert_eq!(info["size"], 8);
    assert_eq!(info["name"], "payload.txt");
    assert!(info.get("expires_at").is_none());

    let response = host
        .app
        .clone()
        .oneshot(get(&format!("/v1/store/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["sha256"], info["sha256"]);

    let response = host
        .app
        .clone()
        .oneshot(get(&format!("/v1/store/{id}/content")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"store me");

    let response = host
        .app
        .clone()
        .oneshot(get("/v1/store"))
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert_eq!(listing["files"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn store_patch_and_delete() {
    let host = host_with(&[], None);

    let source = host.state.path().join("a.bin");
    std::fs::write(&source, b"x").unwrap();

    let response = host
        .app
        .clone()
        .oneshot(post_json(
            "/v1/store",
            serde_json::json!({"path": source.display().to_string()}),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("PATCH")
        .uri(format!("/v1/store/{id}"))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"name": "renamed", "ttl": 120}).to_string(),
        ))
        .unwrap();
    let response = host.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert_eq!(info["name"], "renamed");
    assert!(info["expires_at"].as_i64().unwrap() > 0);

    // ttl: 0 flips the file back to permanent.
    let request = Request::builder()
        .method("PATCH")
        .uri(format!("/v1/store/{id}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({"ttl": 0}).to_string()))
        .unwrap();
    let response = host.app.clone().oneshot(request).await.unwrap();
    let info = body_json(response).await;
    assert!(info.get("expires_at").is_none());

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/store/{id}"))
        .body(Body::empty())
        .unwrap();
    let response = host.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = host
        .app
        .clone()
        .oneshot(get(&format!("/v1/store/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn store_import_requires_a_path() {
    let host = host_with(&[], None);
    let response = host
        .app
        .oneshot(post_json("/v1/store", serde_json::json!({"name": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn store_multipart_import() {
    let host = host_with(&[], None);

    let boundary = "XTESTBOUNDARY";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         multipart bytes\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"ttl\"\r\n\r\n\
         0\r\n\
         --{boundary}--\r\n"
    );

    let request = Request::builder()
        .method("POST")
        .uri("/v1/store")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = host.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert_eq!(info["name"], "notes.txt");
    assert_eq!(info["size"], 15);

    let id = info["id"].as_str().unwrap();
    let response = host
        .app
        .clone()
        .oneshot(get(&format!("/v1/store/{id}/content")))
        .await
        .unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"multipart bytes");
}

#[tokio::test]
async fn legacy_file_routes() {
    let host = host_with(&[], None);

    let response = host.app.clone().oneshot(get("/v1/files")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!([]));

    let response = host
        .app
        .clone()
        .oneshot(get("/v1/files/missing.png"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("DELETE")
        .uri("/v1/files/missing.png")
        .body(Body::empty())
        .unwrap();
    let response = host.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
