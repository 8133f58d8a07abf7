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

//! Broker HTTP surface: child management routes, aggregated tool
//! listing, and the reverse proxy for tool requests.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::Broker;

/// Maximum proxied request body.
const MAX_PROXY_BODY: usize = 256 * 1024 * 1024;

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/v1/broker/register", post(register_child))
        .route("/v1/broker/heartbeat", post(heartbeat_child))
        .route("/v1/broker/children", get(list_children))
        .route("/v1/tools", get(list_tools))
        .route("/v1/tools/*path", any(proxy_tool))
        .route("/v1/store", any(store_unimplemented))
        .route("/v1/store/*path", any(store_unimplemented))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

async fn health(State(broker): State<Arc<Broker>>) -> Json<serde_json::Value> {
    let children = broker.children();
    let healthy = children
        .iter()
        .filter(|c| c.status == super::ChildStatus::Healthy)
        .count();

    Json(json!({
        "status": "ok",
        "mode": "broker",
        "children_total": children.len(),
        "children_healthy": healthy,
    }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    tools: Vec<String>,
}

async fn register_child(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.id.is_empty() || req.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "id and url are required");
    }

    let name = if req.name.is_empty() {
        req.id.clone()
    } else {
        req.name
    };

    broker.register(req.id.clone(), req.url, name, req.tools);

    Json(json!({
        "status": "registered",
        "id": req.id,
        "heartbeat_interval": broker.heartbeat_interval_secs(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    tools: Option<Vec<String>>,
}

async fn heartbeat_child(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    if req.id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "id is required");
    }

    if !broker.heartbeat(&req.id, req.tools) {
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("unknown child: {}", req.id),
        );
    }

    Json(json!({"status": "ok"})).into_response()
}

async fn list_children(State(broker): State<Arc<Broker>>) -> Response {
    Json(broker.children()).into_response()
}

async fn list_tools(State(broker): State<Arc<Broker>>) -> Response {
    Json(broker.list_tools().await).into_response()
}

/// Forward a tool request to the child that owns the tool, unchanged
/// except for the broker headers.
async fn proxy_tool(
    State(broker): State<Arc<Broker>>,
    Path(path): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let tool = path.split('/').next().unwrap_or_default();
    if tool.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "tool name required");
    }

    let Some(child) = broker.child_for_tool(tool) else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("no server available for tool: {tool}"),
        );
    };

    let (parts, body) = request.into_parts();

    let mut target = format!("{}/v1/tools/{}", child.url, path);
    if let Some(query) = parts.uri.query() {
        target.push('?');
        target.push_str(query);
    }

    let body_bytes = match to_bytes(body, MAX_PROXY_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let mut headers = parts.headers.clone();
    headers.remove(header::HOST);
    headers.insert(
        "x-forwarded-for",
        HeaderValue::from_str(&addr.ip().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );
    headers.insert("x-broker-request", HeaderValue::from_static("true"));

    let upstream = match broker
        .proxy_client()
        .request(parts.method.clone(), &target)
        .headers(headers)
        .body(body_bytes)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                &format!("failed to reach child server: {e}"),
            )
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    response_headers.remove(header::TRANSFER_ENCODING);
    response_headers.remove(header::CONNECTION);

    let stream = upstream
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

async fn store_unimplemented() -> Response {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "file store proxy not implemented - access child servers directly",
    )
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router() -> (Arc<Broker>, Router) {
        let broker = Arc::new(Broker::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
        ));
        (broker.clone(), router(broker))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn register_and_heartbeat_flow() {
        let (broker, app) = test_router();

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/broker/register",
                serde_json::json!({"id": "c1", "url": "http://h1:9801", "tools": ["w"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "registered");
        assert_eq!(body["heartbeat_interval"], 30);

        // Name defaults to the id.
        assert_eq!(broker.children()[0].name, "c1");

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/broker/heartbeat",
                serde_json::json!({"id": "c1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/broker/heartbeat",
                serde_json::json!({"id": "ghost"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn register_requires_id_and_url() {
        let (_, app) = test_router();
        let response = app
            .oneshot(post_json(
                "/v1/broker/register",
                serde_json::json!({"id": "c1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_child_counts() {
        let (broker, app) = test_router();
        broker.register("c1".into(), "http://h1".into(), "h1".into(), vec![]);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["mode"], "broker");
        assert_eq!(body["children_total"], 1);
        assert_eq!(body["children_healthy"], 1);
    }

    #[tokio::test]
    async fn store_routes_are_unimplemented() {
        let (_, app) = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/store")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn proxy_without_owner_is_unavailable() {
        let (_, app) = test_router();
        let mut request = Request::builder()
            .method("POST")
            .uri("/v1/tools/w/do")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(SocketAddr::from(
            ([127, 0, 0, 1], 40000),
        )));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
