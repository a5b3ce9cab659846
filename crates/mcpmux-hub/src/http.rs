//! Downstream streamable-HTTP endpoint.
//!
//! One path, three verbs. `POST` carries JSON-RPC (object or batch array):
//! requests answer with JSON, notification-only bodies with `202`, and a
//! single request carrying `_meta.progressToken` under an SSE-capable
//! `Accept` header upgrades to a per-request event stream that carries
//! progress events and terminates with the final response. `GET` opens the
//! session's event stream, `DELETE` ends the session. The `mcp-session-id`
//! header travels in both directions.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use futures::StreamExt;
use mcpmux_protocol::{JsonRpcMessage, JsonRpcResponse, ProgressToken, RequestId};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::fanout::OutboundFrame;
use crate::hub::Hub;

/// Session id header, both directions.
pub const MCP_SESSION_ID: &str = "mcp-session-id";

const SSE_KEEPALIVE: Duration = Duration::from_secs(30);

/// Build the downstream axum application.
pub fn app(hub: Arc<Hub>) -> axum::Router {
    axum::Router::new().route("/", any(root)).with_state(hub)
}

async fn root(
    State(hub): State<Arc<Hub>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match method {
        Method::POST => handle_post(hub, &headers, &body).await,
        Method::GET => handle_get(hub, &headers),
        Method::DELETE => handle_delete(hub, &headers),
        _ => {
            let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, POST, DELETE"));
            response
        }
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn accepts(headers: &HeaderMap, content_type: &str) -> bool {
    match header_str(headers, "accept") {
        // An absent Accept header accepts everything.
        None => true,
        Some(accept) => accept
            .split(',')
            .map(|part| part.split(';').next().unwrap_or("").trim())
            .any(|media| media == content_type || media == "*/*"),
    }
}

fn session_id_or_new(headers: &HeaderMap) -> String {
    header_str(headers, MCP_SESSION_ID)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(MCP_SESSION_ID, value);
    }
    response
}

fn json_response(status: StatusCode, body: &JsonRpcResponse) -> Response {
    (status, axum::Json(serde_json::to_value(body).unwrap_or(Value::Null))).into_response()
}

async fn handle_post(hub: Arc<Hub>, headers: &HeaderMap, body: &Bytes) -> Response {
    if !accepts(headers, "application/json") && !accepts(headers, "text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &JsonRpcResponse::parse_error("request body is not valid JSON"),
        );
    };

    let session_id = session_id_or_new(headers);
    let router = hub.router();

    match parsed {
        Value::Array(items) => {
            if items.is_empty() {
                let error = JsonRpcResponse::error(
                    RequestId::Number(0),
                    mcpmux_protocol::JsonRpcError::new(
                        mcpmux_protocol::JsonRpcErrorCode::InvalidRequest,
                        "empty batch",
                    ),
                );
                return with_session_header(
                    json_response(StatusCode::BAD_REQUEST, &error),
                    &session_id,
                );
            }
            let mut responses = Vec::new();
            for item in items {
                match JsonRpcMessage::from_value(item) {
                    Ok(message) => {
                        if let Some(response) = router.handle_message(&session_id, message).await
                        {
                            responses.push(response);
                        }
                    }
                    Err(error) => {
                        responses.push(JsonRpcResponse::parse_error(error.to_string()));
                    }
                }
            }
            let response = if responses.is_empty() {
                // Notification-only batch.
                StatusCode::ACCEPTED.into_response()
            } else {
                (StatusCode::OK, axum::Json(serde_json::to_value(&responses).unwrap_or(Value::Null)))
                    .into_response()
            };
            with_session_header(response, &session_id)
        }
        single => {
            let message = match JsonRpcMessage::from_value(single.clone()) {
                Ok(message) => message,
                Err(error) => {
                    let response = match single.get("id").and_then(RequestId::from_value) {
                        Some(id) => JsonRpcResponse::error(
                            id,
                            mcpmux_protocol::JsonRpcError::new(
                                mcpmux_protocol::JsonRpcErrorCode::InvalidRequest,
                                error.to_string(),
                            ),
                        ),
                        None => JsonRpcResponse::parse_error(error.to_string()),
                    };
                    return with_session_header(
                        json_response(StatusCode::BAD_REQUEST, &response),
                        &session_id,
                    );
                }
            };

            let upgrade = matches!(
                &message,
                JsonRpcMessage::Request(request)
                    if wants_sse_upgrade(headers, request.params.as_ref())
            );
            if upgrade {
                return sse_upgraded_post(hub, router, session_id, message);
            }

            match message {
                JsonRpcMessage::Notification(_) | JsonRpcMessage::Response(_) => {
                    router.handle_message(&session_id, message).await;
                    with_session_header(StatusCode::ACCEPTED.into_response(), &session_id)
                }
                message => {
                    let response = router.handle_message(&session_id, message).await;
                    match response {
                        Some(response) => with_session_header(
                            json_response(StatusCode::OK, &response),
                            &session_id,
                        ),
                        None => {
                            with_session_header(StatusCode::ACCEPTED.into_response(), &session_id)
                        }
                    }
                }
            }
        }
    }
}

/// A single request upgrades to SSE when it carries a progress token and the
/// client is willing to read an event stream.
fn wants_sse_upgrade(headers: &HeaderMap, params: Option<&Value>) -> bool {
    accepts(headers, "text/event-stream")
        && header_str(headers, "accept").is_some()
        && ProgressToken::from_request_params(params).is_some()
}

fn sse_upgraded_post(
    hub: Arc<Hub>,
    router: Arc<crate::router::Router>,
    session_id: String,
    message: JsonRpcMessage,
) -> Response {
    // Per-request stream: progress events for this call land here, not on
    // the session's GET stream, and the final response terminates it.
    let stream_id = format!("{session_id}#{}", Uuid::new_v4());
    let receiver = hub.fanout().register_client(&stream_id);

    let fanout = hub.fanout();
    let task_session = session_id.clone();
    let task_stream = stream_id.clone();
    tokio::spawn(async move {
        let response = router
            .handle_message_routed(&task_session, &task_stream, message)
            .await;
        if let Some(response) = response {
            match serde_json::to_value(&response) {
                Ok(data) => {
                    fanout.send_to(&task_stream, OutboundFrame::message(data), Instant::now());
                }
                Err(error) => debug!(%error, "final response serialization failed"),
            }
        }
        // Dropping the sink closes the stream once buffered frames drain.
        fanout.unregister_client(&task_stream);
    });

    let stream = ReceiverStream::new(receiver).map(|frame| {
        let event = Event::default().data(frame.data.to_string());
        Ok::<_, Infallible>(match frame.event {
            Some(name) => event.event(name),
            None => event,
        })
    });
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEPALIVE)
            .text("keepalive"),
    );
    with_session_header(sse.into_response(), &session_id)
}

fn handle_get(hub: Arc<Hub>, headers: &HeaderMap) -> Response {
    if !accepts(headers, "text/event-stream")
        || header_str(headers, "accept").is_none()
    {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let session_id = session_id_or_new(headers);
    hub.sessions().create_or_touch(&session_id, Instant::now());
    let receiver = hub.fanout().register_client(&session_id);

    let stream = ReceiverStream::new(receiver).map(|frame| {
        let event = Event::default().data(frame.data.to_string());
        Ok::<_, Infallible>(match frame.event {
            Some(name) => event.event(name),
            None => event,
        })
    });
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEPALIVE)
            .text("keepalive"),
    );
    with_session_header(sse.into_response(), &session_id)
}

fn handle_delete(hub: Arc<Hub>, headers: &HeaderMap) -> Response {
    let Some(session_id) = header_str(headers, MCP_SESSION_ID).map(str::to_string) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    hub.router().cancel_session(&session_id);
    hub.fanout().unregister_client(&session_id);
    hub.sessions().delete(&session_id);
    with_session_header(StatusCode::OK.into_response(), &session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_app() -> axum::Router {
        app(Hub::new(HubConfig::default()))
    }

    fn post(body: &Value, accept: &str) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .header("accept", accept)
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_methods_get_405_with_allow() {
        let response = test_app()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers().get(header::ALLOW).unwrap(),
            "GET, POST, DELETE"
        );
    }

    #[tokio::test]
    async fn unacceptable_accept_gets_406() {
        let response = test_app()
            .oneshot(post(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), "text/html"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn malformed_json_gets_400_parse_error() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], json!(-32700));
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn notification_gets_202_with_session_header() {
        let response = test_app()
            .oneshot(post(
                &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                "application/json",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().contains_key(MCP_SESSION_ID));
    }

    #[tokio::test]
    async fn request_gets_200_json_and_generated_session_id() {
        let response = test_app()
            .oneshot(post(
                &json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}),
                "application/json",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(MCP_SESSION_ID));
        let body = body_json(response).await;
        assert_eq!(body["id"], json!(9));
        assert_eq!(body["result"], json!({}));
    }

    #[tokio::test]
    async fn provided_session_id_is_echoed() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .header(MCP_SESSION_ID, "my-session")
            .body(axum::body::Body::from(
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
            ))
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(MCP_SESSION_ID).unwrap(),
            "my-session"
        );
    }

    #[tokio::test]
    async fn batch_mixes_requests_and_notifications() {
        let response = test_app()
            .oneshot(post(
                &json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "ping"},
                    {"jsonrpc": "2.0", "method": "notifications/initialized"},
                    {"jsonrpc": "2.0", "id": 2, "method": "tools/list"}
                ]),
                "application/json",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let responses = body.as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], json!(1));
        assert_eq!(responses[1]["id"], json!(2));
        assert_eq!(responses[1]["result"]["tools"], json!([]));
    }

    #[tokio::test]
    async fn notification_only_batch_gets_202() {
        let response = test_app()
            .oneshot(post(
                &json!([{"jsonrpc": "2.0", "method": "notifications/initialized"}]),
                "application/json",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn get_without_event_stream_accept_gets_406() {
        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/")
            .header("accept", "application/json")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn get_opens_an_event_stream() {
        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/")
            .header("accept", "text/event-stream")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(MCP_SESSION_ID));
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
    }

    #[tokio::test]
    async fn delete_requires_and_honors_session() {
        let hub = Hub::new(HubConfig::default());
        let app = app(Arc::clone(&hub));

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        hub.sessions().create_or_touch("gone", Instant::now());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/")
                    .header(MCP_SESSION_ID, "gone")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(hub.sessions().get("gone").is_none());
    }

    #[tokio::test]
    async fn progress_token_with_sse_accept_upgrades_the_post() {
        let response = test_app()
            .oneshot(post(
                &json!({
                    "jsonrpc": "2.0",
                    "id": 4,
                    "method": "tools/call",
                    "params": {
                        "name": "missing_tool",
                        "arguments": {},
                        "_meta": {"progressToken": "p1"}
                    }
                }),
                "application/json, text/event-stream",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        // The stream terminates with the final (here: not-found) response.
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        let data_line = text
            .lines()
            .find(|line| line.starts_with("data: "))
            .expect("stream carries a data line");
        let payload: Value = serde_json::from_str(&data_line["data: ".len()..]).unwrap();
        assert_eq!(payload["id"], json!(4));
        assert_eq!(payload["error"]["code"], json!(-32602));
    }
}
