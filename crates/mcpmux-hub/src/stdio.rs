//! Downstream stdio endpoint.
//!
//! Bidirectional LSP-style framing (`Content-Length: N\r\n\r\n<body>`) over
//! stdin/stdout. Stdout carries protocol frames only; logs go to stderr.
//! One implicit session represents the stdio peer, wired into the fan-out so
//! progress and list-changed notifications reach it like any HTTP session.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use mcpmux_protocol::{JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcResponse};
use mcpmux_transport::{LspCodec, LspFrame};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::HubError;
use crate::hub::Hub;

/// The implicit session id of the stdio peer.
pub const STDIO_SESSION_ID: &str = "stdio";

const WRITER_QUEUE_CAPACITY: usize = 256;

/// Serve the hub over this process's stdin/stdout until the peer closes
/// stdin or the hub shuts down.
///
/// # Errors
///
/// Propagates unrecoverable stdin/stdout failures.
pub async fn serve(hub: Arc<Hub>) -> Result<(), HubError> {
    serve_io(hub, tokio::io::stdin(), tokio::io::stdout()).await
}

/// As [`serve`], over arbitrary streams (tests use an in-memory duplex).
///
/// # Errors
///
/// See [`serve`].
pub async fn serve_io<R, W>(hub: Arc<Hub>, reader: R, writer: W) -> Result<(), HubError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = FramedRead::new(reader, LspCodec::new());
    let mut sink = FramedWrite::new(writer, LspCodec::new());

    hub.sessions()
        .create_or_touch(STDIO_SESSION_ID, Instant::now());
    let mut fanout_rx = hub.fanout().register_client(STDIO_SESSION_ID);

    // All outbound frames funnel through one channel so responses and
    // notifications interleave without tearing.
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(WRITER_QUEUE_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if let Err(error) = sink.send(value.to_string()).await {
                warn!(%error, "stdout write failed, stopping stdio writer");
                break;
            }
        }
    });

    // Notifications from the fan-out ride the same writer. Stdio has no SSE
    // event names; the JSON-RPC payload is the frame.
    let notify_tx = out_tx.clone();
    let notify_task = tokio::spawn(async move {
        while let Some(frame) = fanout_rx.recv().await {
            if notify_tx.send(frame.data).await.is_err() {
                break;
            }
        }
    });

    let shutdown = hub.shutdown_token();
    let router = hub.router();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(LspFrame::Message(body))) => {
                    match JsonRpcMessage::from_slice(body.as_bytes()) {
                        Ok(message) => {
                            let router = Arc::clone(&router);
                            let out_tx = out_tx.clone();
                            tokio::spawn(async move {
                                if let Some(response) =
                                    router.handle_message(STDIO_SESSION_ID, message).await
                                {
                                    let value = serde_json::to_value(&response)
                                        .unwrap_or(Value::Null);
                                    let _ = out_tx.send(value).await;
                                }
                            });
                        }
                        Err(error) => {
                            // Framing was intact but the body is not a
                            // JSON-RPC message.
                            let response = match serde_json::from_str::<Value>(&body)
                                .ok()
                                .and_then(|value| {
                                    value
                                        .get("id")
                                        .and_then(mcpmux_protocol::RequestId::from_value)
                                }) {
                                Some(id) => JsonRpcResponse::error(
                                    id,
                                    JsonRpcError::new(
                                        JsonRpcErrorCode::InvalidRequest,
                                        error.to_string(),
                                    ),
                                ),
                                None => JsonRpcResponse::parse_error(error.to_string()),
                            };
                            let value = serde_json::to_value(&response).unwrap_or(Value::Null);
                            let _ = out_tx.send(value).await;
                        }
                    }
                }
                Some(Ok(LspFrame::Malformed { id })) => {
                    // Broken framing: answer when an id could be scavenged,
                    // otherwise resume at the next header silently.
                    match id {
                        Some(id) => {
                            let response = JsonRpcResponse::error(
                                id,
                                JsonRpcError::new(
                                    JsonRpcErrorCode::ParseError,
                                    "malformed frame",
                                ),
                            );
                            let value = serde_json::to_value(&response).unwrap_or(Value::Null);
                            let _ = out_tx.send(value).await;
                        }
                        None => debug!("malformed stdio frame discarded"),
                    }
                }
                Some(Err(error)) => {
                    warn!(%error, "stdin read failed");
                    break;
                }
                None => {
                    debug!("stdio peer closed stdin");
                    break;
                }
            }
        }
    }

    // Downstream disconnect: cancel this session's pending work and drop
    // its sink.
    router.cancel_session(STDIO_SESSION_ID);
    hub.fanout().unregister_client(STDIO_SESSION_ID);
    hub.sessions().delete(STDIO_SESSION_ID);
    drop(out_tx);
    notify_task.abort();
    let _ = writer_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn frame(value: &Value) -> Vec<u8> {
        let body = value.to_string();
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[tokio::test]
    async fn framed_request_gets_framed_response() {
        let hub = Hub::new(HubConfig::default());
        let (client_side, hub_side) = tokio::io::duplex(64 * 1024);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let (client_read, mut client_write) = tokio::io::split(client_side);

        let server = tokio::spawn(serve_io(hub, hub_read, hub_write));

        client_write
            .write_all(&frame(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})))
            .await
            .unwrap();

        let mut frames = FramedRead::new(client_read, LspCodec::new());
        let response = match frames.next().await.unwrap().unwrap() {
            LspFrame::Message(body) => serde_json::from_str::<Value>(&body).unwrap(),
            other => panic!("expected message, got {other:?}"),
        };
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"], json!({}));

        // Closing stdin ends the serve loop.
        client_write.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_with_id_gets_parse_error() {
        let hub = Hub::new(HubConfig::default());
        let (client_side, hub_side) = tokio::io::duplex(64 * 1024);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let (client_read, mut client_write) = tokio::io::split(client_side);

        let server = tokio::spawn(serve_io(hub, hub_read, hub_write));

        client_write
            .write_all(b"Content-Weight: 3\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"x\"}")
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();

        let mut frames = FramedRead::new(client_read, LspCodec::new());
        let response = match frames.next().await.unwrap().unwrap() {
            LspFrame::Message(body) => serde_json::from_str::<Value>(&body).unwrap(),
            other => panic!("expected message, got {other:?}"),
        };
        assert_eq!(response["id"], json!(5));
        assert_eq!(response["error"]["code"], json!(-32700));
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn list_changed_notifications_reach_the_stdio_peer() {
        let hub = Hub::new(HubConfig::default());
        let (client_side, hub_side) = tokio::io::duplex(64 * 1024);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let (client_read, mut client_write) = tokio::io::split(client_side);

        let server = tokio::spawn(serve_io(Arc::clone(&hub), hub_read, hub_write));
        // Wait for the serve loop to register its fan-out sink.
        while hub.fanout().client_count() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // A registry mutation emits a list-changed that must arrive framed.
        hub.registry().register_server_tools(
            "fs",
            &[serde_json::from_value(json!({"name": "read_file"})).unwrap()],
        );

        let mut frames = FramedRead::new(client_read, LspCodec::new());
        let notification = match frames.next().await.unwrap().unwrap() {
            LspFrame::Message(body) => serde_json::from_str::<Value>(&body).unwrap(),
            other => panic!("expected message, got {other:?}"),
        };
        assert_eq!(notification["method"], "notifications/tools/list_changed");

        client_write.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }
}
